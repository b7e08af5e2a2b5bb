/// HTTP request handlers for the read-only status APIs
use crate::domain::{
    AnomalyRecord, AnomalyStats, DroneOverview, DroneRecord, DroneStatus, Health, MetricSeries,
};
use crate::errors::{RelayError, RelayResult};
use crate::repo::{BufferSnapshot, HistoryRepo, TelemetryBuffer};
use crate::services::OperationalStateMachine;
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

/// Drone status API state
#[derive(Clone)]
pub struct DroneState {
    pub drone_id: Arc<str>,
    pub buffer: Arc<TelemetryBuffer>,
    pub state: Arc<OperationalStateMachine>,
}

/// Collector status API state
#[derive(Clone)]
pub struct CollectorState {
    pub repo: Arc<HistoryRepo>,
}

/// Successful response wrapper
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub ok: bool,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self { ok: true, data }
    }
}

type ApiResult<T> = RelayResult<Json<SuccessResponse<T>>>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(SuccessResponse::new(data)))
}

#[derive(Serialize)]
pub struct DroneStatusView {
    pub drone_id: String,
    pub drone_status: DroneStatus,
    pub battery_level: u8,
    #[serde(flatten)]
    pub buffer: BufferSnapshot,
}

#[derive(Serialize)]
pub struct DroneList {
    pub drones: Vec<DroneOverview>,
}

#[derive(Serialize)]
pub struct DroneDetail {
    pub drone: DroneRecord,
}

#[derive(Serialize)]
pub struct SeriesView {
    pub series: MetricSeries,
}

#[derive(Serialize)]
pub struct AnomalyList {
    pub anomalies: Vec<AnomalyRecord>,
}

/// Health check handler for the drone
pub async fn drone_health() -> Json<Health> {
    Json(Health {
        status: "ok",
        role: "drone",
        now: Utc::now(),
    })
}

/// Health check handler for the collector
pub async fn collector_health() -> Json<Health> {
    Json(Health {
        status: "ok",
        role: "collector",
        now: Utc::now(),
    })
}

/// Current mode, battery and buffer contents of this drone
pub async fn drone_status(State(state): State<DroneState>) -> ApiResult<DroneStatusView> {
    let operational = state.state.snapshot().await?;
    let buffer = state.buffer.snapshot().await?;
    ok(DroneStatusView {
        drone_id: state.drone_id.to_string(),
        drone_status: operational.mode,
        battery_level: operational.battery_level,
        buffer,
    })
}

/// Overview of every drone seen by the collector
pub async fn list_drones(State(state): State<CollectorState>) -> ApiResult<DroneList> {
    ok(DroneList {
        drones: state.repo.drones().await?,
    })
}

/// Full history of one drone
pub async fn get_drone(
    Path(drone_id): Path<String>,
    State(state): State<CollectorState>,
) -> ApiResult<DroneDetail> {
    match state.repo.drone(&drone_id).await? {
        Some(drone) => ok(DroneDetail { drone }),
        None => Err(RelayError::NotFound(format!("drone {}", drone_id))),
    }
}

/// Global rolling series across all drones
pub async fn get_series(State(state): State<CollectorState>) -> ApiResult<SeriesView> {
    ok(SeriesView {
        series: state.repo.global_series().await?,
    })
}

pub async fn list_anomalies(State(state): State<CollectorState>) -> ApiResult<AnomalyList> {
    ok(AnomalyList {
        anomalies: state.repo.anomalies().await?,
    })
}

pub async fn anomaly_stats(State(state): State<CollectorState>) -> ApiResult<AnomalyStats> {
    ok(state.repo.anomaly_stats().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatteryPolicy;
    use crate::domain::{AnnotatedReading, OperationalState, Reading, Summary, UplinkMessage};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(200);

    fn collector_state() -> CollectorState {
        CollectorState {
            repo: Arc::new(HistoryRepo::new(10, WAIT)),
        }
    }

    fn summary(drone: &str, anomalies: Vec<&str>) -> UplinkMessage {
        UplinkMessage::Summary(Summary {
            drone_id: drone.to_string(),
            avg_temperature: 24.0,
            avg_humidity: 52.0,
            anomalies: anomalies.into_iter().map(String::from).collect(),
            timestamp: Utc::now(),
            drone_status: DroneStatus::Active,
            battery_level: 70,
            connected_sensors: Default::default(),
        })
    }

    #[tokio::test]
    async fn test_drone_status_reports_buffer_and_mode() {
        let buffer = Arc::new(TelemetryBuffer::new(10, WAIT));
        buffer.register_sensor("s1").await.unwrap();
        buffer
            .append(AnnotatedReading {
                reading: Reading {
                    sensor_id: "s1".to_string(),
                    temperature: 22.0,
                    humidity: 50.0,
                    timestamp: Utc::now(),
                },
                anomalies: Vec::new(),
            })
            .await
            .unwrap();
        let machine = Arc::new(OperationalStateMachine::new(
            OperationalState {
                battery_level: 15,
                mode: DroneStatus::ReturningToBase,
            },
            BatteryPolicy::default(),
            WAIT,
        ));
        let state = DroneState {
            drone_id: Arc::from("drone7"),
            buffer,
            state: machine,
        };

        let Json(body) = drone_status(State(state)).await.unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["drone_id"], "drone7");
        assert_eq!(value["drone_status"], "Returning to Base");
        assert_eq!(value["battery_level"], 15);
        assert_eq!(value["pending"], 1);
        assert_eq!(value["connected_sensors"][0], "s1");
        assert_eq!(value["series"]["temperature"][0], 22.0);
        assert_eq!(value["sensor_series"]["s1"]["temperature"][0], 22.0);
    }

    #[tokio::test]
    async fn test_unknown_drone_is_not_found() {
        let state = collector_state();
        let err = get_drone(Path("ghost".to_string()), State(state))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_collector_views() {
        let state = collector_state();
        state
            .repo
            .record(&summary(
                "d1",
                vec![
                    "Temperature anomaly detected: 40°C from s1",
                    "Humidity anomaly detected: 90% from s2",
                ],
            ))
            .await
            .unwrap();
        state.repo.record(&summary("d2", Vec::new())).await.unwrap();

        let Json(list) = list_drones(State(state.clone())).await.unwrap();
        let ids: Vec<_> = list.data.drones.iter().map(|d| d.drone_id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2"]);

        let Json(detail) = get_drone(Path("d1".to_string()), State(state.clone()))
            .await
            .unwrap();
        assert_eq!(detail.data.drone.message_count, 1);

        let Json(series) = get_series(State(state.clone())).await.unwrap();
        assert_eq!(series.data.series.len(), 2);

        let Json(anomalies) = list_anomalies(State(state.clone())).await.unwrap();
        assert_eq!(anomalies.data.anomalies.len(), 2);

        let Json(stats) = anomaly_stats(State(state)).await.unwrap();
        assert_eq!(
            stats.data,
            AnomalyStats {
                total: 2,
                temperature: 1,
                humidity: 1
            }
        );
    }

    #[tokio::test]
    async fn test_health_names_role() {
        let Json(health) = collector_health().await;
        assert_eq!(health.role, "collector");
        let Json(health) = drone_health().await;
        assert_eq!(health.status, "ok");
    }
}
