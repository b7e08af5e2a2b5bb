/// Status API routes
use crate::handlers::{
    anomaly_stats, collector_health, drone_health, drone_status, get_drone, get_series,
    list_anomalies, list_drones, CollectorState, DroneState,
};
use axum::{routing::get, Router};

/// Build the drone status router
pub fn build_drone_router(state: DroneState) -> Router {
    Router::new()
        .route("/health", get(drone_health))
        .route("/status", get(drone_status))
        .with_state(state)
}

/// Build the collector status router
pub fn build_collector_router(state: CollectorState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(collector_health))
        // Drone history
        .route("/drones", get(list_drones))
        .route("/drones/:id", get(get_drone))
        .route("/series", get(get_series))
        // Anomaly log
        .route("/anomalies", get(list_anomalies))
        .route("/anomalies/stats", get(anomaly_stats))
        .with_state(state)
}
