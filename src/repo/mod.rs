/// Repository layer: in-memory, volatile storage for both ends of the relay
use crate::domain::{
    AnnotatedReading, AnomalyRecord, AnomalyStats, DroneOverview, DroneRecord, MetricSeries,
    UplinkMessage,
};
use crate::errors::RelayResult;
use crate::utils::lock_bounded;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;

const BUFFER_LOCK: &str = "telemetry buffer";
const HISTORY_LOCK: &str = "collector history";

#[derive(Debug)]
struct BufferInner {
    pending: Vec<AnnotatedReading>,
    series: MetricSeries,
    sensor_series: BTreeMap<String, MetricSeries>,
    // open connections per sensor id
    sensors: BTreeMap<String, usize>,
}

/// Drone-side accumulator of readings since the last aggregation cycle.
///
/// The pending readings, the visualization series (aggregate and per sensor)
/// and the connected sensor set share one lock domain. Per-sensor series
/// outlive the sensor's connection.
#[derive(Debug)]
pub struct TelemetryBuffer {
    inner: Mutex<BufferInner>,
    lock_timeout: Duration,
}

/// Read-only copy of the buffer for status consumers
#[derive(Debug, Clone, serde::Serialize)]
pub struct BufferSnapshot {
    pub pending: usize,
    pub connected_sensors: BTreeSet<String>,
    pub series: MetricSeries,
    pub sensor_series: BTreeMap<String, MetricSeries>,
}

impl TelemetryBuffer {
    pub fn new(capacity: usize, lock_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                pending: Vec::new(),
                series: MetricSeries::new(capacity),
                sensor_series: BTreeMap::new(),
                sensors: BTreeMap::new(),
            }),
            lock_timeout,
        }
    }

    pub async fn append(&self, annotated: AnnotatedReading) -> RelayResult<()> {
        let mut inner = lock_bounded(&self.inner, self.lock_timeout, BUFFER_LOCK).await?;
        let inner = &mut *inner;
        let reading = &annotated.reading;
        let capacity = inner.series.temperature.capacity();
        inner
            .series
            .push(reading.temperature, reading.humidity, reading.timestamp);
        inner
            .sensor_series
            .entry(reading.sensor_id.clone())
            .or_insert_with(|| MetricSeries::new(capacity))
            .push(reading.temperature, reading.humidity, reading.timestamp);
        inner.pending.push(annotated);
        Ok(())
    }

    /// Empty the buffer and return what it held
    pub async fn drain_all(&self) -> RelayResult<Vec<AnnotatedReading>> {
        let mut inner = lock_bounded(&self.inner, self.lock_timeout, BUFFER_LOCK).await?;
        Ok(std::mem::take(&mut inner.pending))
    }

    /// Record one more open connection for `sensor_id`; true if it is new
    pub async fn register_sensor(&self, sensor_id: &str) -> RelayResult<bool> {
        let mut inner = lock_bounded(&self.inner, self.lock_timeout, BUFFER_LOCK).await?;
        let count = inner.sensors.entry(sensor_id.to_string()).or_insert(0);
        *count += 1;
        Ok(*count == 1)
    }

    /// Release one connection for `sensor_id`; true once none remain
    pub async fn release_sensor(&self, sensor_id: &str) -> RelayResult<bool> {
        let mut inner = lock_bounded(&self.inner, self.lock_timeout, BUFFER_LOCK).await?;
        let gone = match inner.sensors.get_mut(sensor_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if gone {
            inner.sensors.remove(sensor_id);
        }
        Ok(gone)
    }

    pub async fn connected_sensors(&self) -> RelayResult<BTreeSet<String>> {
        let inner = lock_bounded(&self.inner, self.lock_timeout, BUFFER_LOCK).await?;
        Ok(inner.sensors.keys().cloned().collect())
    }

    #[cfg(test)]
    pub(crate) async fn hold_lock(&self, duration: Duration) {
        let _inner = self.inner.lock().await;
        tokio::time::sleep(duration).await;
    }

    pub async fn snapshot(&self) -> RelayResult<BufferSnapshot> {
        let inner = lock_bounded(&self.inner, self.lock_timeout, BUFFER_LOCK).await?;
        Ok(BufferSnapshot {
            pending: inner.pending.len(),
            connected_sensors: inner.sensors.keys().cloned().collect(),
            series: inner.series.clone(),
            sensor_series: inner.sensor_series.clone(),
        })
    }
}

#[derive(Debug)]
struct HistoryInner {
    drones: HashMap<String, DroneRecord>,
    global: MetricSeries,
    anomalies: Vec<AnomalyRecord>,
}

/// Collector-side per-drone and global history behind one lock domain
#[derive(Debug)]
pub struct HistoryRepo {
    inner: Mutex<HistoryInner>,
    capacity: usize,
    lock_timeout: Duration,
}

impl HistoryRepo {
    pub fn new(capacity: usize, lock_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(HistoryInner {
                drones: HashMap::new(),
                global: MetricSeries::new(capacity),
                anomalies: Vec::new(),
            }),
            capacity,
            lock_timeout,
        }
    }

    /// Apply one uplink message and return the anomaly records it produced
    pub async fn record(&self, message: &UplinkMessage) -> RelayResult<Vec<AnomalyRecord>> {
        let mut guard = lock_bounded(&self.inner, self.lock_timeout, HISTORY_LOCK).await?;
        let inner = &mut *guard;
        let timestamp = message.timestamp();
        let drone_id = message.drone_id();

        let record = inner
            .drones
            .entry(drone_id.to_string())
            .or_insert_with(|| DroneRecord::new(drone_id, self.capacity, timestamp));

        if let Some((temperature, humidity)) = message.metrics() {
            record.series.push(temperature, humidity, timestamp);
            inner.global.push(temperature, humidity, timestamp);
        }

        record.battery_level = message.battery_level();
        record.status = message.drone_status();
        record.last_seen = timestamp;
        record.message_count += 1;
        if let Some(sensors) = message.connected_sensors() {
            record.connected_sensors = sensors.clone();
        }

        let appended: Vec<AnomalyRecord> = message
            .anomalies()
            .iter()
            .map(|description| AnomalyRecord {
                drone_id: drone_id.to_string(),
                timestamp,
                description: description.clone(),
            })
            .collect();
        inner.anomalies.extend(appended.iter().cloned());

        Ok(appended)
    }

    pub async fn drone(&self, drone_id: &str) -> RelayResult<Option<DroneRecord>> {
        let inner = lock_bounded(&self.inner, self.lock_timeout, HISTORY_LOCK).await?;
        Ok(inner.drones.get(drone_id).cloned())
    }

    /// All known drones, ordered by id
    pub async fn drones(&self) -> RelayResult<Vec<DroneOverview>> {
        let inner = lock_bounded(&self.inner, self.lock_timeout, HISTORY_LOCK).await?;
        let mut overviews: Vec<DroneOverview> =
            inner.drones.values().map(DroneOverview::from).collect();
        overviews.sort_by(|a, b| a.drone_id.cmp(&b.drone_id));
        Ok(overviews)
    }

    pub async fn global_series(&self) -> RelayResult<MetricSeries> {
        let inner = lock_bounded(&self.inner, self.lock_timeout, HISTORY_LOCK).await?;
        Ok(inner.global.clone())
    }

    pub async fn anomalies(&self) -> RelayResult<Vec<AnomalyRecord>> {
        let inner = lock_bounded(&self.inner, self.lock_timeout, HISTORY_LOCK).await?;
        Ok(inner.anomalies.clone())
    }

    pub async fn anomaly_stats(&self) -> RelayResult<AnomalyStats> {
        let inner = lock_bounded(&self.inner, self.lock_timeout, HISTORY_LOCK).await?;
        Ok(inner
            .anomalies
            .iter()
            .fold(AnomalyStats::default(), |mut stats, record| {
                let description = record.description.to_lowercase();
                stats.total += 1;
                if description.contains("temperature") {
                    stats.temperature += 1;
                } else if description.contains("humidity") {
                    stats.humidity += 1;
                }
                stats
            }))
    }
}
