/// Domain models shared by sensor, drone and collector
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// Full charge; battery levels never exceed it
pub const MAX_BATTERY_LEVEL: u8 = 100;

/// Operational mode of a drone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DroneStatus {
    Active,
    #[serde(rename = "Returning to Base")]
    ReturningToBase,
}

impl fmt::Display for DroneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DroneStatus::Active => write!(f, "Active"),
            DroneStatus::ReturningToBase => write!(f, "Returning to Base"),
        }
    }
}

/// Raw environmental reading produced by a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Reading plus the anomaly tags the validator attached to it
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedReading {
    pub reading: Reading,
    pub anomalies: Vec<String>,
}

/// Aggregated payload a drone forwards once per cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub drone_id: String,
    pub avg_temperature: f64,
    pub avg_humidity: f64,
    pub anomalies: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub drone_status: DroneStatus,
    pub battery_level: u8,
    pub connected_sensors: BTreeSet<String>,
}

/// Status-only message, independent of sensor data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub drone_id: String,
    pub drone_status: DroneStatus,
    pub battery_level: u8,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_sensors: Option<BTreeSet<String>>,
}

/// Everything a drone may send to the collector, discriminated by `kind`.
///
/// Untagged messages are accepted too: a message carrying averaged metrics
/// is a summary, anything else a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UplinkMessage {
    Summary(Summary),
    Heartbeat(Heartbeat),
}

impl<'de> Deserialize<'de> for UplinkMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = match value.get("kind") {
            Some(kind) => kind
                .as_str()
                .ok_or_else(|| D::Error::custom("kind must be a string"))?,
            None if value.get("avg_temperature").is_some() || value.get("avg_humidity").is_some() => {
                "summary"
            }
            None => "heartbeat",
        };
        let message = match kind {
            "summary" => Summary::deserialize(&value)
                .map(UplinkMessage::Summary)
                .map_err(D::Error::custom)?,
            "heartbeat" => Heartbeat::deserialize(&value)
                .map(UplinkMessage::Heartbeat)
                .map_err(D::Error::custom)?,
            other => return Err(D::Error::unknown_variant(other, &["summary", "heartbeat"])),
        };
        if message.battery_level() > MAX_BATTERY_LEVEL {
            return Err(D::Error::custom(format!(
                "battery_level {} exceeds {}",
                message.battery_level(),
                MAX_BATTERY_LEVEL
            )));
        }
        Ok(message)
    }
}

impl UplinkMessage {
    pub fn drone_id(&self) -> &str {
        match self {
            UplinkMessage::Summary(s) => &s.drone_id,
            UplinkMessage::Heartbeat(h) => &h.drone_id,
        }
    }

    pub fn drone_status(&self) -> DroneStatus {
        match self {
            UplinkMessage::Summary(s) => s.drone_status,
            UplinkMessage::Heartbeat(h) => h.drone_status,
        }
    }

    pub fn battery_level(&self) -> u8 {
        match self {
            UplinkMessage::Summary(s) => s.battery_level,
            UplinkMessage::Heartbeat(h) => h.battery_level,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            UplinkMessage::Summary(s) => s.timestamp,
            UplinkMessage::Heartbeat(h) => h.timestamp,
        }
    }

    pub fn connected_sensors(&self) -> Option<&BTreeSet<String>> {
        match self {
            UplinkMessage::Summary(s) => Some(&s.connected_sensors),
            UplinkMessage::Heartbeat(h) => h.connected_sensors.as_ref(),
        }
    }

    /// Averaged temperature and humidity, present only on summaries
    pub fn metrics(&self) -> Option<(f64, f64)> {
        match self {
            UplinkMessage::Summary(s) => Some((s.avg_temperature, s.avg_humidity)),
            UplinkMessage::Heartbeat(_) => None,
        }
    }

    pub fn anomalies(&self) -> &[String] {
        match self {
            UplinkMessage::Summary(s) => &s.anomalies,
            UplinkMessage::Heartbeat(_) => &[],
        }
    }
}

/// Battery charge and mode of one drone process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OperationalState {
    pub battery_level: u8,
    pub mode: DroneStatus,
}

impl Default for OperationalState {
    fn default() -> Self {
        Self {
            battery_level: 100,
            mode: DroneStatus::Active,
        }
    }
}

/// Fixed-capacity FIFO series; the oldest entry is evicted first
#[derive(Debug, Clone, PartialEq)]
pub struct RollingSeries<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingSeries<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }
}

impl<T: Clone> RollingSeries<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<T: Serialize> Serialize for RollingSeries<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.iter())
    }
}

/// Temperature, humidity and timestamp series kept in lockstep
#[derive(Debug, Clone, Serialize)]
pub struct MetricSeries {
    pub temperature: RollingSeries<f64>,
    pub humidity: RollingSeries<f64>,
    pub timestamps: RollingSeries<DateTime<Utc>>,
}

impl MetricSeries {
    pub fn new(capacity: usize) -> Self {
        Self {
            temperature: RollingSeries::new(capacity),
            humidity: RollingSeries::new(capacity),
            timestamps: RollingSeries::new(capacity),
        }
    }

    pub fn push(&mut self, temperature: f64, humidity: f64, timestamp: DateTime<Utc>) {
        self.temperature.push(temperature);
        self.humidity.push(humidity);
        self.timestamps.push(timestamp);
    }

    pub fn len(&self) -> usize {
        self.temperature.len()
    }
}

/// Collector-side state of one drone; never deleted
#[derive(Debug, Clone, Serialize)]
pub struct DroneRecord {
    pub drone_id: String,
    #[serde(flatten)]
    pub series: MetricSeries,
    pub battery_level: u8,
    pub status: DroneStatus,
    pub connected_sensors: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
    pub message_count: u64,
}

impl DroneRecord {
    pub fn new(drone_id: &str, capacity: usize, first_seen: DateTime<Utc>) -> Self {
        Self {
            drone_id: drone_id.to_string(),
            series: MetricSeries::new(capacity),
            battery_level: 0,
            status: DroneStatus::Active,
            connected_sensors: BTreeSet::new(),
            last_seen: first_seen,
            message_count: 0,
        }
    }
}

/// Compact per-drone view for listings
#[derive(Debug, Clone, Serialize)]
pub struct DroneOverview {
    pub drone_id: String,
    pub battery_level: u8,
    pub status: DroneStatus,
    pub connected_sensors: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
    pub message_count: u64,
    pub latest_temperature: Option<f64>,
    pub latest_humidity: Option<f64>,
}

impl From<&DroneRecord> for DroneOverview {
    fn from(record: &DroneRecord) -> Self {
        Self {
            drone_id: record.drone_id.clone(),
            battery_level: record.battery_level,
            status: record.status,
            connected_sensors: record.connected_sensors.clone(),
            last_seen: record.last_seen,
            message_count: record.message_count,
            latest_temperature: record.series.temperature.last().copied(),
            latest_humidity: record.series.humidity.last().copied(),
        }
    }
}

/// One anomaly reported by a drone; append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub drone_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnomalyStats {
    pub total: usize,
    pub temperature: usize,
    pub humidity: usize,
}

/// Health check response
#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub role: &'static str,
    pub now: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_summary() -> Summary {
        Summary {
            drone_id: "drone1".to_string(),
            avg_temperature: 22.0,
            avg_humidity: 55.25,
            anomalies: vec!["Temperature anomaly detected: 40.5°C from sensor2".to_string()],
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap(),
            drone_status: DroneStatus::Active,
            battery_level: 87,
            connected_sensors: ["sensor1".to_string(), "sensor2".to_string()]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_summary_survives_wire_encoding() {
        let message = UplinkMessage::Summary(sample_summary());
        let json = serde_json::to_string(&message).unwrap();
        let parsed: UplinkMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_summary_uses_legacy_field_names() {
        let json = serde_json::to_value(UplinkMessage::Summary(sample_summary())).unwrap();
        assert_eq!(json["kind"], "summary");
        assert_eq!(json["drone_status"], "Active");
        assert_eq!(json["avg_humidity"], 55.25);
        assert_eq!(json["timestamp"], "2024-05-01T12:00:30Z");
        assert_eq!(json["connected_sensors"][1], "sensor2");
    }

    #[test]
    fn test_returning_to_base_wire_name() {
        let json = serde_json::to_string(&DroneStatus::ReturningToBase).unwrap();
        assert_eq!(json, "\"Returning to Base\"");
    }

    #[test]
    fn test_heartbeat_without_sensors_parses() {
        let raw = r#"{"kind":"heartbeat","drone_id":"d7","drone_status":"Returning to Base","battery_level":40,"timestamp":"2024-05-01T12:00:00Z"}"#;
        let parsed: UplinkMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.drone_id(), "d7");
        assert_eq!(parsed.drone_status(), DroneStatus::ReturningToBase);
        assert!(parsed.metrics().is_none());
        assert!(parsed.connected_sensors().is_none());
    }

    #[test]
    fn test_untagged_message_classified_by_metrics() {
        let status_only = r#"{"drone_id":"d1","drone_status":"Active","battery_level":40,"timestamp":"2024-05-01T12:00:00Z"}"#;
        let parsed: UplinkMessage = serde_json::from_str(status_only).unwrap();
        assert!(matches!(parsed, UplinkMessage::Heartbeat(_)));

        let averaged = r#"{"drone_id":"d1","avg_temperature":21.5,"avg_humidity":48.0,"anomalies":[],"timestamp":"2024-05-01T12:00:00Z","drone_status":"Active","battery_level":40,"connected_sensors":["s1"]}"#;
        let parsed: UplinkMessage = serde_json::from_str(averaged).unwrap();
        assert_eq!(parsed.metrics(), Some((21.5, 48.0)));
    }

    #[test]
    fn test_battery_level_above_full_is_rejected() {
        let heartbeat = r#"{"kind":"heartbeat","drone_id":"d1","drone_status":"Active","battery_level":250,"timestamp":"2024-05-01T12:00:00Z"}"#;
        assert!(serde_json::from_str::<UplinkMessage>(heartbeat).is_err());

        let mut json = serde_json::to_value(UplinkMessage::Summary(sample_summary())).unwrap();
        json["battery_level"] = serde_json::json!(101);
        assert!(serde_json::from_value::<UplinkMessage>(json.clone()).is_err());
        json["battery_level"] = serde_json::json!(100);
        assert!(serde_json::from_value::<UplinkMessage>(json).is_ok());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let raw = r#"{"kind":"telemetry","drone_id":"d1","drone_status":"Active","battery_level":40,"timestamp":"2024-05-01T12:00:00Z"}"#;
        assert!(serde_json::from_str::<UplinkMessage>(raw).is_err());
    }

    #[test]
    fn test_summary_missing_metric_is_rejected() {
        let raw = r#"{"kind":"summary","drone_id":"d1","avg_temperature":21.5,"anomalies":[],"timestamp":"2024-05-01T12:00:00Z","drone_status":"Active","battery_level":40,"connected_sensors":[]}"#;
        assert!(serde_json::from_str::<UplinkMessage>(raw).is_err());
    }

    #[test]
    fn test_rolling_series_evicts_oldest() {
        let mut series = RollingSeries::new(3);
        for v in 1..=5 {
            series.push(v);
        }
        assert_eq!(series.to_vec(), vec![3, 4, 5]);
        assert_eq!(series.len(), series.capacity());
    }

    #[test]
    fn test_reading_requires_all_fields() {
        let raw = r#"{"sensor_id":"s1","temperature":21.5,"timestamp":"2024-05-01T12:00:00Z"}"#;
        assert!(serde_json::from_str::<Reading>(raw).is_err());
    }
}
