/// Application configuration module
use crate::errors::{RelayError, RelayResult};
use crate::utils::parse_range;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Inclusive normal range for one metric
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Range {
    pub low: f64,
    pub high: f64,
}

impl Range {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value <= self.high
    }
}

#[derive(Clone, Debug)]
pub struct AnomalyRanges {
    pub temperature: Range,
    pub humidity: Range,
}

impl Default for AnomalyRanges {
    fn default() -> Self {
        Self {
            temperature: Range::new(15.0, 35.0),
            humidity: Range::new(30.0, 70.0),
        }
    }
}

/// Battery simulation parameters
#[derive(Clone, Debug)]
pub struct BatteryPolicy {
    pub drain_rate: u8,
    pub charge_rate: u8,
    pub threshold: u8,
    pub tick: Duration,
}

impl Default for BatteryPolicy {
    fn default() -> Self {
        Self {
            drain_rate: 1,
            charge_rate: 5,
            threshold: 20,
            tick: Duration::from_secs(10),
        }
    }
}

/// Timeouts bounding every blocking point
#[derive(Clone, Debug)]
pub struct IoTimeouts {
    pub lock: Duration,
    pub send: Duration,
    pub connect: Duration,
}

impl Default for IoTimeouts {
    fn default() -> Self {
        Self {
            lock: Duration::from_millis(2000),
            send: Duration::from_secs(5),
            connect: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SensorConfig {
    pub drone_host: String,
    pub drone_port: u16,
    pub sensor_id: String,
    pub interval: Duration,
    pub anomaly_frequency: u32,
    pub retry_delay: Duration,
    pub timeouts: IoTimeouts,
}

#[derive(Clone, Debug)]
pub struct DroneConfig {
    pub drone_id: String,
    pub listen_port: u16,
    pub central_host: String,
    pub central_port: u16,
    pub status_port: u16,
    pub battery: BatteryPolicy,
    pub ranges: AnomalyRanges,
    pub aggregation_interval: Duration,
    pub heartbeat_interval: Duration,
    pub sensor_read_timeout: Duration,
    pub history_capacity: usize,
    pub timeouts: IoTimeouts,
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub listen_port: u16,
    pub status_port: u16,
    pub history_capacity: usize,
    pub timeouts: IoTimeouts,
}

impl SensorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> RelayResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            drone_host: lookup("SENSOR_DRONE_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            drone_port: parse_or(&lookup, "SENSOR_DRONE_PORT", 8888)?,
            sensor_id: lookup("SENSOR_ID").unwrap_or_else(|| "sensor1".to_string()),
            interval: secs(&lookup, "SENSOR_INTERVAL_SECONDS", 5)?,
            anomaly_frequency: parse_or(&lookup, "SENSOR_ANOMALY_FREQUENCY", 20)?,
            retry_delay: secs(&lookup, "SENSOR_RETRY_SECONDS", 5)?,
            timeouts: timeouts(&lookup)?,
        };

        if config.anomaly_frequency == 0 {
            return Err(RelayError::Config(
                "SENSOR_ANOMALY_FREQUENCY must be at least 1".to_string(),
            ));
        }
        if config.sensor_id.is_empty() {
            return Err(RelayError::Config("SENSOR_ID must not be empty".to_string()));
        }
        Ok(config)
    }

    pub fn drone_addr(&self) -> String {
        format!("{}:{}", self.drone_host, self.drone_port)
    }
}

impl DroneConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> RelayResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AnomalyRanges::default();
        let battery = BatteryPolicy {
            drain_rate: parse_or(&lookup, "BATTERY_DRAIN_RATE", 1)?,
            charge_rate: parse_or(&lookup, "BATTERY_CHARGE_RATE", 5)?,
            threshold: parse_or(&lookup, "BATTERY_THRESHOLD", 20)?,
            tick: secs(&lookup, "BATTERY_TICK_SECONDS", 10)?,
        };

        if battery.threshold >= 100 {
            return Err(RelayError::Config(
                "BATTERY_THRESHOLD must be below 100".to_string(),
            ));
        }
        if battery.drain_rate == 0 || battery.charge_rate == 0 {
            return Err(RelayError::Config(
                "BATTERY_DRAIN_RATE and BATTERY_CHARGE_RATE must be positive".to_string(),
            ));
        }

        let config = Self {
            drone_id: lookup("DRONE_ID").unwrap_or_else(|| "drone1".to_string()),
            listen_port: parse_or(&lookup, "DRONE_LISTEN_PORT", 8888)?,
            central_host: lookup("CENTRAL_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            central_port: parse_or(&lookup, "CENTRAL_PORT", 6000)?,
            status_port: parse_or(&lookup, "DRONE_STATUS_PORT", 8081)?,
            battery,
            ranges: AnomalyRanges {
                temperature: range_or(&lookup, "ANOMALY_TEMP_RANGE", defaults.temperature)?,
                humidity: range_or(&lookup, "ANOMALY_HUMIDITY_RANGE", defaults.humidity)?,
            },
            aggregation_interval: secs(&lookup, "AGGREGATION_INTERVAL_SECONDS", 5)?,
            heartbeat_interval: secs(&lookup, "HEARTBEAT_INTERVAL_SECONDS", 10)?,
            sensor_read_timeout: secs(&lookup, "SENSOR_READ_TIMEOUT_SECONDS", 10)?,
            history_capacity: capacity(&lookup, "DRONE_HISTORY_CAPACITY")?,
            timeouts: timeouts(&lookup)?,
        };

        if config.drone_id.is_empty() {
            return Err(RelayError::Config("DRONE_ID must not be empty".to_string()));
        }
        Ok(config)
    }

    pub fn central_addr(&self) -> String {
        format!("{}:{}", self.central_host, self.central_port)
    }
}

impl CollectorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> RelayResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            listen_port: parse_or(&lookup, "COLLECTOR_LISTEN_PORT", 6000)?,
            status_port: parse_or(&lookup, "COLLECTOR_STATUS_PORT", 3000)?,
            history_capacity: capacity(&lookup, "HISTORY_CAPACITY")?,
            timeouts: timeouts(&lookup)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> RelayResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RelayError::Config(format!("{key} has invalid value {raw:?}"))),
        None => Ok(default),
    }
}

fn secs<F>(lookup: &F, key: &str, default: u64) -> RelayResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_or(lookup, key, default)?;
    if value == 0 {
        return Err(RelayError::Config(format!("{key} must be positive")));
    }
    Ok(Duration::from_secs(value))
}

fn capacity<F>(lookup: &F, key: &str) -> RelayResult<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let value: usize = parse_or(lookup, key, 100)?;
    if value == 0 {
        return Err(RelayError::Config(format!("{key} must be positive")));
    }
    Ok(value)
}

fn range_or<F>(lookup: &F, key: &str, default: Range) -> RelayResult<Range>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match parse_range(&raw) {
        Some((low, high)) if low <= high => Ok(Range::new(low, high)),
        _ => Err(RelayError::Config(format!(
            "{key} must be \"low,high\" with low <= high, got {raw:?}"
        ))),
    }
}

fn timeouts<F>(lookup: &F) -> RelayResult<IoTimeouts>
where
    F: Fn(&str) -> Option<String>,
{
    let lock_ms: u64 = parse_or(lookup, "LOCK_TIMEOUT_MS", 2000)?;
    if lock_ms == 0 {
        return Err(RelayError::Config("LOCK_TIMEOUT_MS must be positive".to_string()));
    }
    Ok(IoTimeouts {
        lock: Duration::from_millis(lock_ms),
        send: secs(lookup, "SEND_TIMEOUT_SECONDS", 5)?,
        connect: secs(lookup, "CONNECT_TIMEOUT_SECONDS", 5)?,
    })
}
