/// Business logic services layer
use crate::config::{AnomalyRanges, BatteryPolicy, Range};
use crate::domain::{
    AnnotatedReading, DroneStatus, Heartbeat, OperationalState, Reading, Summary, UplinkMessage,
    MAX_BATTERY_LEVEL,
};
use crate::errors::{RelayError, RelayResult};
use crate::repo::{HistoryRepo, TelemetryBuffer};
use crate::shutdown::Shutdown;
use crate::utils::{lock_bounded, mean, round2};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const STATE_LOCK: &str = "operational state";

/// Classify a reading against the normal ranges; bounds are inclusive
pub fn validate(reading: &Reading, temperature: Range, humidity: Range) -> Vec<String> {
    let mut anomalies = Vec::new();
    if !temperature.contains(reading.temperature) {
        anomalies.push(format!(
            "Temperature anomaly detected: {}°C from {}",
            reading.temperature, reading.sensor_id
        ));
    }
    if !humidity.contains(reading.humidity) {
        anomalies.push(format!(
            "Humidity anomaly detected: {}% from {}",
            reading.humidity, reading.sensor_id
        ));
    }
    anomalies
}

pub fn annotate(reading: Reading, ranges: &AnomalyRanges) -> AnnotatedReading {
    let anomalies = validate(&reading, ranges.temperature, ranges.humidity);
    AnnotatedReading { reading, anomalies }
}

/// Build the per-cycle summary; `None` when nothing was drained
pub fn summarize(
    drone_id: &str,
    drained: &[AnnotatedReading],
    state: OperationalState,
    connected_sensors: BTreeSet<String>,
) -> Option<Summary> {
    let avg_temperature = mean(drained.iter().map(|r| r.reading.temperature))?;
    let avg_humidity = mean(drained.iter().map(|r| r.reading.humidity))?;
    let anomalies = drained
        .iter()
        .flat_map(|r| r.anomalies.iter().cloned())
        .collect();

    Some(Summary {
        drone_id: drone_id.to_string(),
        avg_temperature: round2(avg_temperature),
        avg_humidity: round2(avg_humidity),
        anomalies,
        timestamp: Utc::now(),
        drone_status: state.mode,
        battery_level: state.battery_level,
        connected_sensors,
    })
}

/// Apply one battery tick; returns the new mode when it changed
pub fn apply_tick(state: &mut OperationalState, policy: &BatteryPolicy) -> Option<DroneStatus> {
    match state.mode {
        DroneStatus::Active => {
            state.battery_level = state.battery_level.saturating_sub(policy.drain_rate);
            if state.battery_level <= policy.threshold {
                state.mode = DroneStatus::ReturningToBase;
                return Some(state.mode);
            }
        }
        DroneStatus::ReturningToBase => {
            state.battery_level = state
                .battery_level
                .saturating_add(policy.charge_rate)
                .min(MAX_BATTERY_LEVEL);
            if state.battery_level >= MAX_BATTERY_LEVEL {
                state.mode = DroneStatus::Active;
                return Some(state.mode);
            }
        }
    }
    None
}

/// Battery-driven Active / ReturningToBase state machine.
///
/// Readers poll `mode()`; every change is also published on a watch channel.
pub struct OperationalStateMachine {
    state: Mutex<OperationalState>,
    policy: BatteryPolicy,
    lock_timeout: Duration,
    status_tx: watch::Sender<OperationalState>,
}

impl OperationalStateMachine {
    pub fn new(initial: OperationalState, policy: BatteryPolicy, lock_timeout: Duration) -> Self {
        let (status_tx, _) = watch::channel(initial);
        Self {
            state: Mutex::new(initial),
            policy,
            lock_timeout,
            status_tx,
        }
    }

    /// Status-change notifications
    pub fn subscribe(&self) -> watch::Receiver<OperationalState> {
        self.status_tx.subscribe()
    }

    #[cfg(test)]
    pub(crate) async fn hold_lock(&self, duration: Duration) {
        let _state = self.state.lock().await;
        tokio::time::sleep(duration).await;
    }

    pub async fn snapshot(&self) -> RelayResult<OperationalState> {
        let state = lock_bounded(&self.state, self.lock_timeout, STATE_LOCK).await?;
        Ok(*state)
    }

    pub async fn mode(&self) -> RelayResult<DroneStatus> {
        Ok(self.snapshot().await?.mode)
    }

    pub async fn tick(&self) -> RelayResult<Option<DroneStatus>> {
        let (changed, state) = {
            let mut state = lock_bounded(&self.state, self.lock_timeout, STATE_LOCK).await?;
            let changed = apply_tick(&mut state, &self.policy);
            (changed, *state)
        };
        match changed {
            Some(DroneStatus::ReturningToBase) => warn!(
                "Battery level ({}%) at or below threshold ({}%). Returning to base.",
                state.battery_level, self.policy.threshold
            ),
            Some(DroneStatus::Active) => info!("Battery fully charged. Drone is now active."),
            None => {}
        }
        self.status_tx.send_replace(state);
        Ok(changed)
    }

    pub async fn force_return_to_base(&self) -> RelayResult<()> {
        self.set_mode(DroneStatus::ReturningToBase).await?;
        info!("Manually triggered return to base");
        Ok(())
    }

    pub async fn resume(&self) -> RelayResult<()> {
        self.set_mode(DroneStatus::Active).await?;
        info!("Manually resumed normal operation");
        Ok(())
    }

    /// Override the charge; the mode is re-evaluated on the next tick
    pub async fn set_battery_level(&self, level: u8) -> RelayResult<()> {
        if level > MAX_BATTERY_LEVEL {
            return Err(RelayError::InvalidInput(format!(
                "battery level must be between 0 and {MAX_BATTERY_LEVEL}, got {level}"
            )));
        }
        let state = {
            let mut state = lock_bounded(&self.state, self.lock_timeout, STATE_LOCK).await?;
            state.battery_level = level;
            *state
        };
        self.status_tx.send_replace(state);
        info!("Battery level manually set to {}%", level);
        Ok(())
    }

    async fn set_mode(&self, mode: DroneStatus) -> RelayResult<()> {
        let state = {
            let mut state = lock_bounded(&self.state, self.lock_timeout, STATE_LOCK).await?;
            state.mode = mode;
            *state
        };
        self.status_tx.send_replace(state);
        Ok(())
    }

    /// One tick per policy interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        info!(
            "Starting battery simulation (tick: {:?}, drain: {}%, charge: {}%)",
            self.policy.tick, self.policy.drain_rate, self.policy.charge_rate
        );
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.policy.tick,
            self.policy.tick,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Battery tick skipped: {}", e);
                    }
                }
                _ = shutdown.wait() => {
                    info!("Battery simulation shutting down");
                    break;
                }
            }
        }
    }
}

/// Drone-side aggregation: drains the buffer into uplink summaries
pub struct AggregationService {
    drone_id: String,
    buffer: Arc<TelemetryBuffer>,
    state: Arc<OperationalStateMachine>,
}

/// Outcome of one aggregation cycle
#[derive(Debug)]
pub enum Cycle {
    /// Nothing to send: empty buffer
    Idle,
    /// ReturningToBase; the buffer was left untouched
    Suspended,
    Ready { summary: Summary, readings: usize },
}

impl AggregationService {
    pub fn new(
        drone_id: String,
        buffer: Arc<TelemetryBuffer>,
        state: Arc<OperationalStateMachine>,
    ) -> Self {
        Self {
            drone_id,
            buffer,
            state,
        }
    }

    pub fn drone_id(&self) -> &str {
        &self.drone_id
    }

    pub fn status_changes(&self) -> watch::Receiver<OperationalState> {
        self.state.subscribe()
    }

    pub async fn next_cycle(&self) -> RelayResult<Cycle> {
        let state = self.state.snapshot().await?;
        if state.mode == DroneStatus::ReturningToBase {
            return Ok(Cycle::Suspended);
        }
        let sensors = self.buffer.connected_sensors().await?;
        let drained = self.buffer.drain_all().await?;
        Ok(match summarize(&self.drone_id, &drained, state, sensors) {
            Some(summary) => Cycle::Ready {
                summary,
                readings: drained.len(),
            },
            None => Cycle::Idle,
        })
    }

    pub async fn heartbeat(&self) -> RelayResult<Heartbeat> {
        let state = self.state.snapshot().await?;
        let sensors = self.buffer.connected_sensors().await?;
        Ok(Heartbeat {
            drone_id: self.drone_id.clone(),
            drone_status: state.mode,
            battery_level: state.battery_level,
            timestamp: Utc::now(),
            connected_sensors: Some(sensors),
        })
    }
}

/// Collector-side ingestion of uplink messages
pub struct CollectorService {
    repo: Arc<HistoryRepo>,
}

impl CollectorService {
    pub fn new(repo: Arc<HistoryRepo>) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &Arc<HistoryRepo> {
        &self.repo
    }

    pub async fn ingest(&self, message: &UplinkMessage) -> RelayResult<()> {
        let anomalies = self.repo.record(message).await?;

        for anomaly in &anomalies {
            warn!("Anomaly from {}: {}", anomaly.drone_id, anomaly.description);
        }
        match message {
            UplinkMessage::Summary(s) => info!(
                "Received from {}: Avg Temp={}°C, Avg Humidity={}%, Status={}, Battery={}%",
                s.drone_id, s.avg_temperature, s.avg_humidity, s.drone_status, s.battery_level
            ),
            UplinkMessage::Heartbeat(h) => info!(
                "Status update from {}: Status={}, Battery={}%",
                h.drone_id, h.drone_status, h.battery_level
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WAIT: Duration = Duration::from_millis(500);

    fn reading(temperature: f64, humidity: f64) -> Reading {
        Reading {
            sensor_id: "sensor7".to_string(),
            temperature,
            humidity,
            timestamp: Utc::now(),
        }
    }

    fn temp_range() -> Range {
        Range::new(15.0, 35.0)
    }

    fn hum_range() -> Range {
        Range::new(30.0, 70.0)
    }

    fn annotated(temperature: f64, humidity: f64, anomalies: &[&str]) -> AnnotatedReading {
        AnnotatedReading {
            reading: reading(temperature, humidity),
            anomalies: anomalies.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn machine_at(level: u8) -> OperationalStateMachine {
        OperationalStateMachine::new(
            OperationalState {
                battery_level: level,
                mode: DroneStatus::Active,
            },
            BatteryPolicy::default(),
            WAIT,
        )
    }

    proptest! {
        #[test]
        fn prop_in_range_temperature_is_clean(t in 15.0f64..=35.0) {
            prop_assert!(validate(&reading(t, 50.0), temp_range(), hum_range()).is_empty());
        }

        #[test]
        fn prop_out_of_range_temperature_is_tagged_once(
            t in prop_oneof![-60.0f64..14.99, 35.01f64..90.0]
        ) {
            let tags = validate(&reading(t, 50.0), temp_range(), hum_range());
            prop_assert_eq!(tags.len(), 1);
            prop_assert!(tags[0].starts_with("Temperature"));
            prop_assert!(tags[0].contains("sensor7"));
            let value = t.to_string();
            prop_assert!(tags[0].contains(&value));
        }
    }

    #[test]
    fn test_boundaries_are_inside() {
        for (t, h) in [(15.0, 30.0), (35.0, 70.0)] {
            assert!(validate(&reading(t, h), temp_range(), hum_range()).is_empty());
        }
    }

    #[test]
    fn test_both_metrics_out_of_range() {
        let tags = validate(&reading(40.5, 90.0), temp_range(), hum_range());
        assert_eq!(
            tags,
            vec![
                "Temperature anomaly detected: 40.5°C from sensor7".to_string(),
                "Humidity anomaly detected: 90% from sensor7".to_string(),
            ]
        );
    }

    #[test]
    fn test_summary_averages() {
        let drained = vec![annotated(20.0, 50.0, &[]), annotated(24.0, 60.0, &[])];
        let summary = summarize(
            "drone1",
            &drained,
            OperationalState::default(),
            BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(summary.avg_temperature, 22.0);
        assert_eq!(summary.avg_humidity, 55.0);
        assert_eq!(summary.battery_level, 100);
        assert_eq!(summary.drone_status, DroneStatus::Active);
    }

    #[test]
    fn test_summary_rounds_and_keeps_anomaly_order() {
        let drained = vec![
            annotated(20.0, 50.0, &["a", "b"]),
            annotated(21.0, 50.0, &[]),
            annotated(21.0, 51.0, &["c"]),
        ];
        let summary = summarize("d", &drained, OperationalState::default(), BTreeSet::new())
            .unwrap();
        assert_eq!(summary.avg_temperature, 20.67);
        assert_eq!(summary.avg_humidity, 50.33);
        assert_eq!(summary.anomalies, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_empty_drain_produces_no_summary() {
        assert!(summarize("d", &[], OperationalState::default(), BTreeSet::new()).is_none());
    }

    #[test]
    fn test_hysteresis_through_full_recharge() {
        let policy = BatteryPolicy::default();
        let mut state = OperationalState {
            battery_level: 21,
            mode: DroneStatus::Active,
        };

        assert_eq!(
            apply_tick(&mut state, &policy),
            Some(DroneStatus::ReturningToBase)
        );
        assert_eq!(state.battery_level, 20);

        for tick in 1..=16 {
            let changed = apply_tick(&mut state, &policy);
            if tick < 16 {
                assert_eq!(changed, None, "flipped early at {}%", state.battery_level);
                assert_eq!(state.mode, DroneStatus::ReturningToBase);
            } else {
                assert_eq!(changed, Some(DroneStatus::Active));
            }
            if state.battery_level == 80 {
                assert_eq!(state.mode, DroneStatus::ReturningToBase);
            }
        }
        assert_eq!(state.battery_level, 100);
        assert_eq!(state.mode, DroneStatus::Active);
    }

    #[test]
    fn test_battery_never_leaves_bounds() {
        let policy = BatteryPolicy {
            drain_rate: 30,
            charge_rate: 30,
            threshold: 0,
            tick: Duration::from_secs(1),
        };
        let mut state = OperationalState {
            battery_level: 10,
            mode: DroneStatus::Active,
        };
        apply_tick(&mut state, &policy);
        assert_eq!(state.battery_level, 0);
        assert_eq!(state.mode, DroneStatus::ReturningToBase);
        for _ in 0..4 {
            apply_tick(&mut state, &policy);
            assert!(state.battery_level <= MAX_BATTERY_LEVEL);
        }
        assert_eq!(state.battery_level, 100);
    }

    #[tokio::test]
    async fn test_machine_publishes_status_changes() {
        let machine = machine_at(21);
        let mut rx = machine.subscribe();

        assert_eq!(
            machine.tick().await.unwrap(),
            Some(DroneStatus::ReturningToBase)
        );
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().mode, DroneStatus::ReturningToBase);
    }

    #[tokio::test]
    async fn test_manual_overrides() {
        let machine = machine_at(90);
        machine.force_return_to_base().await.unwrap();
        let state = machine.snapshot().await.unwrap();
        assert_eq!(state.mode, DroneStatus::ReturningToBase);
        assert_eq!(state.battery_level, 90);

        machine.resume().await.unwrap();
        assert_eq!(machine.mode().await.unwrap(), DroneStatus::Active);

        machine.set_battery_level(5).await.unwrap();
        assert_eq!(machine.mode().await.unwrap(), DroneStatus::Active);
        machine.tick().await.unwrap();
        assert_eq!(machine.mode().await.unwrap(), DroneStatus::ReturningToBase);

        assert!(matches!(
            machine.set_battery_level(101).await,
            Err(RelayError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_run_ticks_until_shutdown() {
        let machine = Arc::new(OperationalStateMachine::new(
            OperationalState {
                battery_level: 50,
                mode: DroneStatus::Active,
            },
            BatteryPolicy {
                tick: Duration::from_millis(10),
                ..BatteryPolicy::default()
            },
            WAIT,
        ));
        let (trigger, shutdown) = crate::shutdown::channel();
        let task = tokio::spawn(machine.clone().run(shutdown));

        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(machine.snapshot().await.unwrap().battery_level < 50);
    }

    #[tokio::test]
    async fn test_cycle_is_suspended_while_returning() {
        let buffer = Arc::new(TelemetryBuffer::new(10, WAIT));
        let machine = Arc::new(machine_at(80));
        let service = AggregationService::new("d1".into(), buffer.clone(), machine.clone());

        assert!(matches!(service.next_cycle().await.unwrap(), Cycle::Idle));

        buffer.append(annotated(20.0, 50.0, &[])).await.unwrap();
        machine.force_return_to_base().await.unwrap();
        assert!(matches!(
            service.next_cycle().await.unwrap(),
            Cycle::Suspended
        ));
        assert_eq!(buffer.snapshot().await.unwrap().pending, 1);

        machine.resume().await.unwrap();
        match service.next_cycle().await.unwrap() {
            Cycle::Ready { summary, readings } => {
                assert_eq!(readings, 1);
                assert_eq!(summary.drone_id, "d1");
                assert_eq!(summary.battery_level, 80);
            }
            other => panic!("expected a summary, got {:?}", other),
        }
        assert!(matches!(service.next_cycle().await.unwrap(), Cycle::Idle));
    }

    #[tokio::test]
    async fn test_heartbeat_reflects_state() {
        let buffer = Arc::new(TelemetryBuffer::new(10, WAIT));
        buffer.register_sensor("s3").await.unwrap();
        let machine = Arc::new(machine_at(64));
        machine.force_return_to_base().await.unwrap();
        let service = AggregationService::new("d9".into(), buffer, machine);

        let heartbeat = service.heartbeat().await.unwrap();
        assert_eq!(heartbeat.drone_status, DroneStatus::ReturningToBase);
        assert_eq!(heartbeat.battery_level, 64);
        assert!(heartbeat.connected_sensors.unwrap().contains("s3"));
    }
}
