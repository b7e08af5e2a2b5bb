/// Outbound TCP clients: drone uplink to the collector and the sensor simulator
use crate::config::{IoTimeouts, SensorConfig};
use crate::domain::{Reading, UplinkMessage};
use crate::errors::{RelayError, RelayResult};
use crate::protocol::write_frame;
use crate::services::{AggregationService, Cycle};
use crate::shutdown::Shutdown;
use crate::utils::round2;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Exponential reconnect delay: doubles per failure, capped, reset on success
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following call returns twice as much
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// A lazily (re)established TCP connection carrying framed messages
pub struct FramedLink {
    addr: String,
    timeouts: IoTimeouts,
    stream: Option<TcpStream>,
}

impl FramedLink {
    pub fn new(addr: String, timeouts: IoTimeouts) -> Self {
        Self {
            addr,
            timeouts,
            stream: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn connect(&mut self) -> RelayResult<()> {
        let stream = tokio::time::timeout(self.timeouts.connect, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| RelayError::Timeout(self.timeouts.connect, "connecting"))??;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Resolves once the peer closes the connection or it fails, then drops it.
    ///
    /// Peers never write on these links, so stray bytes are discarded. Safe to
    /// race in `tokio::select!`.
    pub async fn closed(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut scratch = [0u8; 512];
        loop {
            match stream.read(&mut scratch).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.stream = None;
    }

    /// Non-blocking check that the peer has not gone away; drops a dead stream
    pub fn check_alive(&mut self) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        let mut scratch = [0u8; 512];
        let alive = loop {
            match stream.try_read(&mut scratch) {
                Ok(0) => break false,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break true,
                Err(_) => break false,
            }
        };
        if !alive {
            self.stream = None;
        }
        alive
    }

    /// Send one frame; any failure drops the connection
    pub async fn send<T: Serialize>(&mut self, message: &T) -> RelayResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "link is not connected",
            )));
        };
        let result = tokio::time::timeout(self.timeouts.send, write_frame(stream, message))
            .await
            .map_err(|_| RelayError::Timeout(self.timeouts.send, "sending"))
            .and_then(|sent| sent);
        if result.is_err() {
            self.stream = None;
        }
        result
    }
}

/// Periodically drains the buffer and pushes summaries to the collector
pub struct UplinkForwarder {
    service: Arc<AggregationService>,
    link: FramedLink,
    period: Duration,
    backoff: Backoff,
}

impl UplinkForwarder {
    pub fn new(
        service: Arc<AggregationService>,
        central_addr: String,
        period: Duration,
        timeouts: IoTimeouts,
    ) -> Self {
        Self {
            service,
            link: FramedLink::new(central_addr, timeouts),
            period,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!(
            "Starting uplink to {} (interval: {:?})",
            self.link.addr(),
            self.period
        );
        loop {
            if !self.establish(&mut shutdown).await {
                break;
            }

            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while self.link.is_connected() {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => {
                        info!("Uplink shutting down");
                        return;
                    }
                    _ = self.link.closed() => {
                        warn!("Central server at {} closed the uplink, reconnecting", self.link.addr());
                    }
                    _ = interval.tick() => self.forward_cycle().await,
                }
            }
        }
        info!("Uplink shutting down");
    }

    /// Connect with backoff; false once shutdown is requested
    async fn establish(&mut self, shutdown: &mut Shutdown) -> bool {
        loop {
            if shutdown.is_triggered() {
                return false;
            }
            info!("Connecting to central server at {}...", self.link.addr());
            match self.link.connect().await {
                Ok(()) => {
                    info!("Connected to central server at {}", self.link.addr());
                    self.backoff.reset();
                    return true;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        "Could not connect to central at {}: {}; retrying in {:?}",
                        self.link.addr(),
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => return false,
                    }
                }
            }
        }
    }

    async fn forward_cycle(&mut self) {
        // never drain into a connection the collector already closed
        if !self.link.check_alive() {
            warn!("Uplink to {} lost before draining, reconnecting", self.link.addr());
            return;
        }
        let (summary, readings) = match self.service.next_cycle().await {
            Ok(Cycle::Ready { summary, readings }) => (summary, readings),
            Ok(Cycle::Idle) => {
                debug!("No sensor data this cycle");
                return;
            }
            Ok(Cycle::Suspended) => {
                debug!("Returning to base, holding buffered readings");
                return;
            }
            Err(e) => {
                warn!("Aggregation cycle skipped for {}: {}", self.service.drone_id(), e);
                return;
            }
        };

        let anomalies = summary.anomalies.len();
        let (avg_temperature, avg_humidity, battery) =
            (summary.avg_temperature, summary.avg_humidity, summary.battery_level);
        match self.link.send(&UplinkMessage::Summary(summary)).await {
            Ok(()) => {
                info!(
                    "Forwarded to central: Avg Temp={}°C, Avg Humidity={}%, Battery={}%",
                    avg_temperature, avg_humidity, battery
                );
                if anomalies > 0 {
                    info!("Forwarded anomalies: {}", anomalies);
                }
            }
            Err(e) => {
                error!(
                    "Error sending to central at {}: {}; summary of {} readings lost, reconnecting",
                    self.link.addr(),
                    e,
                    readings
                );
            }
        }
    }
}

/// Status-only messages on a connection of their own
pub struct HeartbeatSender {
    service: Arc<AggregationService>,
    link: FramedLink,
    period: Duration,
}

impl HeartbeatSender {
    pub fn new(
        service: Arc<AggregationService>,
        central_addr: String,
        period: Duration,
        timeouts: IoTimeouts,
    ) -> Self {
        Self {
            service,
            link: FramedLink::new(central_addr, timeouts),
            period,
        }
    }

    pub async fn run(mut self, mut shutdown: Shutdown) {
        info!("Starting heartbeat (interval: {:?})", self.period);
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status = self.service.status_changes();
        let mut last_mode = status.borrow_and_update().mode;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!("Heartbeat to {} failed: {}", self.link.addr(), e);
                    }
                }
                // mode changes are reported without waiting for the next tick
                Ok(()) = status.changed() => {
                    let mode = status.borrow_and_update().mode;
                    if mode != last_mode {
                        last_mode = mode;
                        info!("Drone {} is now {}", self.service.drone_id(), mode);
                        if let Err(e) = self.beat().await {
                            warn!("Heartbeat to {} failed: {}", self.link.addr(), e);
                        }
                    }
                }
                _ = shutdown.wait() => {
                    info!("Heartbeat shutting down");
                    break;
                }
            }
        }
    }

    async fn beat(&mut self) -> RelayResult<()> {
        let heartbeat = self.service.heartbeat().await?;
        if !self.link.check_alive() {
            self.link.connect().await?;
            debug!("Heartbeat link connected to {}", self.link.addr());
        }
        self.link.send(&UplinkMessage::Heartbeat(heartbeat)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    Temperature,
    Humidity,
}

/// Simulated reading; an anomaly pushes one metric outside its normal range
pub fn generate_reading<R: Rng>(
    sensor_id: &str,
    anomaly: Option<AnomalyKind>,
    rng: &mut R,
) -> Reading {
    let temperature = match anomaly {
        Some(AnomalyKind::Temperature) if rng.gen_bool(0.5) => rng.gen_range(0.0..14.99),
        Some(AnomalyKind::Temperature) => rng.gen_range(36.0..50.0),
        _ => rng.gen_range(20.0..30.0),
    };
    let humidity = match anomaly {
        Some(AnomalyKind::Humidity) if rng.gen_bool(0.5) => rng.gen_range(0.0..25.0),
        Some(AnomalyKind::Humidity) => rng.gen_range(75.0..100.0),
        _ => rng.gen_range(40.0..60.0),
    };
    Reading {
        sensor_id: sensor_id.to_string(),
        temperature: round2(temperature),
        humidity: round2(humidity),
        timestamp: Utc::now(),
    }
}

/// Leaf sensor: connects to the drone and reports one reading per interval
pub struct SensorNode {
    config: SensorConfig,
}

impl SensorNode {
    pub fn new(config: SensorConfig) -> Self {
        Self { config }
    }

    fn pick_anomaly<R: Rng>(&self, rng: &mut R) -> Option<AnomalyKind> {
        if rng.gen_range(1..=self.config.anomaly_frequency) != 1 {
            return None;
        }
        Some(if rng.gen_bool(0.5) {
            AnomalyKind::Temperature
        } else {
            AnomalyKind::Humidity
        })
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        let id = self.config.sensor_id.clone();
        info!(
            "[{}] Starting sensor node, drone at {}, interval {:?}, anomaly 1 in {}",
            id,
            self.config.drone_addr(),
            self.config.interval,
            self.config.anomaly_frequency
        );
        let mut link = FramedLink::new(self.config.drone_addr(), self.config.timeouts.clone());
        let mut attempts = 0u64;
        let mut sent = 0u64;

        while !shutdown.is_triggered() {
            attempts += 1;
            if let Err(e) = link.connect().await {
                warn!(
                    "[{}] Connection attempt #{} to {} failed: {}; retrying in {:?}",
                    id,
                    attempts,
                    link.addr(),
                    e,
                    self.config.retry_delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay) => continue,
                    _ = shutdown.wait() => break,
                }
            }
            info!("[{}] Connected to drone at {}", id, link.addr());
            attempts = 0;

            let mut interval = tokio::time::interval(self.config.interval);
            while link.is_connected() {
                tokio::select! {
                    _ = interval.tick() => {
                        if !link.check_alive() {
                            warn!(
                                "[{}] Drone at {} closed the connection, likely returning to base; retrying in {:?}",
                                id, link.addr(), self.config.retry_delay
                            );
                            continue;
                        }
                        // ThreadRng is not Send; keep it out of the await below
                        let reading = {
                            let mut rng = rand::thread_rng();
                            let anomaly = self.pick_anomaly(&mut rng);
                            generate_reading(&id, anomaly, &mut rng)
                        };
                        match link.send(&reading).await {
                            Ok(()) => {
                                sent += 1;
                                info!(
                                    "[{}] #{} Sent: Temp={}°C, Humidity={}%",
                                    id, sent, reading.temperature, reading.humidity
                                );
                            }
                            Err(e) => warn!(
                                "[{}] Connection to drone lost ({}), likely returning to base; retrying in {:?}",
                                id, e, self.config.retry_delay
                            ),
                        }
                    }
                    _ = shutdown.wait() => break,
                }
            }
            if !shutdown.is_triggered() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                    _ = shutdown.wait() => break,
                }
            }
        }
        info!("[{}] Sensor node stopped", id);
    }
}
