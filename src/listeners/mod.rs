/// Inbound TCP servers: sensor ingest on the drone, uplink ingest on the collector
use crate::config::AnomalyRanges;
use crate::domain::{DroneStatus, Reading, UplinkMessage};
use crate::errors::RelayResult;
use crate::protocol::{decode_frame, FrameReader};
use crate::repo::TelemetryBuffer;
use crate::services::{annotate, CollectorService, OperationalStateMachine};
use crate::shutdown::Shutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);
const RELEASE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bind a listener on all interfaces
pub async fn bind(port: u16) -> RelayResult<TcpListener> {
    Ok(TcpListener::bind(("0.0.0.0", port)).await?)
}

/// Accept until shutdown, handing each connection to `on_accept`
async fn accept_loop<F>(listener: TcpListener, mut shutdown: Shutdown, role: &str, mut on_accept: F)
where
    F: FnMut(TcpStream, SocketAddr, Shutdown),
{
    match listener.local_addr() {
        Ok(addr) => info!("{} listening on {}", role, addr),
        Err(e) => warn!("{} listening on unknown address: {}", role, e),
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => on_accept(socket, addr, shutdown.clone()),
                Err(e) => {
                    warn!("{}: error accepting connection: {}", role, e);
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        _ = shutdown.wait() => break,
                    }
                }
            },
            _ = shutdown.wait() => break,
        }
    }
    info!("{} stopped accepting connections", role);
}

/// Drone-side server for sensor connections
pub struct SensorIngestServer {
    ranges: AnomalyRanges,
    buffer: Arc<TelemetryBuffer>,
    state: Arc<OperationalStateMachine>,
    read_timeout: Duration,
}

impl SensorIngestServer {
    pub fn new(
        ranges: AnomalyRanges,
        buffer: Arc<TelemetryBuffer>,
        state: Arc<OperationalStateMachine>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            ranges,
            buffer,
            state,
            read_timeout,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: Shutdown) {
        // admission needs the mode, which is async; hand it to a task per socket
        accept_loop(listener, shutdown, "Sensor ingest", |socket, addr, shutdown| {
            tokio::spawn(self.clone().admit(socket, addr, shutdown));
        })
        .await;
    }

    async fn admit(self: Arc<Self>, socket: TcpStream, addr: SocketAddr, shutdown: Shutdown) {
        match self.state.mode().await {
            Ok(DroneStatus::Active) => {
                info!("Connected to sensor at {}", addr);
                self.handle(socket, addr, shutdown).await;
            }
            Ok(DroneStatus::ReturningToBase) => {
                warn!("Rejected sensor at {}: drone is returning to base", addr);
            }
            Err(e) => {
                warn!("Rejected sensor at {}: {}", addr, e);
            }
        }
    }

    async fn handle(&self, socket: TcpStream, addr: SocketAddr, mut shutdown: Shutdown) {
        let mut frames = FrameReader::new(socket);
        let mut sensor_id: Option<String> = None;

        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(self.read_timeout, frames.next_frame()) => next,
                _ = shutdown.wait() => break,
            };

            match next {
                Err(_) => match self.state.mode().await {
                    Ok(DroneStatus::Active) => continue,
                    Ok(DroneStatus::ReturningToBase) => {
                        info!("Dropping idle sensor at {}: returning to base", addr);
                        break;
                    }
                    Err(e) => {
                        warn!("Sensor at {} idle, mode unavailable: {}", addr, e);
                        continue;
                    }
                },
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    warn!("Protocol error from sensor at {}: {}", addr, e);
                    break;
                }
                Ok(Ok(Some(frame))) => match self.ingest_frame(&frame, &mut sensor_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(
                            "Discarded reading from sensor at {}: returning to base, closing",
                            addr
                        );
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        warn!("Reading from sensor at {} skipped: {}", addr, e);
                    }
                    Err(e) => {
                        warn!("Invalid reading from sensor at {}: {}", addr, e);
                        break;
                    }
                },
            }
        }

        drop(frames);
        if let Some(id) = sensor_id {
            self.release_on_disconnect(&id, addr).await;
        }
        info!("Disconnected sensor at {}", addr);
    }

    /// The connection is gone, so the id must not stay listed; retry until released
    async fn release_on_disconnect(&self, sensor_id: &str, addr: SocketAddr) {
        let mut attempt = 1u32;
        while let Err(e) = self.buffer.release_sensor(sensor_id).await {
            error!(
                "Could not unregister sensor {} ({}), attempt {}: {}; retrying",
                sensor_id, addr, attempt, e
            );
            attempt += 1;
            tokio::time::sleep(RELEASE_RETRY_DELAY).await;
        }
    }

    /// Validate and buffer one frame; false when the reading was refused
    async fn ingest_frame(&self, frame: &[u8], sensor_id: &mut Option<String>) -> RelayResult<bool> {
        let reading: Reading = decode_frame(frame)?;

        // the mode may have flipped since admission
        if self.state.mode().await? == DroneStatus::ReturningToBase {
            return Ok(false);
        }

        if sensor_id.as_deref() != Some(reading.sensor_id.as_str()) {
            // the old id stays owned until its release succeeds
            if let Some(previous) = sensor_id.as_deref() {
                self.buffer.release_sensor(previous).await?;
            }
            *sensor_id = None;
            if self.buffer.register_sensor(&reading.sensor_id).await? {
                info!("New sensor registered: {}", reading.sensor_id);
            }
            *sensor_id = Some(reading.sensor_id.clone());
        }

        let annotated = annotate(reading, &self.ranges);
        for anomaly in &annotated.anomalies {
            warn!("{}", anomaly);
        }
        info!(
            "Received from {}: Temp={}°C, Humidity={}%",
            annotated.reading.sensor_id, annotated.reading.temperature, annotated.reading.humidity
        );
        self.buffer.append(annotated).await?;
        Ok(true)
    }
}

/// Collector-side server for drone uplinks
pub struct CollectorServer {
    service: Arc<CollectorService>,
}

impl CollectorServer {
    pub fn new(service: Arc<CollectorService>) -> Self {
        Self { service }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: Shutdown) {
        accept_loop(listener, shutdown, "Central collector", |socket, addr, shutdown| {
            tokio::spawn(self.clone().handle(socket, addr, shutdown));
        })
        .await;
    }

    async fn handle(self: Arc<Self>, socket: TcpStream, addr: SocketAddr, mut shutdown: Shutdown) {
        info!("Connected to drone at {}", addr);
        let mut frames = FrameReader::new(socket);

        loop {
            let next = tokio::select! {
                next = frames.next_message::<UplinkMessage>() => next,
                _ = shutdown.wait() => break,
            };
            match next {
                Ok(Some(message)) => {
                    if let Err(e) = self.service.ingest(&message).await {
                        error!(
                            "Message from {} ({}) not recorded: {}",
                            message.drone_id(),
                            addr,
                            e
                        );
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Invalid message from drone at {}: {}", addr, e);
                    break;
                }
            }
        }
        info!("Disconnected drone at {}", addr);
    }
}
