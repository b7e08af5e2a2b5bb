/// Telemetry relay entry point: runs one of the sensor, drone or collector roles
use axum::Router;
use drone_relay::clients::{HeartbeatSender, SensorNode, UplinkForwarder};
use drone_relay::config::{CollectorConfig, DroneConfig, SensorConfig};
use drone_relay::domain::OperationalState;
use drone_relay::handlers::{CollectorState, DroneState};
use drone_relay::listeners::{self, CollectorServer, SensorIngestServer};
use drone_relay::repo::{HistoryRepo, TelemetryBuffer};
use drone_relay::routes::{build_collector_router, build_drone_router};
use drone_relay::services::{AggregationService, CollectorService, OperationalStateMachine};
use drone_relay::shutdown::{self, Shutdown, ShutdownTrigger};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const USAGE: &str = "usage: drone_relay <sensor|drone|collector>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let role = std::env::args().nth(1).unwrap_or_default();
    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(watch_ctrl_c(trigger));

    match role.as_str() {
        "sensor" => run_sensor(shutdown).await,
        "drone" => run_drone(shutdown).await,
        "collector" => run_collector(shutdown).await,
        other => anyhow::bail!("unknown role {:?}; {}", other, USAGE),
    }
}

async fn watch_ctrl_c(trigger: ShutdownTrigger) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown requested");
            trigger.trigger();
        }
        Err(e) => {
            error!("Cannot listen for Ctrl-C, running until killed: {}", e);
            // dropping the trigger would count as a shutdown
            std::future::pending::<()>().await;
        }
    }
}

async fn run_sensor(shutdown: Shutdown) -> anyhow::Result<()> {
    let config = SensorConfig::from_env()?;
    info!("Configuration loaded for sensor {}", config.sensor_id);
    SensorNode::new(config).run(shutdown).await;
    Ok(())
}

async fn run_drone(shutdown: Shutdown) -> anyhow::Result<()> {
    // Load configuration
    let config = DroneConfig::from_env()?;
    info!("Configuration loaded for drone {}", config.drone_id);

    // Shared state
    let buffer = Arc::new(TelemetryBuffer::new(
        config.history_capacity,
        config.timeouts.lock,
    ));
    let state = Arc::new(OperationalStateMachine::new(
        OperationalState::default(),
        config.battery.clone(),
        config.timeouts.lock,
    ));
    let aggregation = Arc::new(AggregationService::new(
        config.drone_id.clone(),
        buffer.clone(),
        state.clone(),
    ));

    let mut tasks = start_drone_tasks(&config, &buffer, &state, aggregation, &shutdown).await;

    let router = build_drone_router(DroneState {
        drone_id: Arc::from(config.drone_id.as_str()),
        buffer,
        state,
    });
    tasks.push(tokio::spawn(serve_status(
        config.status_port,
        router,
        shutdown,
    )));

    join_all(tasks).await;
    info!("Drone {} stopped", config.drone_id);
    Ok(())
}

/// Start the ingest listener, battery simulation, uplink and heartbeat
async fn start_drone_tasks(
    config: &DroneConfig,
    buffer: &Arc<TelemetryBuffer>,
    state: &Arc<OperationalStateMachine>,
    aggregation: Arc<AggregationService>,
    shutdown: &Shutdown,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    // Sensor ingest
    match listeners::bind(config.listen_port).await {
        Ok(listener) => {
            let server = Arc::new(SensorIngestServer::new(
                config.ranges.clone(),
                buffer.clone(),
                state.clone(),
                config.sensor_read_timeout,
            ));
            tasks.push(tokio::spawn(server.serve(listener, shutdown.clone())));
        }
        Err(e) => error!(
            "Sensor ingest disabled, cannot bind port {}: {}",
            config.listen_port, e
        ),
    }

    // Battery simulation
    tasks.push(tokio::spawn(state.clone().run(shutdown.clone())));

    // Uplink to the central collector
    let forwarder = UplinkForwarder::new(
        aggregation.clone(),
        config.central_addr(),
        config.aggregation_interval,
        config.timeouts.clone(),
    );
    tasks.push(tokio::spawn(forwarder.run(shutdown.clone())));

    // Heartbeat on its own connection
    let heartbeat = HeartbeatSender::new(
        aggregation,
        config.central_addr(),
        config.heartbeat_interval,
        config.timeouts.clone(),
    );
    tasks.push(tokio::spawn(heartbeat.run(shutdown.clone())));

    info!("All drone tasks started");
    tasks
}

async fn run_collector(shutdown: Shutdown) -> anyhow::Result<()> {
    // Load configuration
    let config = CollectorConfig::from_env()?;
    info!("Collector configuration loaded");

    let repo = Arc::new(HistoryRepo::new(
        config.history_capacity,
        config.timeouts.lock,
    ));
    let service = Arc::new(CollectorService::new(repo));

    let mut tasks = Vec::new();
    match listeners::bind(config.listen_port).await {
        Ok(listener) => {
            let server = Arc::new(CollectorServer::new(service.clone()));
            tasks.push(tokio::spawn(server.serve(listener, shutdown.clone())));
        }
        Err(e) => error!(
            "Drone uplink disabled, cannot bind port {}: {}",
            config.listen_port, e
        ),
    }

    let router = build_collector_router(CollectorState {
        repo: service.repo().clone(),
    });
    tasks.push(tokio::spawn(serve_status(
        config.status_port,
        router,
        shutdown,
    )));

    join_all(tasks).await;
    info!("Collector stopped");
    Ok(())
}

/// Serve a read-only status API until shutdown; a bind failure only disables the API
async fn serve_status(port: u16, router: Router, mut shutdown: Shutdown) {
    let listener = match listeners::bind(port).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Status API disabled, cannot bind port {}: {}", port, e);
            return;
        }
    };
    info!("Status API listening on 0.0.0.0:{}", port);

    let result = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await;
    if let Err(e) = result {
        error!("Status API on port {} failed: {}", port, e);
    }
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }
}
