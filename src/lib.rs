/// Three-tier telemetry relay: sensors, drones and a central collector
pub mod clients;
pub mod config;
pub mod domain;
pub mod errors;
pub mod handlers;
pub mod listeners;
pub mod protocol;
pub mod repo;
pub mod routes;
pub mod services;
pub mod shutdown;
pub mod utils;
