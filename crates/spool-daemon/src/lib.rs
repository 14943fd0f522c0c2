//! Daemon wiring: HTTP/WebSocket surface, environment configuration,
//! telemetry bootstrap and graceful shutdown.

pub mod server;
pub mod telemetry;
mod ws;
