//! Reverse tunnel relay. A game host behind NAT dials out to the relay over two
//! WebSockets; the relay then exposes the host's HTTP API and a multiplexed
//! WebSocket endpoint to external clients.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod mux;
pub mod registry;
pub mod route;
pub mod server;
pub mod socket;
pub mod telemetry;
pub mod tunnel;

pub use config::RelayConfig;
pub use registry::TunnelRegistry;
pub use server::RelayServer;
