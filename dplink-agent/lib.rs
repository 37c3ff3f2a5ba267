// Macros (must be first for visibility)
#[macro_use]
pub mod macros;

pub mod common;
pub mod config;
pub mod error;
pub mod link_bw;
pub mod metrics;
pub mod orchestrator;
pub mod prom;
pub mod sim;
pub mod training;
pub mod tunnel;

pub use config::DplinkConfig;
pub use error::{DplinkError, Result};
pub use orchestrator::{DisplayLink, NegotiationReport, Negotiator, Scenario};
pub use prom::{LinkMetricExporter, TunnelMetricExporter};
pub use tunnel::{DpTunnel, TunnelManager};
