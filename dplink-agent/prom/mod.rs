pub mod link;
pub mod tunnel;

pub use link::LinkMetricExporter;
pub use tunnel::TunnelMetricExporter;
