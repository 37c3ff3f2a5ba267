pub mod link;
pub mod tunnel;

pub use link::LinkMetric;
pub use tunnel::TunnelMetric;
