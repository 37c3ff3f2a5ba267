//! Simulated DisplayPort endpoints
//!
//! Used by the unit tests and by the `dplink run` demo to drive the
//! negotiation stack without hardware.

pub mod dpcd;
pub mod fabric;

pub use dpcd::{
    Access, AccessKind, HopBehavior, RepeaterModel, RequestPolicy, SimDpcd, SinkModel,
    TunnelEndpoint,
};
pub use fabric::{BwRequestRecord, SimFabric};
