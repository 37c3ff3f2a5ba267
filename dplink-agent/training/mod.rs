//! DisplayPort link training
//!
//! [`status`] covers the per-hop register exchange, [`machine`] the clock
//! recovery / channel equalization state machine with LTTPR handling and
//! [`fallback`] the rate/lane reduction used between attempts.

pub mod fallback;
pub mod machine;
pub mod status;

pub use fallback::{LinkRate, RateLaneFallback};
pub use machine::{
    LinkFallback, LinkParams, LinkTrainer, LttprCaps, LttprMode, ReconfigurationLog,
    ReconfigurationRequest, SinkCaps, TrainedLink, TrainingFailure, TrainingOutcome,
    TrainingState,
};
pub use status::{DriveSettings, Hop, LinkStatus, LinkStatusProtocol};
