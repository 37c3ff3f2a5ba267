use std::io;
use thiserror::Error;

use dplink_raw::AuxError;

#[derive(Error, Debug)]
pub enum DplinkError {
    #[error("AUX operation failed: {0}")]
    Aux(#[from] AuxError),

    #[error("AUX transport failure on {aux}: {reason}")]
    Transport { aux: String, reason: String },

    #[error("Invalid hardware state: {0}")]
    HardwareError(String),

    #[error("No feasible bandwidth assignment: {0}")]
    Infeasible(String),

    #[error("BW allocation mode is not enabled on tunnel {tunnel}")]
    BwAllocDisabled { tunnel: String },

    #[error("BW request of {units} units on tunnel {tunnel} exceeds the register width")]
    BwRequestTooLarge { tunnel: String, units: u32 },

    #[error("BW request of {bw} Mb/s rejected on tunnel {tunnel}")]
    BwRequestRejected { tunnel: String, bw: u32 },

    #[error("BW request of {bw} Mb/s timed out on tunnel {tunnel}")]
    BwRequestTimeout { tunnel: String, bw: u32 },

    #[error("BW reservation failed: {0}")]
    ReservationFailed(String),

    #[error("Tunnel handle is stale: {0}")]
    StaleTunnel(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl DplinkError {
    /// Management-channel failures, as opposed to negotiation outcomes
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DplinkError::Aux(_) | DplinkError::Transport { .. } | DplinkError::IoError(_)
        )
    }
}

impl From<serde_json::Error> for DplinkError {
    fn from(e: serde_json::Error) -> Self {
        DplinkError::ParseError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DplinkError>;
