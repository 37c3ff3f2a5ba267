//! USB4 DP tunnel BW allocation
//!
//! [`TunnelManager`] tracks detected tunnels in their groups and talks to
//! the DP-IN adapters. [`TunnelTransaction`] carries one negotiation
//! attempt's requirements through check, reserve and commit.

pub mod alloc;
pub mod info;
pub mod manager;
pub mod txn;

pub use info::TunnelInfo;
pub use manager::{
    DpTunnel, GroupSnapshot, ManagerSnapshot, TunnelManager, TunnelSnapshot,
    MAX_DP_TUNNELS_PER_GROUP,
};
pub use txn::{AllocationChange, CommitReport, TunnelTransaction};
