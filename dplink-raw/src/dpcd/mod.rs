//! DPCD (DisplayPort Configuration Data) register definitions
//!
//! The DPCD is the sink-side register file reached over the AUX channel.
//! Definitions are grouped by the block they belong to.
//!
//! ## Blocks
//!
//! - **link** - Receiver capabilities, link configuration, training and status
//! - **lttpr** - Link-training tunable PHY repeaters (LTTPR)
//! - **tunnel** - USB4 DP-IN adapter tunneling and bandwidth allocation
//!
//! ## References
//!
//! - VESA DisplayPort Standard v2.1, Section 2.9 (DPCD)
//! - USB4 Specification v2.0, Chapter 10 (DP tunneling)

pub mod link;
pub mod lttpr;
pub mod tunnel;
