//! # dplink-raw
//!
//! DPCD register definitions and AUX channel access for DisplayPort links.
//!
//! This crate provides type-safe abstractions over DPCD (DisplayPort
//! Configuration Data) access through the kernel's `drm_dp_aux` character
//! devices, and the register constants needed for link training, LTTPR
//! handling and USB4 DP tunnel bandwidth allocation.
//!
//! ## Usage
//!
//! ```ignore
//! use dplink_raw::dpcd::link::{addr, TrainLaneSet};
//! use dplink_raw::{open_aux, write_dpcd, DpcdLayout};
//!
//! let mut aux = open_aux(0)?;
//!
//! // Type-safe register programming
//! let lane = TrainLaneSet {
//!     voltage_swing: 1,
//!     pre_emphasis: 0,
//!     ..Default::default()
//! };
//!
//! write_dpcd(&mut aux, addr::TRAINING_LANE0_SET, &[lane.to_dpcd()])?;
//! ```

pub mod aux;
pub mod dpcd;
pub mod register;

// Re-export for convenience
pub use aux::{open_aux, read_dpcd, write_dpcd, AuxError, Result};
pub use register::{DpcdLayout, Register};
