//! LTTPR (link-training tunable PHY repeater) registers
//!
//! Each repeater hop owns a 0x50-byte register block starting at 0xF0010.
//! Hop numbering is 1-based; hop 1 is the repeater closest to the source.

/// Size of the common LTTPR capability block
pub const LTTPR_COMMON_CAP_SIZE: usize = 5;

/// Maximum number of repeaters on a link
pub const MAX_LTTPR_COUNT: u8 = 8;

/// Stride between per-repeater register blocks
pub const PHY_REPEATER_STRIDE: u32 = 0x50;

pub mod addr {
    pub const LT_TUNABLE_PHY_REPEATER_FIELD_DATA_STRUCTURE_REV: u32 = 0xF0000;
    pub const MAX_LINK_RATE_PHY_REPEATER: u32 = 0xF0001;
    pub const PHY_REPEATER_CNT: u32 = 0xF0002;
    pub const PHY_REPEATER_MODE: u32 = 0xF0003;
    pub const MAX_LANE_COUNT_PHY_REPEATER: u32 = 0xF0004;

    pub const TRAINING_PATTERN_SET_PHY_REPEATER1: u32 = 0xF0010;
    pub const TRAINING_LANE0_SET_PHY_REPEATER1: u32 = 0xF0011;
    pub const LANE0_1_STATUS_PHY_REPEATER1: u32 = 0xF0030;
}

pub const PHY_REPEATER_MODE_TRANSPARENT: u8 = 0x55;
pub const PHY_REPEATER_MODE_NON_TRANSPARENT: u8 = 0xAA;

fn hop_offset(hop: u8) -> u32 {
    (hop.saturating_sub(1) as u32) * PHY_REPEATER_STRIDE
}

/// TRAINING_PATTERN_SET address of repeater `hop`
pub fn training_pattern_set(hop: u8) -> u32 {
    addr::TRAINING_PATTERN_SET_PHY_REPEATER1 + hop_offset(hop)
}

/// TRAINING_LANE0_SET address of repeater `hop`
pub fn training_lane0_set(hop: u8) -> u32 {
    addr::TRAINING_LANE0_SET_PHY_REPEATER1 + hop_offset(hop)
}

/// LANE0_1_STATUS address of repeater `hop`
pub fn lane0_1_status(hop: u8) -> u32 {
    addr::LANE0_1_STATUS_PHY_REPEATER1 + hop_offset(hop)
}

/// Decode PHY_REPEATER_CNT
///
/// The register is one-hot: 0x80 is one repeater, 0x01 is eight. Returns
/// `None` for a value with more than one bit set.
pub fn phy_repeater_count(code: u8) -> Option<u8> {
    match code.count_ones() {
        0 => Some(0),
        1 => Some(8 - code.trailing_zeros() as u8),
        _ => None,
    }
}
