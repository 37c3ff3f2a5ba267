//! Receiver capability, link configuration and link training registers
//!
//! ## References
//!
//! - VESA DisplayPort Standard v2.1, Section 3.5 (Link Training)

use crate::register::DpcdLayout;

/// Size of the receiver capability block read at DPCD 0x000
pub const RECEIVER_CAP_SIZE: usize = 16;

/// Size of the link status block read at `LANE0_1_STATUS`
pub const LINK_STATUS_SIZE: usize = 6;

/// Maximum number of main link lanes
pub const MAX_LANES: usize = 4;

/// DPCD revision from which the 10-try clock recovery limit applies
pub const DPCD_REV_14: u8 = 0x14;

/// DPCD addresses
pub mod addr {
    /// DPCD revision
    pub const DPCD_REV: u32 = 0x000;
    /// Max link rate (bandwidth code)
    pub const MAX_LINK_RATE: u32 = 0x001;
    /// Max lane count, TPS3 and enhanced framing support
    pub const MAX_LANE_COUNT: u32 = 0x002;
    /// Max downspread, TPS4 support
    pub const MAX_DOWNSPREAD: u32 = 0x003;
    /// Training AUX read interval
    pub const TRAINING_AUX_RD_INTERVAL: u32 = 0x00E;

    /// Link bandwidth set (bandwidth code)
    pub const LINK_BW_SET: u32 = 0x100;
    /// Lane count set
    pub const LANE_COUNT_SET: u32 = 0x101;
    /// Training pattern set
    pub const TRAINING_PATTERN_SET: u32 = 0x102;
    /// Drive settings for lane 0; lanes 1-3 follow
    pub const TRAINING_LANE0_SET: u32 = 0x103;
    /// Downspread control
    pub const DOWNSPREAD_CTRL: u32 = 0x107;
    /// Main link channel coding
    pub const MAIN_LINK_CHANNEL_CODING_SET: u32 = 0x108;
    /// eDP link rate select
    pub const LINK_RATE_SET: u32 = 0x115;

    /// Lane 0/1 status, start of the link status block
    pub const LANE0_1_STATUS: u32 = 0x202;
    /// Lane 2/3 status
    pub const LANE2_3_STATUS: u32 = 0x203;
    /// Interlane alignment
    pub const LANE_ALIGN_STATUS_UPDATED: u32 = 0x204;
    /// Sink status
    pub const SINK_STATUS: u32 = 0x205;
    /// Adjust request for lanes 0/1
    pub const ADJUST_REQUEST_LANE0_1: u32 = 0x206;
    /// Adjust request for lanes 2/3
    pub const ADJUST_REQUEST_LANE2_3: u32 = 0x207;
}

pub const MAX_LANE_COUNT_MASK: u8 = 0x1F;
pub const TPS3_SUPPORTED: u8 = 1 << 6;
pub const ENHANCED_FRAME_CAP: u8 = 1 << 7;
pub const TPS4_SUPPORTED: u8 = 1 << 7;
pub const TRAINING_AUX_RD_MASK: u8 = 0x7F;

pub const LANE_COUNT_ENHANCED_FRAME_EN: u8 = 1 << 7;
pub const SET_ANSI_8B10B: u8 = 1 << 0;
pub const SET_ANSI_128B132B: u8 = 1 << 1;

pub const TRAINING_PATTERN_MASK: u8 = 0x0F;
pub const LINK_SCRAMBLING_DISABLE: u8 = 1 << 5;

pub const TRAIN_VOLTAGE_SWING_MASK: u8 = 0x03;
pub const TRAIN_MAX_SWING_REACHED: u8 = 1 << 2;
pub const TRAIN_PRE_EMPHASIS_SHIFT: u8 = 3;
pub const TRAIN_PRE_EMPHASIS_MASK: u8 = 0x03 << TRAIN_PRE_EMPHASIS_SHIFT;
pub const TRAIN_MAX_PRE_EMPHASIS_REACHED: u8 = 1 << 5;

/// Highest voltage swing / pre-emphasis level
pub const TRAIN_LEVEL_MAX: u8 = 3;

pub const LANE_CR_DONE: u8 = 1 << 0;
pub const LANE_CHANNEL_EQ_DONE: u8 = 1 << 1;
pub const LANE_SYMBOL_LOCKED: u8 = 1 << 2;
pub const CHANNEL_EQ_BITS: u8 = LANE_CR_DONE | LANE_CHANNEL_EQ_DONE | LANE_SYMBOL_LOCKED;
pub const INTERLANE_ALIGN_DONE: u8 = 1 << 0;

/// Link bandwidth codes
pub mod bw_code {
    pub const RBR: u8 = 0x06;
    pub const HBR: u8 = 0x0A;
    pub const HBR2: u8 = 0x14;
    pub const HBR3: u8 = 0x1E;
    pub const UHBR10: u8 = 0x01;
    pub const UHBR20: u8 = 0x02;
    pub const UHBR13_5: u8 = 0x04;
}

/// Per-lane link rates in Mb/s
pub mod rate {
    pub const RBR: u32 = 1_620;
    pub const HBR: u32 = 2_700;
    pub const HBR2: u32 = 5_400;
    pub const HBR3: u32 = 8_100;
    pub const UHBR10: u32 = 10_000;
    pub const UHBR13_5: u32 = 13_500;
    pub const UHBR20: u32 = 20_000;
}

/// Convert a bandwidth code to a per-lane link rate in Mb/s
///
/// 8b/10b codes are multiples of 270 Mb/s; the UHBR codes are enumerated.
pub fn bw_code_to_link_rate(code: u8) -> u32 {
    match code {
        bw_code::UHBR10 => rate::UHBR10,
        bw_code::UHBR13_5 => rate::UHBR13_5,
        bw_code::UHBR20 => rate::UHBR20,
        _ => code as u32 * 270,
    }
}

/// Convert a per-lane link rate in Mb/s to its bandwidth code
pub fn link_rate_to_bw_code(link_rate: u32) -> u8 {
    match link_rate {
        rate::UHBR10 => bw_code::UHBR10,
        rate::UHBR13_5 => bw_code::UHBR13_5,
        rate::UHBR20 => bw_code::UHBR20,
        _ => (link_rate / 270) as u8,
    }
}

/// UHBR rates use 128b/132b channel coding
pub fn is_uhbr_rate(link_rate: u32) -> bool {
    link_rate >= rate::UHBR10
}

/// Training pattern selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingPattern {
    #[default]
    Disable,
    Tps1,
    Tps2,
    Tps3,
    Tps4,
}

impl TrainingPattern {
    pub fn code(self) -> u8 {
        match self {
            TrainingPattern::Disable => 0,
            TrainingPattern::Tps1 => 1,
            TrainingPattern::Tps2 => 2,
            TrainingPattern::Tps3 => 3,
            TrainingPattern::Tps4 => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code & TRAINING_PATTERN_MASK {
            0 => Some(TrainingPattern::Disable),
            1 => Some(TrainingPattern::Tps1),
            2 => Some(TrainingPattern::Tps2),
            3 => Some(TrainingPattern::Tps3),
            7 => Some(TrainingPattern::Tps4),
            _ => None,
        }
    }
}

/// TRAINING_PATTERN_SET layout
///
/// | Bits | Field               |
/// |------|---------------------|
/// | 0-3  | training pattern    |
/// | 5    | scrambling disabled |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainingPatternSet {
    pub pattern: TrainingPattern,
    pub scrambling_disabled: bool,
}

impl TrainingPatternSet {
    pub fn new(pattern: TrainingPattern, scrambling_disabled: bool) -> Self {
        Self {
            pattern,
            scrambling_disabled,
        }
    }

    pub fn disable() -> Self {
        Self::default()
    }
}

impl DpcdLayout for TrainingPatternSet {
    fn to_dpcd(&self) -> u8 {
        self.pattern.code()
            | if self.scrambling_disabled {
                LINK_SCRAMBLING_DISABLE
            } else {
                0
            }
    }

    fn from_dpcd(value: u8) -> Self {
        Self {
            pattern: TrainingPattern::from_code(value).unwrap_or_default(),
            scrambling_disabled: value & LINK_SCRAMBLING_DISABLE != 0,
        }
    }
}

/// TRAINING_LANEx_SET layout
///
/// | Bits | Field                    |
/// |------|--------------------------|
/// | 0-1  | voltage swing level      |
/// | 2    | max swing reached        |
/// | 3-4  | pre-emphasis level       |
/// | 5    | max pre-emphasis reached |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainLaneSet {
    pub voltage_swing: u8,
    pub max_swing_reached: bool,
    pub pre_emphasis: u8,
    pub max_pre_emphasis_reached: bool,
}

impl DpcdLayout for TrainLaneSet {
    fn to_dpcd(&self) -> u8 {
        (self.voltage_swing & TRAIN_VOLTAGE_SWING_MASK)
            | if self.max_swing_reached {
                TRAIN_MAX_SWING_REACHED
            } else {
                0
            }
            | ((self.pre_emphasis << TRAIN_PRE_EMPHASIS_SHIFT) & TRAIN_PRE_EMPHASIS_MASK)
            | if self.max_pre_emphasis_reached {
                TRAIN_MAX_PRE_EMPHASIS_REACHED
            } else {
                0
            }
    }

    fn from_dpcd(value: u8) -> Self {
        Self {
            voltage_swing: value & TRAIN_VOLTAGE_SWING_MASK,
            max_swing_reached: value & TRAIN_MAX_SWING_REACHED != 0,
            pre_emphasis: (value & TRAIN_PRE_EMPHASIS_MASK) >> TRAIN_PRE_EMPHASIS_SHIFT,
            max_pre_emphasis_reached: value & TRAIN_MAX_PRE_EMPHASIS_REACHED != 0,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.voltage_swing > TRAIN_LEVEL_MAX {
            return Err("Voltage swing level must be <= 3 (2 bits)");
        }
        if self.pre_emphasis > TRAIN_LEVEL_MAX {
            return Err("Pre-emphasis level must be <= 3 (2 bits)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_lane_set_bits() {
        let set = TrainLaneSet {
            voltage_swing: 2,
            max_swing_reached: true,
            pre_emphasis: 1,
            max_pre_emphasis_reached: false,
        };
        assert_eq!(set.to_dpcd(), 0x02 | 0x04 | 0x08);
        assert_eq!(TrainLaneSet::from_dpcd(0x0E), set);

        let bad = TrainLaneSet {
            voltage_swing: 4,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_training_pattern_set_bits() {
        let tps1 = TrainingPatternSet::new(TrainingPattern::Tps1, true);
        assert_eq!(tps1.to_dpcd(), 0x21);

        let tps4 = TrainingPatternSet::new(TrainingPattern::Tps4, false);
        assert_eq!(tps4.to_dpcd(), 0x07);
        assert_eq!(TrainingPatternSet::from_dpcd(0x07).pattern, TrainingPattern::Tps4);
    }

    #[test]
    fn test_bw_code_conversion() {
        assert_eq!(bw_code_to_link_rate(bw_code::HBR2), rate::HBR2);
        assert_eq!(bw_code_to_link_rate(bw_code::UHBR13_5), rate::UHBR13_5);
        assert_eq!(link_rate_to_bw_code(rate::HBR3), bw_code::HBR3);
        assert!(is_uhbr_rate(rate::UHBR10));
        assert!(!is_uhbr_rate(rate::HBR3));
    }
}
