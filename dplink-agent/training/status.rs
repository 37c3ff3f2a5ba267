//! Link status exchange with the sink or a repeater
//!
//! Reads the 6-byte link status block, writes the training pattern and the
//! per-lane drive settings. Repeater hops use the same layouts at their
//! own LTTPR register block.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use dplink_raw::dpcd::link::{self, addr, TrainLaneSet, TrainingPattern, TrainingPatternSet};
use dplink_raw::dpcd::lttpr;
use dplink_raw::register::DpcdLayout;

use crate::common::aux::DpAux;
use crate::config::SourceCaps;
use crate::error::Result;

/// Training target on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Hop {
    /// The DPRX at the end of the link
    Sink,
    /// LTTPR number `n`, 1 being closest to the source
    Repeater(u8),
}

impl Hop {
    pub fn pattern_address(&self) -> u32 {
        match self {
            Hop::Sink => addr::TRAINING_PATTERN_SET,
            Hop::Repeater(n) => lttpr::training_pattern_set(*n),
        }
    }

    pub fn lane_set_address(&self) -> u32 {
        match self {
            Hop::Sink => addr::TRAINING_LANE0_SET,
            Hop::Repeater(n) => lttpr::training_lane0_set(*n),
        }
    }

    pub fn status_address(&self) -> u32 {
        match self {
            Hop::Sink => addr::LANE0_1_STATUS,
            Hop::Repeater(n) => lttpr::lane0_1_status(*n),
        }
    }

    /// 0 for the sink, the repeater number otherwise
    pub fn index(&self) -> u8 {
        match self {
            Hop::Sink => 0,
            Hop::Repeater(n) => *n,
        }
    }

    pub fn from_index(index: u8) -> Self {
        if index == 0 {
            Hop::Sink
        } else {
            Hop::Repeater(index)
        }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hop::Sink => write!(f, "DPRX"),
            Hop::Repeater(n) => write!(f, "LTTPR {n}"),
        }
    }
}

/// Link status block: lane status, alignment, sink status, adjust requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus(pub [u8; link::LINK_STATUS_SIZE]);

impl LinkStatus {
    pub fn lane_status(&self, lane: usize) -> u8 {
        (self.0[lane / 2] >> ((lane & 1) * 4)) & 0xF
    }

    pub fn clock_recovery_ok(&self, lane_count: u8) -> bool {
        (0..lane_count as usize).all(|lane| self.lane_status(lane) & link::LANE_CR_DONE != 0)
    }

    pub fn channel_eq_ok(&self, lane_count: u8) -> bool {
        if self.0[2] & link::INTERLANE_ALIGN_DONE == 0 {
            return false;
        }
        (0..lane_count as usize)
            .all(|lane| self.lane_status(lane) & link::CHANNEL_EQ_BITS == link::CHANNEL_EQ_BITS)
    }

    fn adjust_request(&self, lane: usize) -> u8 {
        (self.0[4 + lane / 2] >> ((lane & 1) * 4)) & 0xF
    }

    pub fn adjust_request_voltage(&self, lane: usize) -> u8 {
        self.adjust_request(lane) & 0x3
    }

    pub fn adjust_request_pre_emphasis(&self, lane: usize) -> u8 {
        (self.adjust_request(lane) & 0xC) >> 2
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.0;
        write!(
            f,
            "ln0_1:0x{:x} ln2_3:0x{:x} align:0x{:x} sink:0x{:x} adj_req0_1:0x{:x} adj_req2_3:0x{:x}",
            s[0], s[1], s[2], s[3], s[4], s[5]
        )
    }
}

/// Highest voltage swing allowed at a pre-emphasis level
pub fn max_voltage_for_pre_emphasis(pre_emphasis: u8) -> u8 {
    match pre_emphasis {
        0 => 3,
        1 => 2,
        2 => 1,
        _ => 0,
    }
}

/// Per-lane voltage swing / pre-emphasis settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriveSettings {
    lanes: [TrainLaneSet; link::MAX_LANES],
}

impl DriveSettings {
    pub fn reset() -> Self {
        Self::default()
    }

    /// Settings answering the partner's adjust request
    ///
    /// Takes the highest request across the active lanes, clamps it to the
    /// source limits and the voltage/pre-emphasis table and applies the
    /// result to every lane.
    pub fn adjusted(status: &LinkStatus, lane_count: u8, source: &SourceCaps) -> Self {
        let mut v = 0;
        let mut p = 0;
        for lane in 0..lane_count as usize {
            v = v.max(status.adjust_request_voltage(lane));
            p = p.max(status.adjust_request_pre_emphasis(lane));
        }

        let mut set = TrainLaneSet::default();

        if p >= source.max_pre_emphasis {
            p = source.max_pre_emphasis;
            set.max_pre_emphasis_reached = true;
        }
        set.pre_emphasis = p;

        let voltage_max = source
            .max_voltage_swing
            .min(max_voltage_for_pre_emphasis(p));
        if v >= voltage_max {
            v = voltage_max;
            set.max_swing_reached = true;
        }
        set.voltage_swing = v;

        Self {
            lanes: [set; link::MAX_LANES],
        }
    }

    pub fn lane(&self, lane: usize) -> TrainLaneSet {
        self.lanes[lane]
    }

    /// Voltage swing of lane 0, used to detect repeated identical requests
    pub fn voltage_swing(&self) -> u8 {
        self.lanes[0].voltage_swing
    }

    pub fn max_swing_reached(&self, lane_count: u8) -> bool {
        self.lanes[..lane_count as usize]
            .iter()
            .all(|l| l.max_swing_reached)
    }

    pub fn to_bytes(&self, lane_count: u8) -> Vec<u8> {
        self.lanes[..lane_count as usize]
            .iter()
            .map(|l| l.to_dpcd())
            .collect()
    }
}

/// Clock recovery settle delay for a TRAINING_AUX_RD_INTERVAL value
pub fn clock_recovery_delay(aux_rd_interval: u8) -> Duration {
    match aux_rd_interval & link::TRAINING_AUX_RD_MASK {
        0 => Duration::from_micros(100),
        n => Duration::from_millis(4 * n as u64),
    }
}

/// Channel EQ settle delay for a TRAINING_AUX_RD_INTERVAL value
pub fn channel_eq_delay(aux_rd_interval: u8) -> Duration {
    match aux_rd_interval & link::TRAINING_AUX_RD_MASK {
        0 => Duration::from_micros(400),
        n => Duration::from_millis(4 * n as u64),
    }
}

/// Wire exchange for one link configuration
pub struct LinkStatusProtocol<'a> {
    aux: &'a dyn DpAux,
    lane_count: u8,
}

impl<'a> LinkStatusProtocol<'a> {
    pub fn new(aux: &'a dyn DpAux, lane_count: u8) -> Self {
        Self {
            aux,
            lane_count: lane_count.min(link::MAX_LANES as u8),
        }
    }

    pub fn lane_count(&self) -> u8 {
        self.lane_count
    }

    pub fn read_link_status(&self, hop: Hop) -> Result<LinkStatus> {
        let mut buf = [0u8; link::LINK_STATUS_SIZE];
        self.aux.read(hop.status_address(), &mut buf)?;
        let status = LinkStatus(buf);
        tracing::debug!("[{}] {} link status: {}", self.aux.name(), hop, status);
        Ok(status)
    }

    /// Write the training pattern, followed by the lane settings unless
    /// the pattern is being disabled
    pub fn write_training_pattern(
        &self,
        hop: Hop,
        pattern: TrainingPatternSet,
        drive: &DriveSettings,
    ) -> Result<()> {
        let mut buf = vec![pattern.to_dpcd()];
        if pattern.pattern != TrainingPattern::Disable {
            buf.extend(drive.to_bytes(self.lane_count));
        }
        self.aux.write(hop.pattern_address(), &buf)
    }

    pub fn write_drive_settings(&self, hop: Hop, drive: &DriveSettings) -> Result<()> {
        self.aux
            .write(hop.lane_set_address(), &drive.to_bytes(self.lane_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDpcd;

    #[test]
    fn test_lane_status_decode() {
        // Lanes 0/1 CR+EQ+lock, lane 2 CR only, aligned
        let status = LinkStatus([0x77, 0x01, 0x01, 0x00, 0x00, 0x00]);
        assert!(status.clock_recovery_ok(3));
        assert!(status.channel_eq_ok(2));
        assert!(!status.channel_eq_ok(3));
        assert!(!status.clock_recovery_ok(4));
    }

    #[test]
    fn test_adjust_request_decode() {
        // Lane 0: v=2 p=1, lane 1: v=1 p=2
        let status = LinkStatus([0, 0, 0, 0, 0x96, 0x00]);
        assert_eq!(status.adjust_request_voltage(0), 2);
        assert_eq!(status.adjust_request_pre_emphasis(0), 1);
        assert_eq!(status.adjust_request_voltage(1), 1);
        assert_eq!(status.adjust_request_pre_emphasis(1), 2);
    }

    #[test]
    fn test_adjust_takes_lane_max_and_clamps() {
        let source = SourceCaps::default();
        let status = LinkStatus([0, 0, 0, 0, 0x96, 0x00]);

        // max v=2, max p=2; table limits v to 1 at p=2
        let drive = DriveSettings::adjusted(&status, 2, &source);
        let lane = drive.lane(3);
        assert_eq!(lane.pre_emphasis, 2);
        assert_eq!(lane.voltage_swing, 1);
        assert!(lane.max_swing_reached);
        assert!(!lane.max_pre_emphasis_reached);
    }

    #[test]
    fn test_adjust_respects_source_limits() {
        let source = SourceCaps {
            max_voltage_swing: 2,
            max_pre_emphasis: 1,
            ..Default::default()
        };
        // v=3 p=3 on lane 0
        let status = LinkStatus([0, 0, 0, 0, 0x0F, 0x00]);
        let drive = DriveSettings::adjusted(&status, 1, &source);
        assert_eq!(drive.lane(0).pre_emphasis, 1);
        assert!(drive.lane(0).max_pre_emphasis_reached);
        assert_eq!(drive.lane(0).voltage_swing, 2);
        assert!(drive.max_swing_reached(1));
    }

    #[test]
    fn test_settle_delays() {
        assert_eq!(clock_recovery_delay(0), Duration::from_micros(100));
        assert_eq!(channel_eq_delay(0), Duration::from_micros(400));
        assert_eq!(clock_recovery_delay(2), Duration::from_millis(8));
        assert_eq!(channel_eq_delay(0x81), Duration::from_millis(4));
    }

    #[test]
    fn test_repeater_hop_uses_lttpr_block() {
        let aux = SimDpcd::new("AUX A");
        let proto = LinkStatusProtocol::new(&aux, 2);
        let pattern = TrainingPatternSet::new(TrainingPattern::Tps1, true);

        proto
            .write_training_pattern(Hop::Repeater(2), pattern, &DriveSettings::reset())
            .unwrap();
        assert_eq!(aux.writes_to(0xF0060), vec![vec![0x21, 0x00, 0x00]]);

        proto
            .write_training_pattern(Hop::Sink, TrainingPatternSet::disable(), &DriveSettings::reset())
            .unwrap();
        assert_eq!(aux.writes_to(addr::TRAINING_PATTERN_SET), vec![vec![0x00]]);

        proto.read_link_status(Hop::Repeater(1)).unwrap();
        assert_eq!(aux.reads_of(0xF0030), 1);
    }
}
