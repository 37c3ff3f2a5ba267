//! Link training state machine
//!
//! `Idle -> ClockRecovery -> ChannelEqualization -> Trained`, with `Failed`
//! reachable from both active phases. With LTTPRs present the two phases
//! run once per hop, from the repeater farthest from the source down to
//! the sink, in non-transparent mode; a failure retrains the whole link in
//! transparent mode before the rate/lane fallback kicks in.

use parking_lot::Mutex;
use serde::Serialize;

use dplink_raw::dpcd::link::{self, addr, TrainingPattern, TrainingPatternSet};
use dplink_raw::dpcd::lttpr::{self, addr as lttpr_addr};

use super::status::{
    channel_eq_delay, clock_recovery_delay, DriveSettings, Hop, LinkStatusProtocol,
};
use crate::common::aux::DpAux;
use crate::common::delay::Delay;
use crate::config::SourceCaps;
use crate::error::Result;
use crate::link_bw::StreamId;

const MAX_CR_TRIES_DP14: u32 = 10;
const MAX_CR_TRIES_LEGACY: u32 = 80;
const MAX_SAME_VOLTAGE_TRIES: u32 = 5;
const MAX_EQ_TRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrainingState {
    Idle,
    ClockRecovery,
    ChannelEqualization,
    Trained,
    Failed,
}

/// DPRX capabilities relevant to training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SinkCaps {
    pub dpcd_rev: u8,
    pub max_link_rate: u32,
    pub max_lane_count: u8,
    pub tps3: bool,
    pub tps4: bool,
    pub enhanced_frame: bool,
    pub aux_rd_interval: u8,
}

impl SinkCaps {
    pub fn read(aux: &dyn DpAux) -> Result<Self> {
        let mut caps = [0u8; link::RECEIVER_CAP_SIZE];
        aux.read(addr::DPCD_REV, &mut caps)?;

        let lane_cap = caps[addr::MAX_LANE_COUNT as usize];
        let sink = Self {
            dpcd_rev: caps[addr::DPCD_REV as usize],
            max_link_rate: link::bw_code_to_link_rate(caps[addr::MAX_LINK_RATE as usize]),
            max_lane_count: lane_cap & link::MAX_LANE_COUNT_MASK,
            tps3: lane_cap & link::TPS3_SUPPORTED != 0,
            tps4: caps[addr::MAX_DOWNSPREAD as usize] & link::TPS4_SUPPORTED != 0,
            enhanced_frame: lane_cap & link::ENHANCED_FRAME_CAP != 0,
            aux_rd_interval: caps[addr::TRAINING_AUX_RD_INTERVAL as usize]
                & link::TRAINING_AUX_RD_MASK,
        };

        tracing::debug!(
            "[{}] DPCD rev {:x}.{:x}, max {} Mb/s x{}, TPS3:{} TPS4:{}",
            aux.name(),
            sink.dpcd_rev >> 4,
            sink.dpcd_rev & 0xF,
            sink.max_link_rate,
            sink.max_lane_count,
            sink.tps3,
            sink.tps4
        );

        Ok(sink)
    }

    pub fn max_cr_tries(&self) -> u32 {
        if self.dpcd_rev >= link::DPCD_REV_14 {
            MAX_CR_TRIES_DP14
        } else {
            MAX_CR_TRIES_LEGACY
        }
    }
}

/// Common LTTPR capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LttprCaps {
    pub count: u8,
    pub max_link_rate: u32,
    pub max_lane_count: u8,
}

/// Per-lane rate in Mb/s and lane count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkParams {
    pub link_rate: u32,
    pub lane_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LttprMode {
    NoRepeaters,
    Transparent,
    NonTransparent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainedLink {
    pub params: LinkParams,
    pub repeaters: u8,
    pub mode: LttprMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingFailure {
    pub params: LinkParams,
    pub hop: Hop,
    /// Phase the last attempt failed in
    pub phase: TrainingState,
    pub reason: String,
    /// Parameters to retry with, if any remain
    pub fallback: Option<LinkParams>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TrainingOutcome {
    Trained(TrainedLink),
    Failed(TrainingFailure),
}

impl TrainingOutcome {
    pub fn is_trained(&self) -> bool {
        matches!(self, TrainingOutcome::Trained(_))
    }
}

/// Source of lower link parameters after a failed training
pub trait LinkFallback {
    fn fallback(&mut self, failed: &LinkParams) -> Option<LinkParams>;
}

/// Escalation when training has run out of fallbacks
pub trait ReconfigurationRequest: Send + Sync {
    fn request_full_reconfiguration(&self, stream: StreamId);
}

/// Records reconfiguration requests for a later modeset
#[derive(Debug, Default)]
pub struct ReconfigurationLog {
    requests: Mutex<Vec<StreamId>>,
}

impl ReconfigurationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Vec<StreamId> {
        self.requests.lock().clone()
    }
}

impl ReconfigurationRequest for ReconfigurationLog {
    fn request_full_reconfiguration(&self, stream: StreamId) {
        tracing::info!("Full reconfiguration requested for stream {}", stream);
        self.requests.lock().push(stream);
    }
}

/// `Err` carries the reason the phase did not converge
type PhaseResult = std::result::Result<(), String>;

struct HopFailure {
    hop: Hop,
    phase: TrainingState,
    reason: String,
}

pub struct LinkTrainer<'a> {
    aux: &'a dyn DpAux,
    source: SourceCaps,
    sink: SinkCaps,
    delay: &'a dyn Delay,
    streams: Vec<StreamId>,
    state: TrainingState,
    attempts: u32,
}

impl<'a> LinkTrainer<'a> {
    pub fn new(aux: &'a dyn DpAux, source: SourceCaps, sink: SinkCaps, delay: &'a dyn Delay) -> Self {
        Self {
            aux,
            source,
            sink,
            delay,
            streams: Vec::new(),
            state: TrainingState::Idle,
            attempts: 0,
        }
    }

    /// Streams driven over this link, named in reconfiguration requests
    pub fn with_streams(mut self, streams: Vec<StreamId>) -> Self {
        self.streams = streams;
        self
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Training attempts made so far, one per link parameter set
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn transition(&mut self, to: TrainingState) {
        if self.state != to {
            tracing::debug!("[{}] Training {:?} -> {:?}", self.aux.name(), self.state, to);
            self.state = to;
        }
    }

    /// Program link rate, lane count, downspread and channel coding
    pub fn prepare(&self, params: &LinkParams) -> Result<()> {
        let bw_code = link::link_rate_to_bw_code(params.link_rate);
        tracing::debug!("[{}] Using LINK_BW_SET value {:02x}", self.aux.name(), bw_code);

        let mut lane_count = params.lane_count;
        if self.sink.enhanced_frame {
            lane_count |= link::LANE_COUNT_ENHANCED_FRAME_EN;
        }
        self.aux.write(addr::LINK_BW_SET, &[bw_code, lane_count])?;

        let coding = if link::is_uhbr_rate(params.link_rate) {
            link::SET_ANSI_128B132B
        } else {
            link::SET_ANSI_8B10B
        };
        self.aux.write(addr::DOWNSPREAD_CTRL, &[0, coding])
    }

    pub fn repeater_caps(&self, params: &LinkParams) -> Result<LttprCaps> {
        let mut buf = [0u8; lttpr::LTTPR_COMMON_CAP_SIZE];
        let base = lttpr_addr::LT_TUNABLE_PHY_REPEATER_FIELD_DATA_STRUCTURE_REV;
        self.aux.read(base, &mut buf)?;
        tracing::debug!("[{}] LTTPR info: {:02x?}", self.aux.name(), buf);

        let code = buf[(lttpr_addr::PHY_REPEATER_CNT - base) as usize];
        let count = lttpr::phy_repeater_count(code).unwrap_or_else(|| {
            tracing::warn!(
                "[{}] Invalid PHY repeater count code {:02x}",
                self.aux.name(),
                code
            );
            0
        });
        if count == 0 {
            return Ok(LttprCaps::default());
        }

        let caps = LttprCaps {
            count,
            max_link_rate: link::bw_code_to_link_rate(
                buf[(lttpr_addr::MAX_LINK_RATE_PHY_REPEATER - base) as usize],
            ),
            max_lane_count: buf[(lttpr_addr::MAX_LANE_COUNT_PHY_REPEATER - base) as usize],
        };

        if caps.max_link_rate < params.link_rate {
            tracing::warn!(
                "[{}] LTTPR max rate {} Mb/s below link rate {} Mb/s",
                self.aux.name(),
                caps.max_link_rate,
                params.link_rate
            );
        }
        if caps.max_lane_count < params.lane_count {
            tracing::warn!(
                "[{}] LTTPR max lane count {} below link lane count {}",
                self.aux.name(),
                caps.max_lane_count,
                params.lane_count
            );
        }

        Ok(caps)
    }

    /// Switch the repeaters to transparent, then optionally non-transparent mode
    pub fn set_repeater_mode(&self, transparent: bool) -> Result<()> {
        self.aux.write_byte(
            lttpr_addr::PHY_REPEATER_MODE,
            lttpr::PHY_REPEATER_MODE_TRANSPARENT,
        )?;
        if transparent {
            return Ok(());
        }
        self.aux.write_byte(
            lttpr_addr::PHY_REPEATER_MODE,
            lttpr::PHY_REPEATER_MODE_NON_TRANSPARENT,
        )
    }

    /// Pattern used for channel equalization at `params`
    pub fn training_pattern(&self, params: &LinkParams) -> TrainingPattern {
        let source_tps4 = self.source.supports_hbr3;
        if source_tps4 && self.sink.tps4 {
            return TrainingPattern::Tps4;
        } else if params.link_rate == link::rate::HBR3 {
            if !source_tps4 {
                tracing::debug!("8.1 Gbps link rate without source HBR3/TPS4 support");
            }
            if !self.sink.tps4 {
                tracing::debug!("8.1 Gbps link rate without sink TPS4 support");
            }
        }

        let source_tps3 = self.source.supports_hbr2;
        if source_tps3 && self.sink.tps3 {
            return TrainingPattern::Tps3;
        } else if params.link_rate >= link::rate::HBR2 {
            if !source_tps3 {
                tracing::debug!(">=5.4 Gbps link rate without source HBR2/TPS3 support");
            }
            if !self.sink.tps3 {
                tracing::debug!(">=5.4 Gbps link rate without sink TPS3 support");
            }
        }

        TrainingPattern::Tps2
    }

    pub fn clock_recovery(
        &mut self,
        proto: &LinkStatusProtocol<'_>,
        hop: Hop,
        drive: &mut DriveSettings,
    ) -> Result<PhaseResult> {
        self.transition(TrainingState::ClockRecovery);
        let lanes = proto.lane_count();

        *drive = DriveSettings::reset();
        proto.write_training_pattern(
            hop,
            TrainingPatternSet::new(TrainingPattern::Tps1, true),
            drive,
        )?;

        let max_tries = self.sink.max_cr_tries();
        let mut voltage_tries = 1;
        let mut max_vswing_reached = false;

        for _ in 0..max_tries {
            self.delay
                .wait(clock_recovery_delay(self.sink.aux_rd_interval));

            let status = proto.read_link_status(hop)?;
            if status.clock_recovery_ok(lanes) {
                tracing::debug!("[{}] {} clock recovery OK", self.aux.name(), hop);
                return Ok(Ok(()));
            }

            if voltage_tries == MAX_SAME_VOLTAGE_TRIES {
                return Ok(Err("same voltage tried 5 times".to_string()));
            }

            if max_vswing_reached {
                return Ok(Err("max voltage swing reached".to_string()));
            }

            let voltage = drive.voltage_swing();
            *drive = DriveSettings::adjusted(&status, lanes, &self.source);
            proto.write_drive_settings(hop, drive)?;

            if drive.voltage_swing() == voltage {
                voltage_tries += 1;
            } else {
                voltage_tries = 1;
            }

            if drive.max_swing_reached(lanes) {
                max_vswing_reached = true;
            }
        }

        Ok(Err(format!("failed clock recovery {max_tries} times")))
    }

    pub fn channel_equalization(
        &mut self,
        proto: &LinkStatusProtocol<'_>,
        hop: Hop,
        params: &LinkParams,
        drive: &mut DriveSettings,
    ) -> Result<PhaseResult> {
        self.transition(TrainingState::ChannelEqualization);
        let lanes = proto.lane_count();

        let pattern = self.training_pattern(params);
        let scrambling_disabled = pattern != TrainingPattern::Tps4;
        proto.write_training_pattern(
            hop,
            TrainingPatternSet::new(pattern, scrambling_disabled),
            drive,
        )?;

        for _ in 0..MAX_EQ_TRIES {
            self.delay.wait(channel_eq_delay(self.sink.aux_rd_interval));

            let status = proto.read_link_status(hop)?;
            if !status.clock_recovery_ok(lanes) {
                tracing::debug!("[{}] {} {}", self.aux.name(), hop, status);
                return Ok(Err(
                    "clock recovery lost during channel equalization".to_string()
                ));
            }

            if status.channel_eq_ok(lanes) {
                tracing::debug!("[{}] {} channel EQ done", self.aux.name(), hop);
                return Ok(Ok(()));
            }

            *drive = DriveSettings::adjusted(&status, lanes, &self.source);
            proto.write_drive_settings(hop, drive)?;
        }

        Ok(Err(format!(
            "channel equalization failed {MAX_EQ_TRIES} times"
        )))
    }

    fn train_hop(
        &mut self,
        proto: &LinkStatusProtocol<'_>,
        hop: Hop,
        params: &LinkParams,
    ) -> Result<std::result::Result<(), HopFailure>> {
        let mut drive = DriveSettings::reset();

        if let Err(reason) = self.clock_recovery(proto, hop, &mut drive)? {
            return Ok(Err(HopFailure {
                hop,
                phase: TrainingState::ClockRecovery,
                reason,
            }));
        }

        if let Err(reason) = self.channel_equalization(proto, hop, params, &mut drive)? {
            return Ok(Err(HopFailure {
                hop,
                phase: TrainingState::ChannelEqualization,
                reason,
            }));
        }

        tracing::debug!(
            "[{}] Link training passed at {} Mb/s x{} at {}",
            self.aux.name(),
            params.link_rate,
            params.lane_count,
            hop
        );
        Ok(Ok(()))
    }

    /// Train every hop from repeater `repeaters` down to the sink
    fn train_link_with_lttpr_mode(
        &mut self,
        params: &LinkParams,
        repeaters: u8,
    ) -> Result<std::result::Result<(), HopFailure>> {
        self.prepare(params)?;
        let proto = LinkStatusProtocol::new(self.aux, params.lane_count);

        for index in (0..=repeaters).rev() {
            let hop = Hop::from_index(index);
            if let Err(failure) = self.train_hop(&proto, hop, params)? {
                return Ok(Err(failure));
            }
            proto.write_training_pattern(
                hop,
                TrainingPatternSet::disable(),
                &DriveSettings::reset(),
            )?;
        }

        Ok(Ok(()))
    }

    /// Train the link at `params`
    ///
    /// On failure the fallback source is consulted for the next parameters;
    /// without one, every stream on the link is handed to `reconfig`.
    pub fn start_link_training(
        &mut self,
        params: LinkParams,
        fallback: &mut dyn LinkFallback,
        reconfig: &dyn ReconfigurationRequest,
    ) -> Result<TrainingOutcome> {
        self.state = TrainingState::Idle;
        self.attempts += 1;

        let caps = self.repeater_caps(&params)?;
        tracing::debug!("[{}] Number of LTTPRs: {}", self.aux.name(), caps.count);

        if caps.count > 0 {
            self.set_repeater_mode(false)?;
        }

        let mut mode = if caps.count > 0 {
            LttprMode::NonTransparent
        } else {
            LttprMode::NoRepeaters
        };
        let mut repeaters = caps.count;
        let mut result = self.train_link_with_lttpr_mode(&params, repeaters)?;

        if result.is_err() && caps.count > 0 {
            tracing::debug!(
                "[{}] Link training in LTTPR non-transparent mode failed, retrying in transparent mode",
                self.aux.name()
            );
            self.set_repeater_mode(true)?;
            mode = LttprMode::Transparent;
            repeaters = 0;
            result = self.train_link_with_lttpr_mode(&params, 0)?;
        }

        match result {
            Ok(()) => {
                self.transition(TrainingState::Trained);
                tracing::info!(
                    "[{}] Link trained at {} Mb/s x{} ({:?}, {} repeaters)",
                    self.aux.name(),
                    params.link_rate,
                    params.lane_count,
                    mode,
                    repeaters
                );
                Ok(TrainingOutcome::Trained(TrainedLink {
                    params,
                    repeaters,
                    mode,
                }))
            }
            Err(failure) => {
                self.transition(TrainingState::Failed);
                tracing::warn!(
                    "[{}] Link training failed at {} Mb/s x{} at {}: {}",
                    self.aux.name(),
                    params.link_rate,
                    params.lane_count,
                    failure.hop,
                    failure.reason
                );

                let next = fallback.fallback(&params);
                if next.is_none() {
                    tracing::error!(
                        "[{}] No link training fallback left, requesting reconfiguration",
                        self.aux.name()
                    );
                    for &stream in &self.streams {
                        reconfig.request_full_reconfiguration(stream);
                    }
                }

                Ok(TrainingOutcome::Failed(TrainingFailure {
                    params,
                    hop: failure.hop,
                    phase: failure.phase,
                    reason: failure.reason,
                    fallback: next,
                }))
            }
        }
    }

    /// Train, stepping through fallback parameters until one trains or
    /// none are left
    pub fn train_with_fallback(
        &mut self,
        initial: LinkParams,
        fallback: &mut dyn LinkFallback,
        reconfig: &dyn ReconfigurationRequest,
    ) -> Result<TrainingOutcome> {
        let mut params = initial;
        loop {
            match self.start_link_training(params, fallback, reconfig)? {
                TrainingOutcome::Failed(TrainingFailure {
                    fallback: Some(next),
                    ..
                }) => params = next,
                outcome => return Ok(outcome),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::delay::NoDelay;
    use crate::sim::{HopBehavior, RepeaterModel, SimDpcd, SinkModel};
    use crate::training::fallback::RateLaneFallback;

    struct NoFallback;

    impl LinkFallback for NoFallback {
        fn fallback(&mut self, _failed: &LinkParams) -> Option<LinkParams> {
            None
        }
    }

    fn hbr2_x2() -> LinkParams {
        LinkParams {
            link_rate: link::rate::HBR2,
            lane_count: 2,
        }
    }

    fn prepared(sim: &SimDpcd, params: &LinkParams) -> SinkCaps {
        let sink = SinkCaps::read(sim).unwrap();
        sim.write(
            addr::LINK_BW_SET,
            &[link::link_rate_to_bw_code(params.link_rate), params.lane_count],
        )
        .unwrap();
        sink
    }

    #[test]
    fn test_sink_caps_read() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel {
            dpcd_rev: 0x12,
            max_link_rate: link::rate::HBR2,
            max_lanes: 2,
            tps4: false,
            aux_rd_interval: 1,
            ..Default::default()
        });
        let caps = SinkCaps::read(&sim).unwrap();
        assert_eq!(caps.dpcd_rev, 0x12);
        assert_eq!(caps.max_link_rate, 5400);
        assert_eq!(caps.max_lane_count, 2);
        assert!(caps.tps3);
        assert!(!caps.tps4);
        assert!(caps.enhanced_frame);
        assert_eq!(caps.max_cr_tries(), 80);
    }

    #[test]
    fn test_clock_recovery_ok_on_first_read() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel::default());
        let params = hbr2_x2();
        let sink = prepared(&sim, &params);
        let mut trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay);
        let proto = LinkStatusProtocol::new(&sim, 2);
        let mut drive = DriveSettings::reset();

        let result = trainer
            .clock_recovery(&proto, Hop::Sink, &mut drive)
            .unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(trainer.state(), TrainingState::ClockRecovery);

        // TPS1 + scrambling disabled, lane settings reset, no adjustment
        assert_eq!(sim.writes_to(addr::TRAINING_PATTERN_SET), vec![vec![0x21, 0, 0]]);
        assert!(sim.writes_to(addr::TRAINING_LANE0_SET).is_empty());
        assert_eq!(sim.reads_of(addr::LANE0_1_STATUS), 1);
        assert_eq!(drive, DriveSettings::reset());

        let result = trainer
            .channel_equalization(&proto, Hop::Sink, &params, &mut drive)
            .unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(trainer.state(), TrainingState::ChannelEqualization);
    }

    #[test]
    fn test_max_voltage_swing_stuck_fails() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel {
            behavior: HopBehavior::stuck_requesting(3, 0),
            ..Default::default()
        });
        let params = hbr2_x2();
        let sink = prepared(&sim, &params);
        let mut trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay);
        let proto = LinkStatusProtocol::new(&sim, 2);
        let mut drive = DriveSettings::reset();

        let result = trainer
            .clock_recovery(&proto, Hop::Sink, &mut drive)
            .unwrap();
        assert_eq!(result, Err("max voltage swing reached".to_string()));
        // One adjustment to max swing, then the next non-converging read fails
        assert_eq!(sim.reads_of(addr::LANE0_1_STATUS), 2);
        assert_eq!(sim.writes_to(addr::TRAINING_LANE0_SET), vec![vec![0x07, 0x07]]);
    }

    #[test]
    fn test_same_voltage_five_times_fails() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel {
            behavior: HopBehavior::stuck_requesting(1, 0),
            ..Default::default()
        });
        let params = hbr2_x2();
        let sink = prepared(&sim, &params);
        let mut trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay);
        let proto = LinkStatusProtocol::new(&sim, 2);
        let mut drive = DriveSettings::reset();

        let result = trainer
            .clock_recovery(&proto, Hop::Sink, &mut drive)
            .unwrap();
        assert_eq!(result, Err("same voltage tried 5 times".to_string()));
        assert_eq!(sim.reads_of(addr::LANE0_1_STATUS), 6);
        assert!(sim.reads_of(addr::LANE0_1_STATUS) as u32 <= sink.max_cr_tries());
    }

    #[test]
    fn test_legacy_sink_gets_80_clock_recovery_tries() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel {
            dpcd_rev: 0x12,
            behavior: HopBehavior::oscillating(1),
            ..Default::default()
        });
        let params = hbr2_x2();
        let sink = prepared(&sim, &params);
        assert_eq!(sink.max_cr_tries(), 80);
        let mut trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay);
        let proto = LinkStatusProtocol::new(&sim, 2);
        let mut drive = DriveSettings::reset();

        let result = trainer
            .clock_recovery(&proto, Hop::Sink, &mut drive)
            .unwrap();
        assert_eq!(result, Err("failed clock recovery 80 times".to_string()));
        assert_eq!(sim.reads_of(addr::LANE0_1_STATUS), 80);
    }

    #[test]
    fn test_dp14_sink_gets_10_clock_recovery_tries() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel {
            behavior: HopBehavior::oscillating(1),
            ..Default::default()
        });
        let params = hbr2_x2();
        let sink = prepared(&sim, &params);
        let mut trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay);
        let proto = LinkStatusProtocol::new(&sim, 2);
        let mut drive = DriveSettings::reset();

        let result = trainer
            .clock_recovery(&proto, Hop::Sink, &mut drive)
            .unwrap();
        assert_eq!(result, Err("failed clock recovery 10 times".to_string()));
        assert_eq!(sim.reads_of(addr::LANE0_1_STATUS), 10);
    }

    #[test]
    fn test_channel_eq_aborts_when_cr_lost() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel {
            behavior: HopBehavior {
                drop_cr_in_eq: true,
                ..Default::default()
            },
            ..Default::default()
        });
        let sink = SinkCaps::read(&sim).unwrap();
        let mut trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay)
            .with_streams(vec![StreamId(0)]);
        let reconfig = ReconfigurationLog::new();

        let outcome = trainer
            .start_link_training(hbr2_x2(), &mut NoFallback, &reconfig)
            .unwrap();
        match outcome {
            TrainingOutcome::Failed(failure) => {
                assert_eq!(failure.phase, TrainingState::ChannelEqualization);
                assert_eq!(failure.hop, Hop::Sink);
                assert_eq!(failure.fallback, None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(trainer.state(), TrainingState::Failed);
        assert_eq!(reconfig.requested(), vec![StreamId(0)]);
    }

    #[test]
    fn test_training_pattern_selection() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel {
            tps4: false,
            ..Default::default()
        });
        let sink = SinkCaps::read(&sim).unwrap();
        let params = LinkParams {
            link_rate: link::rate::HBR3,
            lane_count: 4,
        };

        let trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay);
        assert_eq!(trainer.training_pattern(&params), TrainingPattern::Tps3);

        let legacy = SourceCaps {
            supports_hbr2: false,
            supports_hbr3: false,
            ..Default::default()
        };
        let trainer = LinkTrainer::new(&sim, legacy, sink, &NoDelay);
        assert_eq!(trainer.training_pattern(&params), TrainingPattern::Tps2);

        let sink4 = SinkCaps { tps4: true, ..sink };
        let trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink4, &NoDelay);
        assert_eq!(trainer.training_pattern(&params), TrainingPattern::Tps4);
    }

    #[test]
    fn test_full_training_programs_link() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel::default());
        let sink = SinkCaps::read(&sim).unwrap();
        let mut trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay);

        let outcome = trainer
            .start_link_training(hbr2_x2(), &mut NoFallback, &ReconfigurationLog::new())
            .unwrap();
        assert!(outcome.is_trained());
        assert_eq!(trainer.state(), TrainingState::Trained);

        assert_eq!(
            sim.writes_to(addr::LINK_BW_SET),
            vec![vec![link::bw_code::HBR2, 0x82]]
        );
        assert_eq!(sim.writes_to(addr::DOWNSPREAD_CTRL), vec![vec![0, 1]]);
        // TPS1, TPS4 (scrambled), disable
        assert_eq!(
            sim.writes_to(addr::TRAINING_PATTERN_SET),
            vec![vec![0x21, 0, 0], vec![0x07, 0, 0], vec![0x00]]
        );
    }

    #[test]
    fn test_repeaters_trained_far_to_near() {
        let sim = SimDpcd::new("AUX A")
            .with_sink(SinkModel::default())
            .with_repeaters(RepeaterModel {
                max_link_rate: link::rate::HBR3,
                max_lanes: 4,
                hops: vec![HopBehavior::default(), HopBehavior::default()],
            });
        let sink = SinkCaps::read(&sim).unwrap();
        let mut trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay);

        let outcome = trainer
            .start_link_training(hbr2_x2(), &mut NoFallback, &ReconfigurationLog::new())
            .unwrap();
        match outcome {
            TrainingOutcome::Trained(link) => {
                assert_eq!(link.mode, LttprMode::NonTransparent);
                assert_eq!(link.repeaters, 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        assert_eq!(
            sim.writes_to(lttpr_addr::PHY_REPEATER_MODE),
            vec![vec![0x55], vec![0xAA]]
        );

        let hop_order: Vec<u32> = sim
            .accesses()
            .iter()
            .filter(|a| {
                a.kind == crate::sim::AccessKind::Write
                    && [0xF0060, 0xF0010, addr::TRAINING_PATTERN_SET].contains(&a.address)
                    && a.data[0] == 0x21
            })
            .map(|a| a.address)
            .collect();
        assert_eq!(hop_order, vec![0xF0060, 0xF0010, addr::TRAINING_PATTERN_SET]);
    }

    #[test]
    fn test_repeater_failure_retries_transparent() {
        let sim = SimDpcd::new("AUX A")
            .with_sink(SinkModel::default())
            .with_repeaters(RepeaterModel {
                max_link_rate: link::rate::HBR3,
                max_lanes: 4,
                hops: vec![HopBehavior::never_locks()],
            });
        let sink = SinkCaps::read(&sim).unwrap();
        let mut trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay);

        let outcome = trainer
            .start_link_training(hbr2_x2(), &mut NoFallback, &ReconfigurationLog::new())
            .unwrap();
        match outcome {
            TrainingOutcome::Trained(link) => {
                assert_eq!(link.mode, LttprMode::Transparent);
                assert_eq!(link.repeaters, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            sim.writes_to(lttpr_addr::PHY_REPEATER_MODE),
            vec![vec![0x55], vec![0xAA], vec![0x55]]
        );
    }

    #[test]
    fn test_fallback_until_link_trains() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel {
            behavior: HopBehavior::default().limited_to(link::rate::HBR, 4),
            ..Default::default()
        });
        let sink = SinkCaps::read(&sim).unwrap();
        let source = SourceCaps::default();
        let mut fallback = RateLaneFallback::new(&source, &sink);
        let mut trainer = LinkTrainer::new(&sim, source, sink, &NoDelay);

        let outcome = trainer
            .train_with_fallback(fallback.max_params(), &mut fallback, &ReconfigurationLog::new())
            .unwrap();
        match outcome {
            TrainingOutcome::Trained(link) => {
                assert_eq!(link.params.link_rate, link::rate::HBR);
                assert_eq!(link.params.lane_count, 4);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // HBR3, HBR2, HBR
        assert_eq!(trainer.attempts(), 3);
    }

    #[test]
    fn test_transport_error_propagates() {
        let sim = SimDpcd::new("AUX A").with_sink(SinkModel::default());
        let sink = SinkCaps::read(&sim).unwrap();
        sim.fail_at(addr::LANE0_1_STATUS);
        let mut trainer = LinkTrainer::new(&sim, SourceCaps::default(), sink, &NoDelay);

        let err = trainer
            .start_link_training(hbr2_x2(), &mut NoFallback, &ReconfigurationLog::new())
            .unwrap_err();
        assert!(err.is_transport());
    }
}
