//! Iterative bpp/limit solver
//!
//! Streams are computed against the current limits, then the link checkers
//! decide whether the result fits. An oversubscribed link gets the ceiling
//! of its highest-bpp stream lowered and the whole computation repeats.
//! A stream that no longer computes is stepped back to its last working
//! ceiling and pinned there.

use serde::Serialize;

use super::limits::LinkBwLimits;
use super::stream::{validate_streams, Stream, StreamId, StreamMask};
use crate::error::{DplinkError, Result};

/// Lowest bpp any stream may run at: 6 bpc RGB
pub const MIN_PIPE_BPP: u32 = 18;

/// bpp granularity: two 3-component steps
pub const PIPE_BPP_STEP: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamConfig {
    pub id: StreamId,
    pub bpp: u32,
    pub fec: bool,
    /// Mb/s
    pub required_bw: u32,
}

/// Per-stream configuration against a bpp ceiling
pub trait StreamConfigurator {
    /// `None` when the stream cannot be configured under `limits`
    fn compute(&self, stream: &Stream, limits: &LinkBwLimits) -> Option<StreamConfig>;
}

/// Clamp a stream's native bpp to a ceiling, in whole 6 bpp steps
pub fn compute_pipe_bpp(native_bpp: u32, max_bpp_x16: u32) -> Option<u32> {
    let bpp = native_bpp.min(max_bpp_x16 >> 4);
    let bpp = bpp - bpp % PIPE_BPP_STEP;
    (bpp >= MIN_PIPE_BPP).then_some(bpp)
}

/// Uncompressed pipe configuration
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeBppConfigurator;

impl StreamConfigurator for PipeBppConfigurator {
    fn compute(&self, stream: &Stream, limits: &LinkBwLimits) -> Option<StreamConfig> {
        let bpp = compute_pipe_bpp(stream.native_bpp, limits.max_bpp_x16(stream.id))?;
        let fec = limits.force_fec_streams.contains(stream.id);
        Some(StreamConfig {
            id: stream.id,
            bpp,
            fec,
            required_bw: stream.required_bandwidth(bpp * 16, fec),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkCheck {
    Fits,
    /// Reduce bpp on one of these streams and retry
    Oversubscribed(StreamMask),
    /// Enable FEC on these streams and retry
    ForceFec(StreamMask),
}

/// A bandwidth constraint shared by several streams
pub trait LinkBwChecker {
    fn check(&mut self, configs: &[StreamConfig]) -> Result<LinkCheck>;
}

/// Plain multi-stream link with a fixed payload capacity
#[derive(Debug, Clone)]
pub struct LinkCapacityChecker {
    pub name: String,
    /// Mb/s
    pub capacity: u32,
    pub streams: StreamMask,
    /// Streams on the link must run with FEC
    pub requires_fec: bool,
}

impl LinkCapacityChecker {
    pub fn new(name: impl Into<String>, capacity: u32, streams: StreamMask) -> Self {
        Self {
            name: name.into(),
            capacity,
            streams,
            requires_fec: false,
        }
    }

    pub fn with_fec(mut self) -> Self {
        self.requires_fec = true;
        self
    }
}

impl LinkBwChecker for LinkCapacityChecker {
    fn check(&mut self, configs: &[StreamConfig]) -> Result<LinkCheck> {
        let on_link: Vec<&StreamConfig> = configs
            .iter()
            .filter(|c| self.streams.contains(c.id))
            .collect();

        if self.requires_fec {
            let missing: StreamMask = on_link.iter().filter(|c| !c.fec).map(|c| c.id).collect();
            if !missing.is_empty() {
                tracing::debug!("[{}] Forcing FEC on streams {}", self.name, missing);
                return Ok(LinkCheck::ForceFec(missing));
            }
        }

        let total: u64 = on_link.iter().map(|c| c.required_bw as u64).sum();
        if total > self.capacity as u64 {
            let mask: StreamMask = on_link.iter().map(|c| c.id).collect();
            tracing::debug!(
                "[{}] Required {} Mb/s exceeds capacity {} Mb/s (streams {})",
                self.name,
                total,
                self.capacity,
                mask
            );
            return Ok(LinkCheck::Oversubscribed(mask));
        }

        Ok(LinkCheck::Fits)
    }
}

/// Runs checkers in order, returning the first verdict other than `Fits`
#[derive(Default)]
pub struct CheckerChain<'a> {
    checkers: Vec<&'a mut dyn LinkBwChecker>,
}

impl<'a> CheckerChain<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, checker: &'a mut dyn LinkBwChecker) {
        self.checkers.push(checker);
    }
}

impl LinkBwChecker for CheckerChain<'_> {
    fn check(&mut self, configs: &[StreamConfig]) -> Result<LinkCheck> {
        for checker in self.checkers.iter_mut() {
            match checker.check(configs)? {
                LinkCheck::Fits => continue,
                verdict => return Ok(verdict),
            }
        }
        Ok(LinkCheck::Fits)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub configs: Vec<StreamConfig>,
    pub limits: LinkBwLimits,
    /// Compute/check rounds taken
    pub iterations: u32,
}

impl Assignment {
    pub fn config(&self, id: StreamId) -> Option<&StreamConfig> {
        self.configs.iter().find(|c| c.id == id)
    }
}

/// Upper bound on solver rounds for `streams`
///
/// Every round tightens a ceiling by at least one 1/16 bpp step, pins a
/// stream or forces FEC on one.
fn iteration_bound(streams: &[Stream]) -> Result<u32> {
    streams
        .iter()
        .try_fold(2 * streams.len() as u32 + 1, |bound, s| {
            s.native_bpp.checked_mul(16)?.checked_add(bound)
        })
        .ok_or_else(|| DplinkError::ConfigError("stream bpp out of range".to_string()))
}

fn compute_all(
    streams: &[Stream],
    limits: &LinkBwLimits,
    configurator: &dyn StreamConfigurator,
) -> std::result::Result<Vec<StreamConfig>, StreamId> {
    streams
        .iter()
        .map(|s| configurator.compute(s, limits).ok_or(s.id))
        .collect()
}

/// Find per-stream bpp values that every checker accepts
pub fn solve_link_limits(
    streams: &[Stream],
    configurator: &dyn StreamConfigurator,
    checker: &mut dyn LinkBwChecker,
) -> Result<Assignment> {
    solve_with_limits(
        streams,
        LinkBwLimits::init(streams, StreamMask::EMPTY)?,
        configurator,
        checker,
    )
}

pub fn solve_with_limits(
    streams: &[Stream],
    initial: LinkBwLimits,
    configurator: &dyn StreamConfigurator,
    checker: &mut dyn LinkBwChecker,
) -> Result<Assignment> {
    validate_streams(streams)?;
    let bound = iteration_bound(streams)?;
    let mut old = initial.clone();
    let mut new = initial;
    let mut iterations = 0;

    loop {
        iterations += 1;
        assert!(
            iterations <= bound,
            "link bandwidth solver exceeded {bound} rounds"
        );

        let configs = match compute_all(streams, &new, configurator) {
            Ok(configs) => configs,
            Err(failed) => {
                if new.reset_stream_limit_to_min(&old, failed) {
                    continue;
                }
                tracing::debug!("{} cannot be configured under current limits", failed);
                return Err(DplinkError::Infeasible(format!(
                    "{failed} has no valid bpp at or above {MIN_PIPE_BPP}"
                )));
            }
        };

        old = new.clone();

        match checker.check(&configs)? {
            LinkCheck::Fits => {
                tracing::debug!("Link bandwidth limits resolved after {} rounds", iterations);
                return Ok(Assignment {
                    configs,
                    limits: new,
                    iterations,
                });
            }
            LinkCheck::Oversubscribed(mask) => {
                let bpp_of = |id: StreamId| configs.iter().find(|c| c.id == id).map(|c| c.bpp);
                if new.reduce_link_bpp(mask, bpp_of).is_none() {
                    return Err(DplinkError::Infeasible(format!(
                        "no stream in {mask} can be reduced further"
                    )));
                }
            }
            LinkCheck::ForceFec(mask) => {
                new.force_fec_streams = new.force_fec_streams.union(mask);
            }
        }

        new.assert_change_valid(&old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link_bw::limits::UNBOUNDED_BPP_X16;

    fn streams() -> Vec<Stream> {
        vec![
            Stream::new(StreamId(0), 148_500, 30),
            Stream::new(StreamId(1), 148_500, 24),
        ]
    }

    fn all(streams: &[Stream]) -> StreamMask {
        streams.iter().map(|s| s.id).collect()
    }

    /// Records every limit set the solver computes against
    struct RecordingConfigurator {
        seen: std::cell::RefCell<Vec<LinkBwLimits>>,
    }

    impl StreamConfigurator for RecordingConfigurator {
        fn compute(&self, stream: &Stream, limits: &LinkBwLimits) -> Option<StreamConfig> {
            if stream.id == StreamId(0) {
                self.seen.borrow_mut().push(limits.clone());
            }
            PipeBppConfigurator.compute(stream, limits)
        }
    }

    #[test]
    fn test_compute_pipe_bpp_rounding() {
        assert_eq!(compute_pipe_bpp(30, UNBOUNDED_BPP_X16), Some(30));
        assert_eq!(compute_pipe_bpp(30, 30 * 16 - 1), Some(24));
        assert_eq!(compute_pipe_bpp(24, 23 * 16 + 15), Some(18));
        assert_eq!(compute_pipe_bpp(36, 20 * 16), Some(18));
        assert_eq!(compute_pipe_bpp(36, 18 * 16 - 1), None);
        for ceiling in (0..40 * 16).step_by(7) {
            if let Some(bpp) = compute_pipe_bpp(36, ceiling) {
                assert_eq!(bpp % 6, 0);
                assert!(bpp >= 18);
            }
        }
    }

    #[test]
    fn test_fits_first_round() {
        let s = streams();
        let mut link = LinkCapacityChecker::new("DDI A", 17_280, all(&s));
        let result = solve_link_limits(&s, &PipeBppConfigurator, &mut link).unwrap();
        assert_eq!(result.iterations, 1);
        assert_eq!(result.config(StreamId(0)).unwrap().bpp, 30);
        assert_eq!(result.config(StreamId(1)).unwrap().bpp, 24);
    }

    #[test]
    fn test_reduces_highest_bpp_until_fit() {
        let s = streams();
        // 30 bpp = 4455, 24 bpp = 3564, 18 bpp = 2673
        let mut link = LinkCapacityChecker::new("DDI A", 7_200, all(&s));
        let configurator = RecordingConfigurator {
            seen: Default::default(),
        };
        let result = solve_link_limits(&s, &configurator, &mut link).unwrap();

        let total: u32 = result.configs.iter().map(|c| c.required_bw).sum();
        assert!(total <= 7_200);
        assert_eq!(result.config(StreamId(0)).unwrap().bpp, 24);
        assert_eq!(result.config(StreamId(1)).unwrap().bpp, 24);

        // Ceilings never rise and every round changes something
        let seen = configurator.seen.borrow();
        for pair in seen.windows(2) {
            assert!(pair[1].is_tightening_of(&pair[0]));
        }
    }

    #[test]
    fn test_infeasible_terminates() {
        let s = streams();
        let mut link = LinkCapacityChecker::new("DDI A", 4_000, all(&s));
        let err = solve_link_limits(&s, &PipeBppConfigurator, &mut link).unwrap_err();
        assert!(matches!(err, DplinkError::Infeasible(_)));
    }

    #[test]
    fn test_fec_forced_then_fit() {
        let s = vec![Stream::new(StreamId(0), 148_500, 24)];
        let mut link = LinkCapacityChecker::new("DDI B", 17_280, all(&s)).with_fec();
        let result = solve_link_limits(&s, &PipeBppConfigurator, &mut link).unwrap();
        assert_eq!(result.iterations, 2);
        let config = result.config(StreamId(0)).unwrap();
        assert!(config.fec);
        assert_eq!(config.required_bw, 3666);
    }

    #[test]
    fn test_chain_reports_first_failing_link() {
        let s = streams();
        let mut wide = LinkCapacityChecker::new("DDI A", 100_000, all(&s));
        let mut narrow =
            LinkCapacityChecker::new("DDI B", 3_000, StreamMask::single(StreamId(1)));
        let mut chain = CheckerChain::new();
        chain.push(&mut wide);
        chain.push(&mut narrow);

        let result = solve_link_limits(&s, &PipeBppConfigurator, &mut chain).unwrap();
        assert_eq!(result.config(StreamId(0)).unwrap().bpp, 30);
        assert_eq!(result.config(StreamId(1)).unwrap().bpp, 18);
    }

    #[test]
    fn test_failed_compute_pins_stream() {
        struct FloorAt24;
        impl StreamConfigurator for FloorAt24 {
            fn compute(&self, stream: &Stream, limits: &LinkBwLimits) -> Option<StreamConfig> {
                let config = PipeBppConfigurator.compute(stream, limits)?;
                (config.bpp >= 24).then_some(config)
            }
        }

        let s = vec![Stream::new(StreamId(0), 148_500, 30)];
        let mut link = LinkCapacityChecker::new("DDI A", 4_000, all(&s));
        // 30 bpp does not fit, 24 does
        let result = solve_link_limits(&s, &FloorAt24, &mut link).unwrap();
        assert_eq!(result.config(StreamId(0)).unwrap().bpp, 24);

        // 24 does not fit either, reducing to 18 fails to compute and pins
        let mut link = LinkCapacityChecker::new("DDI A", 3_000, all(&s));
        let err = solve_link_limits(&s, &FloorAt24, &mut link).unwrap_err();
        assert!(matches!(err, DplinkError::Infeasible(_)));
    }

    #[test]
    fn test_out_of_range_streams_rejected() {
        let mut link = LinkCapacityChecker::new("DDI A", 17_280, StreamMask::EMPTY);

        let s = vec![Stream::new(StreamId(8), 148_500, 24)];
        let err = solve_link_limits(&s, &PipeBppConfigurator, &mut link).unwrap_err();
        assert!(matches!(err, DplinkError::ConfigError(_)));

        // Bypassing the initial limits still goes through validation
        let s = vec![Stream::new(StreamId(0), 148_500, u32::MAX / 8)];
        let err = solve_with_limits(&s, LinkBwLimits::default(), &PipeBppConfigurator, &mut link)
            .unwrap_err();
        assert!(matches!(err, DplinkError::ConfigError(_)));
    }

    #[test]
    fn test_iteration_bound_overflow() {
        let s = vec![Stream::new(StreamId(0), 148_500, 30)];
        assert_eq!(iteration_bound(&s).unwrap(), 30 * 16 + 3);

        let s = vec![Stream::new(StreamId(0), 148_500, u32::MAX / 8)];
        assert!(iteration_bound(&s).is_err());
    }
}
