//! Per-attempt bandwidth limits
//!
//! Within one negotiation the limits only ever tighten: a bpp ceiling never
//! rises and a forced FEC is never dropped. Every retry must tighten at
//! least one of them, which bounds the number of attempts.

use serde::Serialize;

use super::stream::{validate_streams, Stream, StreamId, StreamMask, MAX_STREAMS};
use crate::error::Result;

/// Ceiling of a stream nothing has limited yet
pub const UNBOUNDED_BPP_X16: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkBwLimits {
    pub force_fec_streams: StreamMask,
    /// Streams whose ceiling was reset after failing to compute
    pub min_bpp_streams: StreamMask,
    /// bpp ceilings in 1/16 bpp units
    pub max_bpp_x16: [u32; MAX_STREAMS],
}

impl Default for LinkBwLimits {
    fn default() -> Self {
        Self {
            force_fec_streams: StreamMask::EMPTY,
            min_bpp_streams: StreamMask::EMPTY,
            max_bpp_x16: [UNBOUNDED_BPP_X16; MAX_STREAMS],
        }
    }
}

impl LinkBwLimits {
    /// Unbounded limits for `streams`; `fec` is forced from the start
    pub fn init(streams: &[Stream], fec: StreamMask) -> Result<Self> {
        validate_streams(streams)?;
        let streams_mask: StreamMask = streams.iter().map(|s| s.id).collect();
        Ok(Self {
            force_fec_streams: fec.intersection(streams_mask),
            ..Default::default()
        })
    }

    pub fn max_bpp_x16(&self, id: StreamId) -> u32 {
        self.max_bpp_x16[id.index()]
    }

    /// Lower the ceiling of the highest-bpp stream in `mask`
    ///
    /// `bpp_of` gives each stream's current bpp. Streams already at their
    /// minimum are skipped. Returns the reduced stream, or `None` when no
    /// stream in `mask` can be reduced.
    pub fn reduce_link_bpp(
        &mut self,
        mask: StreamMask,
        bpp_of: impl Fn(StreamId) -> Option<u32>,
    ) -> Option<StreamId> {
        let (id, bpp) = mask
            .difference(self.min_bpp_streams)
            .iter()
            .filter_map(|id| bpp_of(id).map(|bpp| (id, bpp)))
            .fold(None, |best: Option<(StreamId, u32)>, (id, bpp)| match best {
                Some((_, best_bpp)) if best_bpp >= bpp => best,
                _ => Some((id, bpp)),
            })?;

        let ceiling = (bpp * 16).saturating_sub(1);
        self.max_bpp_x16[id.index()] = ceiling;
        tracing::debug!(
            "Reducing {} link bpp ceiling to {}.{:04} (current {} bpp)",
            id,
            ceiling >> 4,
            (ceiling & 0xF) * 625,
            bpp
        );
        Some(id)
    }

    /// Step a stream back to its last working ceiling and pin it there
    ///
    /// Returns false when the stream is already pinned or its ceiling was
    /// not changed since `old`, in which case nothing is left to undo.
    pub fn reset_stream_limit_to_min(&mut self, old: &LinkBwLimits, failed: StreamId) -> bool {
        if self.min_bpp_streams.contains(failed) {
            return false;
        }
        let i = failed.index();
        if self.max_bpp_x16[i] == old.max_bpp_x16[i] {
            return false;
        }

        self.max_bpp_x16[i] = old.max_bpp_x16[i];
        self.min_bpp_streams.insert(failed);
        tracing::debug!("{} ceiling reset to minimum {}", failed, old.max_bpp_x16[i]);
        true
    }

    /// Whether `self` strictly tightens `old`
    pub fn is_tightening_of(&self, old: &LinkBwLimits) -> bool {
        if !old.force_fec_streams.difference(self.force_fec_streams).is_empty() {
            return false;
        }

        let mut bpp_changed = false;
        for (new, old) in self.max_bpp_x16.iter().zip(old.max_bpp_x16.iter()) {
            if new > old {
                return false;
            }
            bpp_changed |= new < old;
        }

        bpp_changed || self.force_fec_streams != old.force_fec_streams
    }

    /// Abort on a limit change that would break convergence
    pub fn assert_change_valid(&self, old: &LinkBwLimits) {
        assert!(
            self.is_tightening_of(old),
            "link bandwidth limits must strictly tighten: {old:?} -> {self:?}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bpps(table: &[(u8, u32)]) -> impl Fn(StreamId) -> Option<u32> + '_ {
        move |id| table.iter().find(|(i, _)| *i == id.0).map(|(_, b)| *b)
    }

    #[test]
    fn test_reduce_picks_highest_bpp() {
        let mut limits = LinkBwLimits::default();
        let mask: StreamMask = [StreamId(0), StreamId(1)].into_iter().collect();

        let reduced = limits.reduce_link_bpp(mask, bpps(&[(0, 24), (1, 30)]));
        assert_eq!(reduced, Some(StreamId(1)));
        assert_eq!(limits.max_bpp_x16(StreamId(1)), 30 * 16 - 1);
        assert_eq!(limits.max_bpp_x16(StreamId(0)), UNBOUNDED_BPP_X16);
    }

    #[test]
    fn test_reduce_skips_min_streams() {
        let mut limits = LinkBwLimits::default();
        limits.min_bpp_streams.insert(StreamId(1));
        let mask: StreamMask = [StreamId(0), StreamId(1)].into_iter().collect();

        let reduced = limits.reduce_link_bpp(mask, bpps(&[(0, 24), (1, 30)]));
        assert_eq!(reduced, Some(StreamId(0)));

        limits.min_bpp_streams.insert(StreamId(0));
        assert_eq!(limits.reduce_link_bpp(mask, bpps(&[(0, 24), (1, 30)])), None);
    }

    #[test]
    fn test_reset_to_min() {
        let old = LinkBwLimits::default();
        let mut new = old.clone();
        assert!(!new.reset_stream_limit_to_min(&old, StreamId(0)));

        new.max_bpp_x16[0] = 18 * 16 - 1;
        assert!(new.reset_stream_limit_to_min(&old, StreamId(0)));
        assert_eq!(new.max_bpp_x16[0], UNBOUNDED_BPP_X16);
        assert!(new.min_bpp_streams.contains(StreamId(0)));
        assert!(!new.reset_stream_limit_to_min(&old, StreamId(0)));
    }

    #[test]
    fn test_tightening_rules() {
        let old = LinkBwLimits::default();
        assert!(!old.is_tightening_of(&old));

        let mut fec = old.clone();
        fec.force_fec_streams.insert(StreamId(2));
        assert!(fec.is_tightening_of(&old));
        assert!(!old.is_tightening_of(&fec));

        let mut lower = fec.clone();
        lower.max_bpp_x16[1] = 100;
        assert!(lower.is_tightening_of(&fec));
        assert!(!fec.is_tightening_of(&lower));
    }

    #[test]
    #[should_panic(expected = "strictly tighten")]
    fn test_unchanged_limits_abort() {
        let old = LinkBwLimits::default();
        old.clone().assert_change_valid(&old);
    }
}
