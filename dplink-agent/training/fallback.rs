//! Rate/lane fallback after a failed link training

use dplink_raw::dpcd::link::rate;

use super::machine::{LinkFallback, LinkParams, SinkCaps};
use crate::config::SourceCaps;

enum_with_data! {
    /// Per-lane link rates tried by the fallback, slowest first
    pub enum LinkRate: u32 {
        Rbr => ("RBR", rate::RBR),
        Hbr => ("HBR", rate::HBR),
        Hbr2 => ("HBR2", rate::HBR2),
        Hbr3 => ("HBR3", rate::HBR3),
        Uhbr10 => ("UHBR10", rate::UHBR10),
        Uhbr13_5 => ("UHBR13.5", rate::UHBR13_5),
        Uhbr20 => ("UHBR20", rate::UHBR20),
    }
    impl mbps -> u32
}

/// Steps down the rate first, then halves the lane count and starts over
/// at the highest common rate
#[derive(Debug, Clone)]
pub struct RateLaneFallback {
    /// Ascending
    rates: Vec<u32>,
    max_lanes: u8,
}

impl RateLaneFallback {
    /// Rates and lanes common to the source and the sink
    pub fn new(source: &SourceCaps, sink: &SinkCaps) -> Self {
        let max_rate = source.max_link_rate().min(sink.max_link_rate);
        let rates = LinkRate::all()
            .into_iter()
            .map(|r| r.mbps())
            .filter(|&r| r <= max_rate)
            .collect();
        Self::from_rates(rates, sink.max_lane_count)
    }

    pub fn from_rates(mut rates: Vec<u32>, max_lanes: u8) -> Self {
        rates.sort_unstable();
        rates.dedup();
        Self {
            rates,
            max_lanes: max_lanes.clamp(1, 4),
        }
    }

    pub fn max_params(&self) -> LinkParams {
        LinkParams {
            link_rate: self.rates.last().copied().unwrap_or(rate::RBR),
            lane_count: self.max_lanes,
        }
    }
}

impl LinkFallback for RateLaneFallback {
    fn fallback(&mut self, failed: &LinkParams) -> Option<LinkParams> {
        let lower = self
            .rates
            .iter()
            .rev()
            .copied()
            .find(|&r| r < failed.link_rate);

        let next = match lower {
            Some(link_rate) => LinkParams {
                link_rate,
                lane_count: failed.lane_count,
            },
            None if failed.lane_count > 1 => LinkParams {
                link_rate: self.max_params().link_rate,
                lane_count: failed.lane_count / 2,
            },
            None => return None,
        };

        tracing::debug!(
            "Link training fallback {} Mb/s x{} -> {} Mb/s x{}",
            failed.link_rate,
            failed.lane_count,
            next.link_rate,
            next.lane_count
        );
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(link_rate: u32, lane_count: u8) -> LinkParams {
        LinkParams {
            link_rate,
            lane_count,
        }
    }

    #[test]
    fn test_link_rate_table() {
        assert_eq!(LinkRate::Hbr2.mbps(), 5400);
        assert_eq!(LinkRate::Uhbr13_5.name(), "UHBR13.5");
        assert_eq!(LinkRate::all().len(), 7);
    }

    #[test]
    fn test_rates_then_lanes() {
        let mut fb = RateLaneFallback::from_rates(vec![rate::HBR2, rate::RBR, rate::HBR], 4);
        assert_eq!(fb.max_params(), params(rate::HBR2, 4));

        let mut seen = Vec::new();
        let mut cur = fb.max_params();
        while let Some(next) = fb.fallback(&cur) {
            seen.push(next);
            cur = next;
        }

        assert_eq!(
            seen,
            vec![
                params(rate::HBR, 4),
                params(rate::RBR, 4),
                params(rate::HBR2, 2),
                params(rate::HBR, 2),
                params(rate::RBR, 2),
                params(rate::HBR2, 1),
                params(rate::HBR, 1),
                params(rate::RBR, 1),
            ]
        );
    }

    #[test]
    fn test_common_caps() {
        let sink = SinkCaps {
            dpcd_rev: 0x14,
            max_link_rate: rate::HBR3,
            max_lane_count: 2,
            tps3: true,
            tps4: true,
            enhanced_frame: true,
            aux_rd_interval: 0,
        };
        let source = SourceCaps {
            supports_hbr3: false,
            ..Default::default()
        };
        let fb = RateLaneFallback::new(&source, &sink);
        assert_eq!(fb.max_params(), params(rate::HBR2, 2));
    }
}
