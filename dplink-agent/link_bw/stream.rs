use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{DplinkError, Result};

/// Highest number of concurrently configured streams
pub const MAX_STREAMS: usize = 8;

/// Highest native bpp a stream can declare: 16 bpc RGB
pub const MAX_NATIVE_BPP: u32 = 48;

/// FEC payload efficiency, parts per million
const FEC_EFFICIENCY_PPM: u64 = 972_261;

/// Pipe index of one video output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u8);

impl StreamId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe {}", (b'A' + self.0) as char)
    }
}

/// Bitmask of [`StreamId`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct StreamMask(pub u8);

impl StreamMask {
    pub const EMPTY: Self = Self(0);

    pub fn single(id: StreamId) -> Self {
        Self(1 << id.0)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.0 & (1 << id.0) != 0
    }

    pub fn insert(&mut self, id: StreamId) {
        self.0 |= 1 << id.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Streams in `self` but not in `other`
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = StreamId> + '_ {
        (0..MAX_STREAMS as u8)
            .map(StreamId)
            .filter(|id| self.contains(*id))
    }
}

impl FromIterator<StreamId> for StreamMask {
    fn from_iter<I: IntoIterator<Item = StreamId>>(iter: I) -> Self {
        let mut mask = Self::EMPTY;
        for id in iter {
            mask.insert(id);
        }
        mask
    }
}

impl fmt::Display for StreamMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// A video output competing for link bandwidth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub pixel_clock_khz: u32,
    /// Highest bpp the mode and sink allow
    pub native_bpp: u32,
}

impl Stream {
    pub fn new(id: StreamId, pixel_clock_khz: u32, native_bpp: u32) -> Self {
        Self {
            id,
            pixel_clock_khz,
            native_bpp,
        }
    }

    /// Data rate in Mb/s at `bpp_x16` (1/16 bpp units), rounded up
    pub fn required_bandwidth(&self, bpp_x16: u32, fec: bool) -> u32 {
        let bw = (self.pixel_clock_khz as u64 * bpp_x16 as u64).div_ceil(16 * 1000);
        let bw = if fec {
            (bw * 1_000_000).div_ceil(FEC_EFFICIENCY_PPM)
        } else {
            bw
        };
        bw as u32
    }
}

/// Reject stream sets no [`StreamMask`] or bpp ceiling can represent
pub fn validate_streams(streams: &[Stream]) -> Result<()> {
    let mut seen = HashSet::new();
    for stream in streams {
        if stream.id.index() >= MAX_STREAMS {
            return Err(DplinkError::ConfigError(format!(
                "stream id {} out of range",
                stream.id.0
            )));
        }
        if !seen.insert(stream.id) {
            return Err(DplinkError::ConfigError(format!(
                "stream id {} used twice",
                stream.id.0
            )));
        }
        if stream.native_bpp > MAX_NATIVE_BPP {
            return Err(DplinkError::ConfigError(format!(
                "{}: native bpp {} above {}",
                stream.id, stream.native_bpp, MAX_NATIVE_BPP
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_ops() {
        let mask: StreamMask = [StreamId(0), StreamId(2)].into_iter().collect();
        assert_eq!(mask.0, 0b101);
        assert!(mask.contains(StreamId(2)));
        assert!(!mask.contains(StreamId(1)));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![StreamId(0), StreamId(2)]);
        assert_eq!(mask.difference(StreamMask::single(StreamId(0))).0, 0b100);
        assert_eq!(mask.count(), 2);
    }

    #[test]
    fn test_required_bandwidth() {
        // 1080p60 at 24 bpp
        let s = Stream::new(StreamId(0), 148_500, 24);
        assert_eq!(s.required_bandwidth(24 * 16, false), 3564);
        assert_eq!(s.required_bandwidth(24 * 16, true), 3666);
        assert_eq!(StreamId(1).to_string(), "pipe B");
    }

    #[test]
    fn test_validate_streams() {
        let ok = [Stream::new(StreamId(0), 148_500, 24), Stream::new(StreamId(7), 148_500, 48)];
        assert!(validate_streams(&ok).is_ok());

        let err = validate_streams(&[Stream::new(StreamId(8), 148_500, 24)]).unwrap_err();
        assert!(matches!(err, DplinkError::ConfigError(_)));

        let dup = [Stream::new(StreamId(1), 148_500, 24), Stream::new(StreamId(1), 74_250, 24)];
        assert!(validate_streams(&dup).is_err());

        let err = validate_streams(&[Stream::new(StreamId(0), 148_500, u32::MAX)]).unwrap_err();
        assert!(err.to_string().contains("native bpp"));
    }
}
