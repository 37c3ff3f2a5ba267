use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{DplinkError, Result};

/// Channel coding efficiency as a payload/line ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEncoding {
    pub payload: u32,
    pub line: u32,
}

impl ChannelEncoding {
    pub const ANSI_8B10B: Self = Self {
        payload: 8,
        line: 10,
    };
    pub const ANSI_128B132B: Self = Self {
        payload: 128,
        line: 132,
    };

    /// Payload bandwidth in Mb/s of `lanes` lanes at `link_rate` Mb/s each
    pub fn payload_bw(&self, link_rate: u32, lanes: u8) -> u32 {
        (link_rate as u64 * lanes as u64 * self.payload as u64 / self.line.max(1) as u64) as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Size of the group slot pool
    pub group_count: usize,
    pub bw_request_timeout_ms: u64,
    pub bw_request_poll_ms: u64,
    pub legacy_encoding: ChannelEncoding,
    pub uhbr_encoding: ChannelEncoding,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            group_count: 4,
            bw_request_timeout_ms: 5000,
            bw_request_poll_ms: 50,
            legacy_encoding: ChannelEncoding::ANSI_8B10B,
            uhbr_encoding: ChannelEncoding::ANSI_128B132B,
        }
    }
}

impl TunnelConfig {
    pub fn bw_request_timeout(&self) -> Duration {
        Duration::from_millis(self.bw_request_timeout_ms)
    }

    pub fn bw_request_poll(&self) -> Duration {
        Duration::from_millis(self.bw_request_poll_ms)
    }

    /// Encoding used on a link running at `link_rate` Mb/s per lane
    pub fn encoding_for(&self, link_rate: u32) -> ChannelEncoding {
        if dplink_raw::dpcd::link::is_uhbr_rate(link_rate) {
            self.uhbr_encoding
        } else {
            self.legacy_encoding
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_count == 0 {
            return Err(DplinkError::ConfigError(
                "group_count must be at least 1".to_string(),
            ));
        }
        if self.bw_request_poll_ms == 0 || self.bw_request_poll_ms > self.bw_request_timeout_ms {
            return Err(DplinkError::ConfigError(format!(
                "bw_request_poll_ms must be in 1..={}",
                self.bw_request_timeout_ms
            )));
        }
        for enc in [self.legacy_encoding, self.uhbr_encoding] {
            if enc.line == 0 || enc.payload > enc.line {
                return Err(DplinkError::ConfigError(format!(
                    "invalid channel encoding {}/{}",
                    enc.payload, enc.line
                )));
            }
        }
        Ok(())
    }
}

/// Drive and pattern capabilities of the DP source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceCaps {
    pub max_voltage_swing: u8,
    pub max_pre_emphasis: u8,
    /// HBR2 capable, implies TPS3
    pub supports_hbr2: bool,
    /// HBR3 capable, implies TPS4
    pub supports_hbr3: bool,
}

impl Default for SourceCaps {
    fn default() -> Self {
        Self {
            max_voltage_swing: 3,
            max_pre_emphasis: 3,
            supports_hbr2: true,
            supports_hbr3: true,
        }
    }
}

impl SourceCaps {
    /// Highest per-lane rate the source drives, in Mb/s
    pub fn max_link_rate(&self) -> u32 {
        use dplink_raw::dpcd::link::rate;
        if self.supports_hbr3 {
            rate::HBR3
        } else if self.supports_hbr2 {
            rate::HBR2
        } else {
            rate::HBR
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DplinkConfig {
    pub source: SourceCaps,
    pub tunnel: TunnelConfig,
}

impl DplinkConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.tunnel.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;

        tracing::info!(
            "Loaded config from {}: {} tunnel group slots",
            path.display(),
            config.tunnel.group_count
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = DplinkConfig::from_json("{}").unwrap();
        assert_eq!(config.tunnel.group_count, 4);
        assert_eq!(config.tunnel.bw_request_timeout(), Duration::from_secs(5));
        assert_eq!(config.tunnel.bw_request_poll(), Duration::from_millis(50));
        assert_eq!(config.source.max_voltage_swing, 3);
    }

    #[test]
    fn test_partial_override() {
        let config =
            DplinkConfig::from_json(r#"{"tunnel": {"group_count": 2}, "source": {"supports_hbr3": false}}"#)
                .unwrap();
        assert_eq!(config.tunnel.group_count, 2);
        assert_eq!(config.tunnel.bw_request_timeout_ms, 5000);
        assert!(!config.source.supports_hbr3);
        assert!(config.source.supports_hbr2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(DplinkConfig::from_json(r#"{"tunnel": {"group_count": 0}}"#).is_err());
        assert!(DplinkConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_payload_bw() {
        let config = TunnelConfig::default();
        // HBR2 x4 8b/10b
        assert_eq!(config.encoding_for(5400).payload_bw(5400, 4), 17280);
        // UHBR10 x4 128b/132b
        assert_eq!(config.encoding_for(10000).payload_bw(10000, 4), 38787);
    }
}
