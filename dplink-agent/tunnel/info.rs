//! DP-IN adapter tunnel information readout

use dplink_raw::dpcd::link;
use dplink_raw::dpcd::tunnel::{self, addr, TunnelingStatus};
use dplink_raw::register::DpcdLayout;

use crate::common::aux::DpAux;
use crate::error::Result;

/// Snapshot of the adapter's tunneling register blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TunnelInfo {
    pub dev_ids: [u8; tunnel::DEV_ID_BLOCK_SIZE],
    pub dev_info: [u8; tunnel::DEV_INFO_BLOCK_SIZE],
    pub dev_status: [u8; tunnel::DEV_STATUS_BLOCK_SIZE],
    pub dprx_caps: [u8; tunnel::DPRX_CAP_BLOCK_SIZE],
    pub drv_status: [u8; tunnel::CONTROL_BLOCK_SIZE],
}

impl TunnelInfo {
    pub fn read(aux: &dyn DpAux) -> Result<Self> {
        let mut info = Self::default();
        aux.read(addr::DP_TUNNELING_OUI, &mut info.dev_ids)?;
        aux.read(addr::DP_TUNNELING_CAPABILITIES, &mut info.dev_info)?;
        aux.read(addr::DP_USB4_DRIVER_BW_CAPABILITY, &mut info.dev_status)?;
        aux.read(addr::DP_TUNNELING_MAX_LINK_RATE, &mut info.dprx_caps)?;
        aux.read(addr::DP_DPTX_BW_ALLOCATION_MODE_CONTROL, &mut info.drv_status)?;
        Ok(info)
    }

    fn dev_id_reg(&self, reg: u32) -> u8 {
        self.dev_ids[(reg - addr::DP_TUNNELING_OUI) as usize]
    }

    fn dev_info_reg(&self, reg: u32) -> u8 {
        self.dev_info[(reg - addr::DP_TUNNELING_CAPABILITIES) as usize]
    }

    fn dev_status_reg(&self, reg: u32) -> u8 {
        self.dev_status[(reg - addr::DP_USB4_DRIVER_BW_CAPABILITY) as usize]
    }

    fn dprx_cap_reg(&self, reg: u32) -> u8 {
        self.dprx_caps[(reg - addr::DP_TUNNELING_MAX_LINK_RATE) as usize]
    }

    pub fn oui(&self) -> [u8; 3] {
        [self.dev_ids[0], self.dev_ids[1], self.dev_ids[2]]
    }

    /// Device id with trailing NULs stripped
    pub fn dev_id(&self) -> String {
        let start = (addr::DP_TUNNELING_DEV_ID - addr::DP_TUNNELING_OUI) as usize;
        let raw = &self.dev_ids[start..start + tunnel::DEV_ID_SIZE];
        let len = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        String::from_utf8_lossy(&raw[..len]).into_owned()
    }

    pub fn hw_rev(&self) -> (u8, u8) {
        let rev = self.dev_id_reg(addr::DP_TUNNELING_HW_REV);
        (
            rev >> tunnel::HW_REV_MAJOR_SHIFT,
            rev & tunnel::HW_REV_MINOR_MASK,
        )
    }

    pub fn sw_rev(&self) -> (u8, u8) {
        (
            self.dev_id_reg(addr::DP_TUNNELING_SW_REV_MAJOR),
            self.dev_id_reg(addr::DP_TUNNELING_SW_REV_MINOR),
        )
    }

    pub fn drv_id(&self) -> u8 {
        self.dev_info_reg(addr::DP_USB4_DRIVER_ID) & tunnel::USB4_DRIVER_ID_MASK
    }

    pub fn group_id(&self) -> u8 {
        self.dev_status_reg(addr::DP_IN_ADAPTER_TUNNEL_INFORMATION) & tunnel::GROUP_ID_MASK
    }

    pub fn drv_group_id(&self) -> u8 {
        tunnel::drv_group_id(self.drv_id(), self.group_id())
    }

    pub fn adapter_id(&self) -> u8 {
        self.dev_info_reg(addr::DP_IN_ADAPTER_INFO) & tunnel::IN_ADAPTER_NUMBER_MASK
    }

    /// `None` for the reserved granularity code
    pub fn bw_granularity(&self) -> Option<u32> {
        tunnel::granularity_from_code(self.dev_status_reg(addr::DP_BW_GRANULARITY))
    }

    fn units_to_bw(&self, units: u8) -> u32 {
        units as u32 * self.bw_granularity().unwrap_or(0)
    }

    pub fn estimated_bw(&self) -> u32 {
        self.units_to_bw(self.dev_status_reg(addr::DP_ESTIMATED_BW))
    }

    pub fn allocated_bw(&self) -> u32 {
        self.units_to_bw(self.dev_status_reg(addr::DP_ALLOCATED_BW))
    }

    pub fn status(&self) -> TunnelingStatus {
        TunnelingStatus::from_dpcd(self.dev_status_reg(addr::DP_TUNNELING_STATUS))
    }

    pub fn max_dprx_rate(&self) -> u32 {
        link::bw_code_to_link_rate(self.dprx_cap_reg(addr::DP_TUNNELING_MAX_LINK_RATE))
    }

    pub fn max_dprx_lane_count(&self) -> u8 {
        self.dprx_cap_reg(addr::DP_TUNNELING_MAX_LANE_COUNT) & tunnel::TUNNELING_MAX_LANE_COUNT_MASK
    }

    pub fn bw_alloc_supported(&self) -> bool {
        let cap_mask = tunnel::TUNNEL_SUPPORT | tunnel::TUNNEL_BW_ALLOC_MODE_SUPPORT;
        if self.dev_info_reg(addr::DP_TUNNELING_CAPABILITIES) & cap_mask != cap_mask {
            return false;
        }
        self.dev_status_reg(addr::DP_USB4_DRIVER_BW_CAPABILITY) & tunnel::USB4_DRIVER_BW_ALLOCATION
            != 0
    }

    pub fn bw_alloc_enabled(&self) -> bool {
        self.drv_status[0] & tunnel::DISPLAY_DRIVER_BW_ALLOCATION_MODE_ENABLE != 0
    }

    /// Reason the adapter state is unusable for BW allocation, if any
    pub fn validate(&self) -> Option<String> {
        let oui = self.oui();
        if oui == [0x00; 3] || oui == [0xFF; 3] {
            return Some(format!("implausible OUI {oui:02x?}"));
        }
        if self.bw_granularity().is_none() {
            return Some("reserved BW granularity code".to_string());
        }
        if self.max_dprx_lane_count().count_ones() != 1 {
            return Some(format!(
                "invalid DPRX lane count: {}",
                self.max_dprx_lane_count()
            ));
        }
        if self.max_dprx_rate() == 0 {
            return Some("DPRX rate is 0".to_string());
        }
        if self.drv_group_id() == 0 {
            return Some("no tunnel group id".to_string());
        }
        None
    }

    /// One-line summary for the detection log
    pub fn describe(&self) -> String {
        let oui = self.oui();
        let (hw_major, hw_minor) = self.hw_rev();
        let (sw_major, sw_minor) = self.sw_rev();
        format!(
            "OUI:{:02x}{:02x}{:02x} DevID:{} Rev-HW:{}.{} SW:{}.{} DPRX:{}x{} Mb/s BW-Sup:{} En:{}",
            oui[0],
            oui[1],
            oui[2],
            self.dev_id(),
            hw_major,
            hw_minor,
            sw_major,
            sw_minor,
            self.max_dprx_rate(),
            self.max_dprx_lane_count(),
            if self.bw_alloc_supported() { 'Y' } else { 'N' },
            if self.bw_alloc_enabled() { 'Y' } else { 'N' },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDpcd, TunnelEndpoint};

    #[test]
    fn test_read_endpoint() {
        let sim = SimDpcd::new("AUX USBC1").with_tunnel(TunnelEndpoint {
            granularity_code: 2,
            allocated_units: 3,
            estimated_units: 10,
            ..Default::default()
        });
        let info = TunnelInfo::read(&sim).unwrap();

        assert_eq!(info.oui(), [0x00, 0x1B, 0x21]);
        assert_eq!(info.dev_id(), "DPIN");
        assert_eq!(info.hw_rev(), (2, 1));
        assert_eq!(info.adapter_id(), 8);
        assert_eq!(info.drv_group_id(), (1 << 3) | 1);
        assert_eq!(info.bw_granularity(), Some(100));
        assert_eq!(info.allocated_bw(), 300);
        assert_eq!(info.estimated_bw(), 1000);
        assert_eq!(info.max_dprx_rate(), link::rate::HBR3);
        assert_eq!(info.max_dprx_lane_count(), 4);
        assert!(info.bw_alloc_supported());
        assert!(!info.bw_alloc_enabled());
        assert_eq!(info.validate(), None);
        assert!(info.describe().contains("DevID:DPIN"));
    }

    #[test]
    fn test_validation_failures() {
        let mut info = TunnelInfo::read(
            &SimDpcd::new("AUX A").with_tunnel(TunnelEndpoint {
                max_lane_count: 3,
                ..Default::default()
            }),
        )
        .unwrap();
        assert!(info.validate().unwrap().contains("lane count"));

        info.dprx_caps = [0, 4];
        assert_eq!(info.validate().unwrap(), "DPRX rate is 0");

        info.dprx_caps = [link::bw_code::HBR2, 4];
        info.dev_status[2] = 3;
        assert!(info.validate().unwrap().contains("granularity"));

        info.dev_status[2] = 0;
        info.dev_status[1] = 0;
        assert!(info.validate().unwrap().contains("group"));
    }

    #[test]
    fn test_bw_alloc_needs_driver_capability() {
        let sim = SimDpcd::new("AUX B").with_tunnel(TunnelEndpoint::default());
        sim.set_register(addr::DP_USB4_DRIVER_BW_CAPABILITY, 0);
        let info = TunnelInfo::read(&sim).unwrap();
        assert!(!info.bw_alloc_supported());
    }
}
