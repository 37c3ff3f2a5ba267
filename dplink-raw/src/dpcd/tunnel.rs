//! USB4 DP-IN adapter tunneling registers
//!
//! These live in the DPCD of the DP-IN adapter (0xE0000 - 0xE0031) and
//! carry tunnel identification, the bandwidth allocation (BWA) status and
//! the DPTX request register.

use crate::register::DpcdLayout;

/// Tunneling OUI, device id, hw/sw revisions (0xE0000 - 0xE000B)
pub const DEV_ID_BLOCK_SIZE: usize = 12;
/// Tunneling capabilities, adapter info, driver id (0xE000D - 0xE000F)
pub const DEV_INFO_BLOCK_SIZE: usize = 3;
/// Driver BW capability through tunneling status (0xE0020 - 0xE0025)
pub const DEV_STATUS_BLOCK_SIZE: usize = 6;
/// DPRX max link rate and lane count (0xE0028 - 0xE0029)
pub const DPRX_CAP_BLOCK_SIZE: usize = 2;
/// BWA mode control and request (0xE0030 - 0xE0031)
pub const CONTROL_BLOCK_SIZE: usize = 2;

pub const DEV_ID_SIZE: usize = 6;

/// Largest request in granularity units the request register can carry
pub const MAX_REQUEST_BW: u32 = 255;

pub mod addr {
    pub const DP_TUNNELING_OUI: u32 = 0xE0000;
    pub const DP_TUNNELING_DEV_ID: u32 = 0xE0003;
    pub const DP_TUNNELING_HW_REV: u32 = 0xE0009;
    pub const DP_TUNNELING_SW_REV_MAJOR: u32 = 0xE000A;
    pub const DP_TUNNELING_SW_REV_MINOR: u32 = 0xE000B;

    pub const DP_TUNNELING_CAPABILITIES: u32 = 0xE000D;
    pub const DP_IN_ADAPTER_INFO: u32 = 0xE000E;
    pub const DP_USB4_DRIVER_ID: u32 = 0xE000F;

    pub const DP_USB4_DRIVER_BW_CAPABILITY: u32 = 0xE0020;
    pub const DP_IN_ADAPTER_TUNNEL_INFORMATION: u32 = 0xE0021;
    pub const DP_BW_GRANULARITY: u32 = 0xE0022;
    pub const DP_ESTIMATED_BW: u32 = 0xE0023;
    pub const DP_ALLOCATED_BW: u32 = 0xE0024;
    pub const DP_TUNNELING_STATUS: u32 = 0xE0025;

    pub const DP_TUNNELING_MAX_LINK_RATE: u32 = 0xE0028;
    pub const DP_TUNNELING_MAX_LANE_COUNT: u32 = 0xE0029;

    pub const DP_DPTX_BW_ALLOCATION_MODE_CONTROL: u32 = 0xE0030;
    pub const DP_REQUEST_BW: u32 = 0xE0031;
}

pub const HW_REV_MAJOR_SHIFT: u8 = 4;
pub const HW_REV_MINOR_MASK: u8 = 0x0F;

pub const TUNNEL_BW_ALLOC_MODE_SUPPORT: u8 = 1 << 7;
pub const TUNNEL_SUPPORT: u8 = 1 << 0;
pub const IN_ADAPTER_NUMBER_MASK: u8 = 0x7F;
pub const USB4_DRIVER_ID_MASK: u8 = 0x0F;

pub const USB4_DRIVER_BW_ALLOCATION: u8 = 1 << 7;
pub const GROUP_ID_MASK: u8 = 0x07;
pub const GROUP_ID_BITS: u8 = 3;
pub const BW_GRANULARITY_MASK: u8 = 0x03;
pub const TUNNELING_MAX_LANE_COUNT_MASK: u8 = 0x1F;

pub const DISPLAY_DRIVER_BW_ALLOCATION_MODE_ENABLE: u8 = 1 << 7;
pub const UNMASK_BW_ALLOCATION_IRQ: u8 = 1 << 6;

/// Bandwidth granularity in Mb/s for a BW_GRANULARITY code
///
/// Codes 0, 1 and 2 map to 25, 50 and 100 Mb/s; code 3 is reserved.
pub fn granularity_from_code(code: u8) -> Option<u32> {
    let code = code & BW_GRANULARITY_MASK;
    if code > 2 {
        return None;
    }
    Some(25 << code)
}

/// Combined driver/group id, 0 when the adapter reports no group
pub fn drv_group_id(drv_id: u8, group_id: u8) -> u8 {
    if group_id == 0 {
        return 0;
    }
    ((drv_id & USB4_DRIVER_ID_MASK) << GROUP_ID_BITS) | (group_id & GROUP_ID_MASK)
}

/// DP_TUNNELING_STATUS layout (write 1 to clear)
///
/// | Bit | Field              |
/// |-----|--------------------|
/// | 0   | request failed     |
/// | 1   | request succeeded  |
/// | 2   | estimated changed  |
/// | 3   | capability changed |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TunnelingStatus {
    pub bw_request_failed: bool,
    pub bw_request_succeeded: bool,
    pub estimated_bw_changed: bool,
    pub bw_alloc_capability_changed: bool,
}

impl TunnelingStatus {
    pub const BW_REQUEST_FAILED: u8 = 1 << 0;
    pub const BW_REQUEST_SUCCEEDED: u8 = 1 << 1;
    pub const ESTIMATED_BW_CHANGED: u8 = 1 << 2;
    pub const BW_ALLOC_CAPABILITY_CHANGED: u8 = 1 << 3;

    pub fn has_request_result(&self) -> bool {
        self.bw_request_failed || self.bw_request_succeeded
    }

    pub fn has_changes(&self) -> bool {
        self.estimated_bw_changed || self.bw_alloc_capability_changed
    }

    /// Only the request result bits, e.g. to acknowledge them
    pub fn request_result(&self) -> Self {
        Self {
            bw_request_failed: self.bw_request_failed,
            bw_request_succeeded: self.bw_request_succeeded,
            ..Default::default()
        }
    }

    /// Only the change notification bits
    pub fn changes(&self) -> Self {
        Self {
            estimated_bw_changed: self.estimated_bw_changed,
            bw_alloc_capability_changed: self.bw_alloc_capability_changed,
            ..Default::default()
        }
    }
}

impl DpcdLayout for TunnelingStatus {
    fn to_dpcd(&self) -> u8 {
        let mut value = 0;
        if self.bw_request_failed {
            value |= Self::BW_REQUEST_FAILED;
        }
        if self.bw_request_succeeded {
            value |= Self::BW_REQUEST_SUCCEEDED;
        }
        if self.estimated_bw_changed {
            value |= Self::ESTIMATED_BW_CHANGED;
        }
        if self.bw_alloc_capability_changed {
            value |= Self::BW_ALLOC_CAPABILITY_CHANGED;
        }
        value
    }

    fn from_dpcd(value: u8) -> Self {
        Self {
            bw_request_failed: value & Self::BW_REQUEST_FAILED != 0,
            bw_request_succeeded: value & Self::BW_REQUEST_SUCCEEDED != 0,
            estimated_bw_changed: value & Self::ESTIMATED_BW_CHANGED != 0,
            bw_alloc_capability_changed: value & Self::BW_ALLOC_CAPABILITY_CHANGED != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granularity_codes() {
        assert_eq!(granularity_from_code(0), Some(25));
        assert_eq!(granularity_from_code(1), Some(50));
        assert_eq!(granularity_from_code(2), Some(100));
        assert_eq!(granularity_from_code(3), None);
    }

    #[test]
    fn test_drv_group_id() {
        assert_eq!(drv_group_id(2, 0), 0);
        assert_eq!(drv_group_id(2, 5), (2 << 3) | 5);
    }

    #[test]
    fn test_tunneling_status_bits() {
        let status = TunnelingStatus::from_dpcd(0x0A);
        assert!(status.bw_request_succeeded);
        assert!(status.bw_alloc_capability_changed);
        assert!(status.has_changes());
        assert!(status.has_request_result());
        assert_eq!(status.to_dpcd(), 0x0A);
        assert_eq!(status.request_result().to_dpcd(), TunnelingStatus::BW_REQUEST_SUCCEEDED);
        assert_eq!(
            status.changes().to_dpcd(),
            TunnelingStatus::BW_ALLOC_CAPABILITY_CHANGED
        );
    }
}
