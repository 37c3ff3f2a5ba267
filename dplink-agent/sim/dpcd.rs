use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use dplink_raw::dpcd::link::{self, addr as link_addr};
use dplink_raw::dpcd::lttpr::{self, addr as lttpr_addr};
use dplink_raw::dpcd::tunnel::{self, addr as tun_addr, TunnelingStatus};

use super::fabric::SimFabric;
use crate::common::aux::DpAux;
use crate::error::{DplinkError, Result};

/// Oldest accesses are dropped past this many
pub const ACCESS_LOG_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// One AUX transaction as seen by the simulated endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub kind: AccessKind,
    pub address: u32,
    pub data: Vec<u8>,
}

/// Training response of one hop (the sink or a repeater)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopBehavior {
    /// Status reads under TPS1 until clock recovery locks, `None` never locks
    pub cr_reads: Option<u32>,
    /// Status reads under TPS2/3/4 until channel EQ locks, `None` never locks
    pub eq_reads: Option<u32>,
    /// Drive levels requested in ADJUST_REQUEST
    pub request_voltage: u8,
    pub request_pre_emphasis: u8,
    /// Request one voltage step higher on every other status read
    pub alternate_voltage: bool,
    /// Report clock recovery lost during channel EQ
    pub drop_cr_in_eq: bool,
    /// Highest per-lane rate and lane count the hop can lock at
    pub max_link_rate: u32,
    pub max_lanes: u8,
}

impl Default for HopBehavior {
    fn default() -> Self {
        Self {
            cr_reads: Some(1),
            eq_reads: Some(1),
            request_voltage: 0,
            request_pre_emphasis: 0,
            alternate_voltage: false,
            drop_cr_in_eq: false,
            max_link_rate: u32::MAX,
            max_lanes: link::MAX_LANES as u8,
        }
    }
}

impl HopBehavior {
    pub fn trains_after(cr_reads: u32, eq_reads: u32) -> Self {
        Self {
            cr_reads: Some(cr_reads),
            eq_reads: Some(eq_reads),
            ..Default::default()
        }
    }

    pub fn never_locks() -> Self {
        Self {
            cr_reads: None,
            eq_reads: None,
            ..Default::default()
        }
    }

    /// Never locks clock recovery and keeps requesting the given levels
    pub fn stuck_requesting(voltage: u8, pre_emphasis: u8) -> Self {
        Self {
            cr_reads: None,
            request_voltage: voltage,
            request_pre_emphasis: pre_emphasis,
            ..Default::default()
        }
    }

    /// Never locks clock recovery and toggles its voltage request between
    /// `voltage` and `voltage + 1`, so the same-voltage limit never trips
    pub fn oscillating(voltage: u8) -> Self {
        Self {
            cr_reads: None,
            request_voltage: voltage,
            alternate_voltage: true,
            ..Default::default()
        }
    }

    pub fn limited_to(mut self, max_link_rate: u32, max_lanes: u8) -> Self {
        self.max_link_rate = max_link_rate;
        self.max_lanes = max_lanes;
        self
    }
}

/// DPRX capabilities and training behavior
#[derive(Debug, Clone)]
pub struct SinkModel {
    pub dpcd_rev: u8,
    pub max_link_rate: u32,
    pub max_lanes: u8,
    pub tps3: bool,
    pub tps4: bool,
    pub enhanced_frame: bool,
    pub aux_rd_interval: u8,
    pub behavior: HopBehavior,
}

impl Default for SinkModel {
    fn default() -> Self {
        Self {
            dpcd_rev: link::DPCD_REV_14,
            max_link_rate: link::rate::HBR3,
            max_lanes: 4,
            tps3: true,
            tps4: true,
            enhanced_frame: true,
            aux_rd_interval: 0,
            behavior: HopBehavior::default(),
        }
    }
}

/// LTTPR chain; `hops[0]` is repeater 1, closest to the source
#[derive(Debug, Clone)]
pub struct RepeaterModel {
    pub max_link_rate: u32,
    pub max_lanes: u8,
    pub hops: Vec<HopBehavior>,
}

/// USB4 DP-IN adapter register contents
#[derive(Debug, Clone)]
pub struct TunnelEndpoint {
    pub oui: [u8; 3],
    pub dev_id: [u8; tunnel::DEV_ID_SIZE],
    pub hw_rev: u8,
    pub sw_rev_major: u8,
    pub sw_rev_minor: u8,
    pub bw_alloc_supported: bool,
    pub adapter_id: u8,
    pub driver_id: u8,
    pub group_id: u8,
    pub granularity_code: u8,
    pub allocated_units: u8,
    /// Used when no fabric is attached
    pub estimated_units: u8,
    pub max_link_rate: u32,
    pub max_lane_count: u8,
}

impl Default for TunnelEndpoint {
    fn default() -> Self {
        Self {
            oui: [0x00, 0x1B, 0x21],
            dev_id: *b"DPIN\0\0",
            hw_rev: 0x21,
            sw_rev_major: 1,
            sw_rev_minor: 0,
            bw_alloc_supported: true,
            adapter_id: 8,
            driver_id: 1,
            group_id: 1,
            granularity_code: 1,
            allocated_units: 0,
            estimated_units: 0,
            max_link_rate: link::rate::HBR3,
            max_lane_count: 4,
        }
    }
}

/// What the endpoint does with a write to DP_REQUEST_BW
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestPolicy {
    /// Ask the fabric (or grant when none is attached) and complete at once
    #[default]
    Fabric,
    /// Complete with BW_REQUEST_FAILED
    Reject,
    /// Hold until [`SimDpcd::complete_pending`]
    Defer,
    /// Never complete
    Ignore,
}

#[derive(Debug, Default, Clone, Copy)]
struct HopState {
    pattern: u8,
    reads: u32,
}

#[derive(Default)]
struct SimState {
    regs: BTreeMap<u32, u8>,
    log: VecDeque<Access>,
    faults: HashSet<u32>,
    hops: Vec<HopBehavior>,
    hop_state: Vec<HopState>,
    policy: RequestPolicy,
    pending: Option<u32>,
    fabric: Option<Arc<SimFabric>>,
}

impl SimState {
    fn record(&mut self, access: Access) {
        if self.log.len() == ACCESS_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(access);
    }

    fn reg(&self, address: u32) -> u8 {
        self.regs.get(&address).copied().unwrap_or(0)
    }

    fn granularity(&self) -> u32 {
        tunnel::granularity_from_code(self.reg(tun_addr::DP_BW_GRANULARITY)).unwrap_or(25)
    }

    fn drv_group_id(&self) -> u8 {
        tunnel::drv_group_id(
            self.reg(tun_addr::DP_USB4_DRIVER_ID) & tunnel::USB4_DRIVER_ID_MASK,
            self.reg(tun_addr::DP_IN_ADAPTER_TUNNEL_INFORMATION) & tunnel::GROUP_ID_MASK,
        )
    }

    fn link_status(&mut self, hop: usize) -> [u8; link::LINK_STATUS_SIZE] {
        let behavior = self.hops[hop].clone();
        let state = &mut self.hop_state[hop];
        state.reads += 1;

        let lanes = (self.regs.get(&link_addr::LANE_COUNT_SET).copied().unwrap_or(0)
            & link::MAX_LANE_COUNT_MASK)
            .min(link::MAX_LANES as u8);
        let rate = link::bw_code_to_link_rate(
            self.regs.get(&link_addr::LINK_BW_SET).copied().unwrap_or(0),
        );
        let link_ok = rate <= behavior.max_link_rate && lanes <= behavior.max_lanes;
        let reached = |limit: Option<u32>| limit.is_some_and(|n| state.reads >= n);

        let (cr, eq) = match state.pattern {
            1 => (link_ok && reached(behavior.cr_reads), false),
            2 | 3 | 7 => (
                link_ok && !behavior.drop_cr_in_eq,
                link_ok && !behavior.drop_cr_in_eq && reached(behavior.eq_reads),
            ),
            _ => (false, false),
        };

        let mut lane_bits = 0u8;
        if cr {
            lane_bits |= link::LANE_CR_DONE;
        }
        if eq {
            lane_bits |= link::LANE_CHANNEL_EQ_DONE | link::LANE_SYMBOL_LOCKED;
        }
        let voltage = if behavior.alternate_voltage && state.reads % 2 == 0 {
            behavior.request_voltage + 1
        } else {
            behavior.request_voltage
        };
        let adjust = (voltage & 0x3) | ((behavior.request_pre_emphasis & 0x3) << 2);

        let mut status = [0u8; link::LINK_STATUS_SIZE];
        for lane in 0..lanes as usize {
            let shift = (lane & 1) * 4;
            status[lane / 2] |= lane_bits << shift;
            status[4 + lane / 2] |= adjust << shift;
        }
        if eq {
            status[2] |= link::INTERLANE_ALIGN_DONE;
        }
        status
    }

    fn complete_request(&mut self, name: &str, bw: u32) {
        let granted = match &self.fabric {
            Some(fabric) => fabric.request(name, self.drv_group_id(), bw),
            None => true,
        };

        let status = self.reg(tun_addr::DP_TUNNELING_STATUS);
        if granted {
            let units = bw / self.granularity();
            self.regs.insert(tun_addr::DP_ALLOCATED_BW, units as u8);
            self.regs.insert(
                tun_addr::DP_TUNNELING_STATUS,
                status | TunnelingStatus::BW_REQUEST_SUCCEEDED,
            );
        } else {
            self.regs.insert(
                tun_addr::DP_TUNNELING_STATUS,
                status | TunnelingStatus::BW_REQUEST_FAILED,
            );
        }
    }
}

fn status_hop(address: u32) -> Option<usize> {
    if address == link_addr::LANE0_1_STATUS {
        return Some(0);
    }
    (1..=lttpr::MAX_LTTPR_COUNT)
        .find(|&hop| lttpr::lane0_1_status(hop) == address)
        .map(|hop| hop as usize)
}

fn pattern_hop(address: u32) -> Option<usize> {
    if address == link_addr::TRAINING_PATTERN_SET {
        return Some(0);
    }
    (1..=lttpr::MAX_LTTPR_COUNT)
        .find(|&hop| lttpr::training_pattern_set(hop) == address)
        .map(|hop| hop as usize)
}

/// Simulated DPCD endpoint
///
/// Plain registers behave like memory. On top of that the endpoint models
/// link training for the sink and any repeaters, the write-1-to-clear
/// tunneling status register and BW requests against an optional
/// [`SimFabric`]. Recent accesses are logged.
pub struct SimDpcd {
    name: String,
    state: Mutex<SimState>,
}

impl SimDpcd {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_sink(self, sink: SinkModel) -> Self {
        {
            let mut state = self.state.lock();
            let regs = &mut state.regs;
            regs.insert(link_addr::DPCD_REV, sink.dpcd_rev);
            regs.insert(
                link_addr::MAX_LINK_RATE,
                link::link_rate_to_bw_code(sink.max_link_rate),
            );
            let mut lane_cap = sink.max_lanes & link::MAX_LANE_COUNT_MASK;
            if sink.tps3 {
                lane_cap |= link::TPS3_SUPPORTED;
            }
            if sink.enhanced_frame {
                lane_cap |= link::ENHANCED_FRAME_CAP;
            }
            regs.insert(link_addr::MAX_LANE_COUNT, lane_cap);
            regs.insert(
                link_addr::MAX_DOWNSPREAD,
                if sink.tps4 { link::TPS4_SUPPORTED } else { 0 },
            );
            regs.insert(link_addr::TRAINING_AUX_RD_INTERVAL, sink.aux_rd_interval);

            if state.hops.is_empty() {
                state.hops.push(sink.behavior);
                state.hop_state.push(HopState::default());
            } else {
                state.hops[0] = sink.behavior;
            }
        }
        self
    }

    pub fn with_repeaters(self, repeaters: RepeaterModel) -> Self {
        {
            let mut state = self.state.lock();
            if state.hops.is_empty() {
                state.hops.push(HopBehavior::default());
                state.hop_state.push(HopState::default());
            }
            let count = repeaters.hops.len() as u8;
            let regs = &mut state.regs;
            regs.insert(
                lttpr_addr::LT_TUNABLE_PHY_REPEATER_FIELD_DATA_STRUCTURE_REV,
                0x14,
            );
            regs.insert(
                lttpr_addr::MAX_LINK_RATE_PHY_REPEATER,
                link::link_rate_to_bw_code(repeaters.max_link_rate),
            );
            regs.insert(
                lttpr_addr::PHY_REPEATER_CNT,
                if count == 0 { 0 } else { 1 << (8 - count) },
            );
            regs.insert(
                lttpr_addr::PHY_REPEATER_MODE,
                lttpr::PHY_REPEATER_MODE_TRANSPARENT,
            );
            regs.insert(lttpr_addr::MAX_LANE_COUNT_PHY_REPEATER, repeaters.max_lanes);

            for hop in repeaters.hops {
                state.hops.push(hop);
                state.hop_state.push(HopState::default());
            }
        }
        self
    }

    pub fn with_tunnel(self, ep: TunnelEndpoint) -> Self {
        {
            let mut state = self.state.lock();
            let regs = &mut state.regs;
            for (i, b) in ep.oui.iter().enumerate() {
                regs.insert(tun_addr::DP_TUNNELING_OUI + i as u32, *b);
            }
            for (i, b) in ep.dev_id.iter().enumerate() {
                regs.insert(tun_addr::DP_TUNNELING_DEV_ID + i as u32, *b);
            }
            regs.insert(tun_addr::DP_TUNNELING_HW_REV, ep.hw_rev);
            regs.insert(tun_addr::DP_TUNNELING_SW_REV_MAJOR, ep.sw_rev_major);
            regs.insert(tun_addr::DP_TUNNELING_SW_REV_MINOR, ep.sw_rev_minor);

            let mut caps = tunnel::TUNNEL_SUPPORT;
            if ep.bw_alloc_supported {
                caps |= tunnel::TUNNEL_BW_ALLOC_MODE_SUPPORT;
            }
            regs.insert(tun_addr::DP_TUNNELING_CAPABILITIES, caps);
            regs.insert(
                tun_addr::DP_IN_ADAPTER_INFO,
                ep.adapter_id & tunnel::IN_ADAPTER_NUMBER_MASK,
            );
            regs.insert(tun_addr::DP_USB4_DRIVER_ID, ep.driver_id);
            regs.insert(
                tun_addr::DP_USB4_DRIVER_BW_CAPABILITY,
                if ep.bw_alloc_supported {
                    tunnel::USB4_DRIVER_BW_ALLOCATION
                } else {
                    0
                },
            );
            regs.insert(tun_addr::DP_IN_ADAPTER_TUNNEL_INFORMATION, ep.group_id);
            regs.insert(tun_addr::DP_BW_GRANULARITY, ep.granularity_code);
            regs.insert(tun_addr::DP_ESTIMATED_BW, ep.estimated_units);
            regs.insert(tun_addr::DP_ALLOCATED_BW, ep.allocated_units);
            regs.insert(
                tun_addr::DP_TUNNELING_MAX_LINK_RATE,
                link::link_rate_to_bw_code(ep.max_link_rate),
            );
            regs.insert(tun_addr::DP_TUNNELING_MAX_LANE_COUNT, ep.max_lane_count);
        }
        self
    }

    /// Route BW requests through `fabric`, carrying over the current allocation
    pub fn with_fabric(self, fabric: Arc<SimFabric>) -> Self {
        {
            let mut state = self.state.lock();
            let allocated = state.reg(tun_addr::DP_ALLOCATED_BW) as u32 * state.granularity();
            fabric.attach(&self.name, state.drv_group_id(), allocated);
            state.fabric = Some(fabric);
        }
        self
    }

    pub fn set_register(&self, address: u32, value: u8) {
        self.state.lock().regs.insert(address, value);
    }

    pub fn register(&self, address: u32) -> u8 {
        self.state.lock().reg(address)
    }

    pub fn set_hop_behavior(&self, hop: usize, behavior: HopBehavior) {
        let mut state = self.state.lock();
        if let Some(slot) = state.hops.get_mut(hop) {
            *slot = behavior;
        }
    }

    pub fn set_request_policy(&self, policy: RequestPolicy) {
        self.state.lock().policy = policy;
    }

    /// Complete a deferred BW request; returns false if none was pending
    pub fn complete_pending(&self) -> bool {
        let mut state = self.state.lock();
        match state.pending.take() {
            Some(bw) => {
                state.complete_request(&self.name, bw);
                true
            }
            None => false,
        }
    }

    /// Set bits in DP_TUNNELING_STATUS as the adapter would on a change
    pub fn raise_status(&self, bits: u8) {
        let mut state = self.state.lock();
        let status = state.reg(tun_addr::DP_TUNNELING_STATUS);
        state
            .regs
            .insert(tun_addr::DP_TUNNELING_STATUS, status | bits);
    }

    /// Fail every transaction touching `address`
    pub fn fail_at(&self, address: u32) {
        self.state.lock().faults.insert(address);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    pub fn accesses(&self) -> Vec<Access> {
        self.state.lock().log.iter().cloned().collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Payloads of all writes starting at `address`
    pub fn writes_to(&self, address: u32) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|a| a.kind == AccessKind::Write && a.address == address)
            .map(|a| a.data.clone())
            .collect()
    }

    /// Number of reads starting at `address`
    pub fn reads_of(&self, address: u32) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|a| a.kind == AccessKind::Read && a.address == address)
            .count()
    }

    fn check_fault(&self, state: &SimState, address: u32, len: usize) -> Result<()> {
        let end = address + len as u32;
        if let Some(fault) = state.faults.iter().find(|&&f| f >= address && f < end) {
            return Err(DplinkError::Transport {
                aux: self.name.clone(),
                reason: format!("simulated fault at DPCD 0x{fault:05X}"),
            });
        }
        Ok(())
    }
}

impl DpAux for SimDpcd {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        self.check_fault(&state, address, buf.len())?;

        for (i, b) in buf.iter_mut().enumerate() {
            *b = state.reg(address + i as u32);
        }

        if let Some(hop) = status_hop(address).filter(|&h| h < state.hops.len()) {
            let status = state.link_status(hop);
            let n = buf.len().min(status.len());
            buf[..n].copy_from_slice(&status[..n]);
        }

        let est = tun_addr::DP_ESTIMATED_BW;
        if est >= address && est < address + buf.len() as u32 {
            if let Some(fabric) = &state.fabric {
                if let Some(bw) = fabric.estimated(&self.name, state.drv_group_id()) {
                    buf[(est - address) as usize] = (bw / state.granularity()).min(255) as u8;
                }
            }
        }

        state.record(Access {
            kind: AccessKind::Read,
            address,
            data: buf.to_vec(),
        });
        Ok(())
    }

    fn write(&self, address: u32, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        self.check_fault(&state, address, data.len())?;

        state.record(Access {
            kind: AccessKind::Write,
            address,
            data: data.to_vec(),
        });

        let Some(&first) = data.first() else {
            return Ok(());
        };

        match address {
            tun_addr::DP_TUNNELING_STATUS => {
                let status = state.reg(address);
                state.regs.insert(address, status & !first);
                return Ok(());
            }
            tun_addr::DP_REQUEST_BW => {
                state.regs.insert(address, first);
                let bw = first as u32 * state.granularity();
                let policy = state.policy;
                match policy {
                    RequestPolicy::Fabric => state.complete_request(&self.name, bw),
                    RequestPolicy::Reject => {
                        let status = state.reg(tun_addr::DP_TUNNELING_STATUS);
                        state.regs.insert(
                            tun_addr::DP_TUNNELING_STATUS,
                            status | TunnelingStatus::BW_REQUEST_FAILED,
                        );
                    }
                    RequestPolicy::Defer => state.pending = Some(bw),
                    RequestPolicy::Ignore => {}
                }
                return Ok(());
            }
            tun_addr::DP_DPTX_BW_ALLOCATION_MODE_CONTROL => {
                if first & tunnel::DISPLAY_DRIVER_BW_ALLOCATION_MODE_ENABLE == 0 {
                    if let Some(fabric) = &state.fabric {
                        fabric.release(&self.name);
                    }
                    state.regs.insert(tun_addr::DP_ALLOCATED_BW, 0);
                }
            }
            _ => {}
        }

        for (i, b) in data.iter().enumerate() {
            state.regs.insert(address + i as u32, *b);
        }

        if let Some(hop) = pattern_hop(address).filter(|&h| h < state.hop_state.len()) {
            state.hop_state[hop] = HopState {
                pattern: first & link::TRAINING_PATTERN_MASK,
                reads: 0,
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_write_one_to_clear() {
        let sim = SimDpcd::new("AUX A").with_tunnel(TunnelEndpoint::default());
        sim.raise_status(TunnelingStatus::ESTIMATED_BW_CHANGED | TunnelingStatus::BW_REQUEST_SUCCEEDED);

        sim.write_byte(tun_addr::DP_TUNNELING_STATUS, TunnelingStatus::BW_REQUEST_SUCCEEDED)
            .unwrap();
        assert_eq!(
            sim.register(tun_addr::DP_TUNNELING_STATUS),
            TunnelingStatus::ESTIMATED_BW_CHANGED
        );
    }

    #[test]
    fn test_fault_injection_covers_ranges() {
        let sim = SimDpcd::new("AUX B");
        sim.fail_at(0x204);

        let mut buf = [0u8; 6];
        let err = sim.read(link_addr::LANE0_1_STATUS, &mut buf).unwrap_err();
        assert!(err.is_transport());
        assert!(sim.read_byte(0x201).is_ok());

        sim.clear_faults();
        assert!(sim.read(link_addr::LANE0_1_STATUS, &mut buf).is_ok());
    }

    #[test]
    fn test_sink_reports_cr_after_configured_reads() {
        let sim = SimDpcd::new("AUX C").with_sink(SinkModel {
            behavior: HopBehavior::trains_after(2, 1),
            ..Default::default()
        });
        sim.write(link_addr::LINK_BW_SET, &[link::bw_code::HBR2, 2])
            .unwrap();
        sim.write(link_addr::TRAINING_PATTERN_SET, &[0x21, 0, 0])
            .unwrap();

        let mut status = [0u8; 6];
        sim.read(link_addr::LANE0_1_STATUS, &mut status).unwrap();
        assert_eq!(status[0] & 0x11, 0);
        sim.read(link_addr::LANE0_1_STATUS, &mut status).unwrap();
        assert_eq!(status[0], 0x11);
        assert_eq!(status[1], 0);
    }

    #[test]
    fn test_repeater_count_register() {
        let sim = SimDpcd::new("AUX D").with_repeaters(RepeaterModel {
            max_link_rate: link::rate::HBR3,
            max_lanes: 4,
            hops: vec![HopBehavior::default(), HopBehavior::default()],
        });
        assert_eq!(sim.register(lttpr_addr::PHY_REPEATER_CNT), 0x40);
        assert_eq!(
            lttpr::phy_repeater_count(sim.register(lttpr_addr::PHY_REPEATER_CNT)),
            Some(2)
        );
    }

    #[test]
    fn test_deferred_request_completes_through_fabric() {
        let fabric = Arc::new(SimFabric::new());
        fabric.add_group(tunnel::drv_group_id(1, 1), 200);
        let sim = SimDpcd::new("AUX E")
            .with_tunnel(TunnelEndpoint::default())
            .with_fabric(Arc::clone(&fabric));
        sim.set_request_policy(RequestPolicy::Defer);

        sim.write_byte(tun_addr::DP_REQUEST_BW, 3).unwrap();
        assert_eq!(sim.register(tun_addr::DP_TUNNELING_STATUS), 0);
        assert!(sim.complete_pending());
        assert_eq!(
            sim.register(tun_addr::DP_TUNNELING_STATUS),
            TunnelingStatus::BW_REQUEST_SUCCEEDED
        );
        assert_eq!(fabric.allocation("AUX E"), 150);
        // Granularity 50, 200 - 0 others
        assert_eq!(sim.read_byte(tun_addr::DP_ESTIMATED_BW).unwrap(), 4);
    }

    #[test]
    fn test_access_log_keeps_most_recent() {
        let sim = SimDpcd::new("AUX F");
        for i in 0..ACCESS_LOG_CAPACITY + 3 {
            sim.write_byte(0x100, i as u8).unwrap();
        }

        let log = sim.accesses();
        assert_eq!(log.len(), ACCESS_LOG_CAPACITY);
        assert_eq!(log[0].data, vec![3]);
        assert_eq!(sim.writes_to(0x100).len(), ACCESS_LOG_CAPACITY);
    }
}
