//! DP tunnel topology and BW allocation mode
//!
//! Tunnels live in a fixed pool of group slots. A group is claimed for a
//! driver/group id when its first tunnel is detected and released with its
//! last one. Each group sits behind its own lock; the topology lock is only
//! taken while claiming or releasing slots. No lock is held across an AUX
//! transaction.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use dplink_raw::dpcd::tunnel::{self as dpcd_tunnel, addr, TunnelingStatus};
use dplink_raw::register::Register;

use super::alloc::BwRequestQueue;
use super::info::TunnelInfo;
use crate::common::aux::{read_layout, write_layout, DpAux};
use crate::config::TunnelConfig;
use crate::error::{DplinkError, Result};

pub const MAX_DP_TUNNELS_PER_GROUP: usize = 3;

/// Handle to a detected tunnel
///
/// Handles stay valid until the tunnel is destroyed; the slot generation
/// catches use of a handle after that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpTunnel {
    pub(crate) group: usize,
    pub(crate) idx: usize,
    pub(crate) generation: u64,
    aux_name: String,
    drv_group_id: u8,
    adapter_id: u8,
}

impl DpTunnel {
    pub fn drv_group_id(&self) -> u8 {
        self.drv_group_id
    }

    pub fn adapter_id(&self) -> u8 {
        self.adapter_id
    }

    pub fn aux_name(&self) -> &str {
        &self.aux_name
    }

    /// `drv:group:adapter`
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.drv_group_id >> dpcd_tunnel::GROUP_ID_BITS,
            self.drv_group_id & dpcd_tunnel::GROUP_ID_MASK,
            self.adapter_id
        )
    }
}

impl fmt::Display for DpTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][DPTUN {}]", self.aux_name, self.id())
    }
}

struct GroupTag(u8);

impl fmt::Display for GroupTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[DPTUN {}:{}:*]",
            self.0 >> dpcd_tunnel::GROUP_ID_BITS,
            self.0 & dpcd_tunnel::GROUP_ID_MASK
        )
    }
}

pub(crate) struct Tunnel {
    pub(crate) aux: Arc<dyn DpAux>,
    pub(crate) generation: u64,
    pub(crate) adapter_id: u8,
    pub(crate) bw_granularity: u32,
    pub(crate) allocated_bw: u32,
    pub(crate) max_dprx_rate: u32,
    pub(crate) max_dprx_lane_count: u8,
    pub(crate) bw_alloc_supported: bool,
    pub(crate) bw_alloc_enabled: bool,
    pub(crate) bw_alloc_suspended: bool,
    pub(crate) bw_alloc_has_errors: bool,
    /// Committed requirement of the streams on this tunnel
    pub(crate) required_bw: u32,
}

#[derive(Default)]
pub(crate) struct GroupInner {
    /// 0 while the slot is free
    pub(crate) drv_group_id: u8,
    pub(crate) tunnels: [Option<Tunnel>; MAX_DP_TUNNELS_PER_GROUP],
    pub(crate) available_bw: u32,
}

impl GroupInner {
    pub(crate) fn tunnel_count(&self) -> usize {
        self.tunnels.iter().filter(|t| t.is_some()).count()
    }

    /// Sum of allocations of tunnels in BW allocation mode
    pub(crate) fn allocated_bw(&self) -> u32 {
        self.bw_alloc_tunnels().map(|(_, t)| t.allocated_bw).sum()
    }

    pub(crate) fn bw_alloc_tunnels(&self) -> impl Iterator<Item = (usize, &Tunnel)> {
        self.tunnels
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (i, t)))
            .filter(|(_, t)| t.bw_alloc_enabled)
    }

    /// Recompute the group budget from one tunnel's estimate
    fn update_available_bw(&mut self, idx: usize, tunnel_available_bw: u32) -> bool {
        let tunnel_allocated = self.tunnels[idx]
            .as_ref()
            .filter(|t| t.bw_alloc_enabled)
            .map_or(0, |t| t.allocated_bw);
        let available_bw = (self.allocated_bw() - tunnel_allocated) + tunnel_available_bw;
        if self.available_bw != available_bw {
            self.available_bw = available_bw;
            return true;
        }
        false
    }
}

pub(crate) struct TunnelGroup {
    pub(crate) inner: Mutex<GroupInner>,
}

struct Topology {
    active_group_count: usize,
    next_generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelSnapshot {
    pub id: String,
    pub aux: String,
    pub bw_granularity: u32,
    pub allocated_bw: u32,
    pub required_bw: u32,
    pub max_dprx_rate: u32,
    pub max_dprx_lane_count: u8,
    pub bw_alloc_supported: bool,
    pub bw_alloc_enabled: bool,
    pub bw_alloc_suspended: bool,
    pub bw_alloc_has_errors: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSnapshot {
    pub drv_group_id: u8,
    pub available_bw: u32,
    pub allocated_bw: u32,
    pub tunnels: Vec<TunnelSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerSnapshot {
    pub group_count: usize,
    pub active_group_count: usize,
    pub groups: Vec<GroupSnapshot>,
}

pub struct TunnelManager {
    pub(crate) config: TunnelConfig,
    pub(crate) groups: Vec<TunnelGroup>,
    topology: Mutex<Topology>,
    pub(crate) bw_req_queue: BwRequestQueue,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        let groups = (0..config.group_count)
            .map(|_| TunnelGroup {
                inner: Mutex::new(GroupInner::default()),
            })
            .collect();

        tracing::debug!("DP tunnel manager with {} group slots", config.group_count);

        Self {
            config,
            groups,
            topology: Mutex::new(Topology {
                active_group_count: 0,
                next_generation: 1,
            }),
            bw_req_queue: BwRequestQueue::new(),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn active_group_count(&self) -> usize {
        self.topology.lock().active_group_count
    }

    /// Run `f` on the tunnel behind `handle` with its group locked
    pub(crate) fn with_tunnel<R>(
        &self,
        handle: &DpTunnel,
        f: impl FnOnce(&mut GroupInner, usize) -> R,
    ) -> Result<R> {
        let group = self
            .groups
            .get(handle.group)
            .ok_or_else(|| DplinkError::StaleTunnel(handle.id()))?;
        let mut inner = group.inner.lock();
        match &inner.tunnels[handle.idx] {
            Some(t) if t.generation == handle.generation => Ok(f(&mut inner, handle.idx)),
            _ => Err(DplinkError::StaleTunnel(handle.id())),
        }
    }

    fn tunnel_aux(&self, handle: &DpTunnel) -> Result<Arc<dyn DpAux>> {
        self.with_tunnel(handle, |g, i| tunnel_ref(g, i).aux.clone())
    }

    /// Claim a tunnel slot, first-fit over the group slots
    fn alloc_tunnel(&self, info: &TunnelInfo, aux: Arc<dyn DpAux>) -> Option<DpTunnel> {
        let drv_group_id = info.drv_group_id();
        let mut topology = self.topology.lock();

        let mut free_slot = None;
        let mut existing = None;
        for (i, group) in self.groups.iter().enumerate() {
            let id = group.inner.lock().drv_group_id;
            if id == drv_group_id {
                existing = Some(i);
                break;
            }
            if free_slot.is_none() && id == 0 {
                free_slot = Some(i);
            }
        }

        let group_index = match existing {
            Some(i) => i,
            None => {
                let Some(i) = free_slot.filter(|_| topology.active_group_count < self.groups.len())
                else {
                    tracing::debug!("Can't allocate more tunnel groups");
                    return None;
                };
                i
            }
        };

        let mut inner = self.groups[group_index].inner.lock();
        let Some(idx) = inner.tunnels.iter().position(|t| t.is_none()) else {
            tracing::debug!("{} Can't allocate more tunnels", GroupTag(drv_group_id));
            return None;
        };

        if existing.is_none() {
            topology.active_group_count += 1;
            inner.drv_group_id = drv_group_id;
            inner.available_bw = 0;
        }

        let generation = topology.next_generation;
        topology.next_generation += 1;

        let allocated_bw = info.allocated_bw();
        let handle = DpTunnel {
            group: group_index,
            idx,
            generation,
            aux_name: aux.name().to_string(),
            drv_group_id,
            adapter_id: info.adapter_id(),
        };

        inner.tunnels[idx] = Some(Tunnel {
            aux,
            generation,
            adapter_id: info.adapter_id(),
            bw_granularity: info.bw_granularity().unwrap_or(0),
            allocated_bw,
            max_dprx_rate: info.max_dprx_rate(),
            max_dprx_lane_count: info.max_dprx_lane_count(),
            bw_alloc_supported: info.bw_alloc_supported(),
            bw_alloc_enabled: false,
            bw_alloc_suspended: false,
            bw_alloc_has_errors: false,
            required_bw: allocated_bw,
        });

        Some(handle)
    }

    /// Max DPRX payload BW in Mb/s, channel coding overhead removed
    pub(crate) fn dprx_bw(&self, tunnel: &Tunnel) -> u32 {
        self.config
            .encoding_for(tunnel.max_dprx_rate)
            .payload_bw(tunnel.max_dprx_rate, tunnel.max_dprx_lane_count)
    }

    fn max_tunnel_bw(&self, tunnel: &Tunnel, info: &TunnelInfo) -> u32 {
        let max_bw = self.dprx_bw(tunnel).min(info.estimated_bw());
        round_up(max_bw, tunnel.bw_granularity)
    }

    /// Detect a tunnel on `aux` and add it to the topology
    ///
    /// Returns `None` when the adapter has no usable BW allocation support
    /// or no group/tunnel slot is free.
    pub fn detect(&self, aux: Arc<dyn DpAux>) -> Result<Option<DpTunnel>> {
        let info = TunnelInfo::read(aux.as_ref())?;

        if !info.bw_alloc_supported() {
            tracing::debug!("[{}] No DP tunnel BW allocation support", aux.name());
            return Ok(None);
        }
        if let Some(reason) = info.validate() {
            tracing::debug!("[{}] Ignoring DP tunnel: {}", aux.name(), reason);
            return Ok(None);
        }

        let Some(handle) = self.alloc_tunnel(&info, aux) else {
            return Ok(None);
        };

        let (max_tunnel_bw, allocated, group_allocated, available) =
            self.with_tunnel(&handle, |g, i| {
                let t = tunnel_ref(g, i);
                (
                    self.max_tunnel_bw(t, &info),
                    t.allocated_bw,
                    g.allocated_bw(),
                    g.available_bw,
                )
            })?;

        tracing::debug!(
            "{}: {} Alloc tunnel:{}/{} Group:{}/{} Mb/s",
            handle,
            info.describe(),
            allocated,
            max_tunnel_bw,
            group_allocated,
            available
        );

        Ok(Some(handle))
    }

    /// Remove the tunnel from the topology; the handle becomes stale
    pub fn destroy(&self, handle: &DpTunnel) -> Result<()> {
        let mut topology = self.topology.lock();
        let freed_group = self.with_tunnel(handle, |g, i| {
            g.tunnels[i] = None;
            if g.tunnel_count() == 0 {
                g.drv_group_id = 0;
                g.available_bw = 0;
                true
            } else {
                false
            }
        })?;

        if freed_group {
            topology.active_group_count = topology.active_group_count.saturating_sub(1);
        }
        tracing::debug!("{} Destroyed", handle);
        Ok(())
    }

    fn set_bw_alloc_mode(&self, handle: &DpTunnel, aux: &dyn DpAux, enable: bool) -> Result<()> {
        let mask = dpcd_tunnel::DISPLAY_DRIVER_BW_ALLOCATION_MODE_ENABLE
            | dpcd_tunnel::UNMASK_BW_ALLOCATION_IRQ;
        let mut val = aux.read_byte(addr::DP_DPTX_BW_ALLOCATION_MODE_CONTROL)?;
        if enable {
            val |= mask;
        } else {
            val &= !mask;
        }
        aux.write_byte(addr::DP_DPTX_BW_ALLOCATION_MODE_CONTROL, val)?;

        self.with_tunnel(handle, |g, i| tunnel_mut(g, i).bw_alloc_enabled = enable)
    }

    /// Reason the adapter state no longer matches the tunnel, if any
    fn check_tunnel_info(&self, handle: &DpTunnel, info: &TunnelInfo) -> Result<Option<String>> {
        self.with_tunnel(handle, |g, i| {
            let t = tunnel_ref(g, i);
            if info.drv_group_id() != g.drv_group_id {
                return Some(format!(
                    "group id mismatch: {}/{}",
                    info.drv_group_id(),
                    g.drv_group_id
                ));
            }
            if info.bw_granularity() != Some(t.bw_granularity) {
                return Some(format!(
                    "BW granularity mismatch: {:?}/{}",
                    info.bw_granularity(),
                    t.bw_granularity
                ));
            }
            if info.max_dprx_lane_count().count_ones() != 1 {
                return Some(format!(
                    "invalid DPRX lane count: {}",
                    info.max_dprx_lane_count()
                ));
            }
            if info.max_dprx_rate() == 0 {
                return Some("DPRX rate is 0".to_string());
            }
            if info.allocated_bw() != t.allocated_bw {
                return Some(format!(
                    "allocated BW mismatch: {}/{}",
                    info.allocated_bw(),
                    t.allocated_bw
                ));
            }
            if info.estimated_bw() < t.allocated_bw {
                return Some(format!(
                    "estimated BW < allocated BW: {}/{}",
                    info.estimated_bw(),
                    t.allocated_bw
                ));
            }
            if t.bw_alloc_supported && !info.bw_alloc_supported() {
                return Some("BW alloc support withdrawn".to_string());
            }
            None
        })
    }

    fn read_and_check_tunnel_info(
        &self,
        handle: &DpTunnel,
        aux: &dyn DpAux,
    ) -> Result<std::result::Result<TunnelInfo, String>> {
        let info = TunnelInfo::read(aux)?;
        Ok(match self.check_tunnel_info(handle, &info)? {
            Some(reason) => {
                tracing::debug!("{} {}", handle, reason);
                Err(reason)
            }
            None => Ok(info),
        })
    }

    /// Apply DPRX caps and the estimated BW; true if anything changed
    fn update_tunnel_state(&self, handle: &DpTunnel, info: &TunnelInfo) -> Result<bool> {
        self.with_tunnel(handle, |g, i| {
            let mut changed = false;
            let t = tunnel_mut(g, i);
            if t.bw_alloc_supported != info.bw_alloc_supported() {
                t.bw_alloc_supported = info.bw_alloc_supported();
                changed = true;
            }
            if t.max_dprx_rate != info.max_dprx_rate() {
                t.max_dprx_rate = info.max_dprx_rate();
                changed = true;
            }
            if t.max_dprx_lane_count != info.max_dprx_lane_count() {
                t.max_dprx_lane_count = info.max_dprx_lane_count();
                changed = true;
            }
            changed | g.update_available_bw(i, info.estimated_bw())
        })
    }

    /// Enable BW allocation mode and allocate the tunnel's max BW
    ///
    /// Returns false, leaving the mode disabled, when the tunnel lacks
    /// support, has a sticky allocation error, reports inconsistent state
    /// or the initial allocation fails.
    pub fn enable_bw_alloc(&self, handle: &DpTunnel) -> Result<bool> {
        let (aux, supported, has_errors) = self.with_tunnel(handle, |g, i| {
            let t = tunnel_ref(g, i);
            (t.aux.clone(), t.bw_alloc_supported, t.bw_alloc_has_errors)
        })?;

        if !supported {
            return Ok(false);
        }
        if has_errors {
            tracing::debug!("{} BW allocation errors pending, not enabling", handle);
            return Ok(false);
        }

        self.set_bw_alloc_mode(handle, aux.as_ref(), true)?;

        let info = match self.read_and_check_tunnel_info(handle, aux.as_ref())? {
            Ok(info) => info,
            Err(_) => {
                self.set_bw_alloc_mode(handle, aux.as_ref(), false)?;
                return Ok(false);
            }
        };

        self.update_tunnel_state(handle, &info)?;

        let max_tunnel_bw = self.with_tunnel(handle, |g, i| self.max_tunnel_bw(tunnel_ref(g, i), &info))?;
        match self.allocate_bw(handle, max_tunnel_bw) {
            Ok(()) => {}
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => {
                tracing::debug!("{} {}", handle, e);
                self.set_bw_alloc_mode(handle, aux.as_ref(), false)?;
                return Ok(false);
            }
        }

        let (rate, lanes, allocated, group_allocated, available) =
            self.with_tunnel(handle, |g, i| {
                let t = tunnel_mut(g, i);
                t.required_bw = t.allocated_bw;
                let t = tunnel_ref(g, i);
                (
                    t.max_dprx_rate,
                    t.max_dprx_lane_count,
                    t.allocated_bw,
                    g.allocated_bw(),
                    g.available_bw,
                )
            })?;

        tracing::info!(
            "{} BW allocation mode enabled: DPRX:{}x{} Alloc tunnel:{}/{} Group:{}/{} Mb/s",
            handle,
            rate,
            lanes,
            allocated,
            max_tunnel_bw,
            group_allocated,
            available
        );

        Ok(true)
    }

    /// Leave BW allocation mode, releasing the tunnel's allocation
    pub fn disable_bw_alloc(&self, handle: &DpTunnel) -> Result<()> {
        let (aux, enabled) = self.with_tunnel(handle, |g, i| {
            let t = tunnel_ref(g, i);
            (t.aux.clone(), t.bw_alloc_enabled)
        })?;
        if !enabled {
            return Ok(());
        }

        if let Err(e) = self.set_bw_alloc_mode(handle, aux.as_ref(), false) {
            tracing::warn!("{} Failed to clear BW allocation mode: {}", handle, e);
        }

        self.with_tunnel(handle, |g, i| {
            g.update_available_bw(i, 0);
            let t = tunnel_mut(g, i);
            t.bw_alloc_enabled = false;
            t.allocated_bw = 0;
            t.required_bw = 0;
        })?;
        tracing::debug!("{} BW allocation mode disabled", handle);
        Ok(())
    }

    pub fn suspend(&self, handle: &DpTunnel) -> Result<()> {
        if !self.is_bw_alloc_enabled(handle)? {
            return Ok(());
        }
        self.disable_bw_alloc(handle)?;
        self.with_tunnel(handle, |g, i| tunnel_mut(g, i).bw_alloc_suspended = true)
    }

    /// Re-enable BW allocation mode after [`Self::suspend`]
    ///
    /// A disconnected sink leaves the mode disabled without flagging an
    /// error; the next detection takes it from there.
    pub fn resume(&self, handle: &DpTunnel, sink_connected: bool) -> Result<bool> {
        let (suspended, enabled) = self.with_tunnel(handle, |g, i| {
            let t = tunnel_ref(g, i);
            (t.bw_alloc_suspended, t.bw_alloc_enabled)
        })?;
        if !suspended {
            return Ok(enabled);
        }

        self.with_tunnel(handle, |g, i| tunnel_mut(g, i).bw_alloc_suspended = false)?;

        if !sink_connected {
            return Ok(false);
        }
        self.enable_bw_alloc(handle)
    }

    /// Resync with the adapter after a capability or estimate change
    ///
    /// Returns false when the adapter state is inconsistent with the tunnel.
    pub fn update_state(&self, handle: &DpTunnel) -> Result<bool> {
        let aux = self.tunnel_aux(handle)?;

        let status: Register<TunnelingStatus> =
            read_layout(aux.as_ref(), addr::DP_TUNNELING_STATUS)?;
        let changed = status.layout.changes();
        if !changed.has_changes() {
            return Ok(true);
        }
        write_layout(aux.as_ref(), &Register::new(status.address, changed))?;

        let info = match self.read_and_check_tunnel_info(handle, aux.as_ref())? {
            Ok(info) => info,
            Err(_) => return Ok(false),
        };

        if !self.update_tunnel_state(handle, &info)? {
            return Ok(true);
        }

        let (rate, lanes, supported, allocated, group_allocated, available) =
            self.with_tunnel(handle, |g, i| {
                let t = tunnel_ref(g, i);
                (
                    t.max_dprx_rate,
                    t.max_dprx_lane_count,
                    t.bw_alloc_supported,
                    t.allocated_bw,
                    g.allocated_bw(),
                    g.available_bw,
                )
            })?;
        tracing::debug!(
            "{} Status changed: DPRX:{}x{} BW-Sup:{} Alloc tunnel:{}/{} Group:{}/{} Mb/s",
            handle,
            rate,
            lanes,
            if supported { 'Y' } else { 'N' },
            allocated,
            info.estimated_bw(),
            group_allocated,
            available
        );

        Ok(true)
    }

    /// Service a tunneling interrupt on `aux`
    ///
    /// Wakes BW request waiters on a request result. Returns true when a
    /// capability or estimate changed, i.e. the tunnel needs a resync and
    /// the link a renegotiation.
    pub fn handle_irq(&self, aux: &dyn DpAux) -> Result<bool> {
        let status: Register<TunnelingStatus> = read_layout(aux, addr::DP_TUNNELING_STATUS)?;

        if status.layout.has_request_result() {
            self.bw_req_queue.wake_all();
        }

        Ok(status.layout.has_changes())
    }

    pub fn has_bw_alloc_errors(&self, handle: &DpTunnel) -> Result<bool> {
        self.with_tunnel(handle, |g, i| tunnel_ref(g, i).bw_alloc_has_errors)
    }

    pub fn is_bw_alloc_enabled(&self, handle: &DpTunnel) -> Result<bool> {
        self.with_tunnel(handle, |g, i| tunnel_ref(g, i).bw_alloc_enabled)
    }

    /// Max DPRX link rate, not limited by the tunnel BW
    pub fn max_dprx_rate(&self, handle: &DpTunnel) -> Result<u32> {
        self.with_tunnel(handle, |g, i| tunnel_ref(g, i).max_dprx_rate)
    }

    pub fn max_dprx_lane_count(&self, handle: &DpTunnel) -> Result<u8> {
        self.with_tunnel(handle, |g, i| tunnel_ref(g, i).max_dprx_lane_count)
    }

    /// Group-wide BW: allocated plus free for all tunnels in the group
    pub fn available_bw(&self, handle: &DpTunnel) -> Result<u32> {
        self.with_tunnel(handle, |g, _| g.available_bw)
    }

    pub fn allocated_bw(&self, handle: &DpTunnel) -> Result<u32> {
        self.with_tunnel(handle, |g, i| tunnel_ref(g, i).allocated_bw)
    }

    pub fn bw_granularity(&self, handle: &DpTunnel) -> Result<u32> {
        self.with_tunnel(handle, |g, i| tunnel_ref(g, i).bw_granularity)
    }

    /// Payload BW of the DPRX at its max rate and lane count
    pub fn max_dprx_bw(&self, handle: &DpTunnel) -> Result<u32> {
        self.with_tunnel(handle, |g, i| self.dprx_bw(tunnel_ref(g, i)))
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let groups = self
            .groups
            .iter()
            .filter_map(|group| {
                let g = group.inner.lock();
                if g.drv_group_id == 0 {
                    return None;
                }
                let tunnels = g
                    .tunnels
                    .iter()
                    .flatten()
                    .map(|t| TunnelSnapshot {
                        id: format!(
                            "{}:{}:{}",
                            g.drv_group_id >> dpcd_tunnel::GROUP_ID_BITS,
                            g.drv_group_id & dpcd_tunnel::GROUP_ID_MASK,
                            t.adapter_id
                        ),
                        aux: t.aux.name().to_string(),
                        bw_granularity: t.bw_granularity,
                        allocated_bw: t.allocated_bw,
                        required_bw: t.required_bw,
                        max_dprx_rate: t.max_dprx_rate,
                        max_dprx_lane_count: t.max_dprx_lane_count,
                        bw_alloc_supported: t.bw_alloc_supported,
                        bw_alloc_enabled: t.bw_alloc_enabled,
                        bw_alloc_suspended: t.bw_alloc_suspended,
                        bw_alloc_has_errors: t.bw_alloc_has_errors,
                    })
                    .collect();
                Some(GroupSnapshot {
                    drv_group_id: g.drv_group_id,
                    available_bw: g.available_bw,
                    allocated_bw: g.allocated_bw(),
                    tunnels,
                })
            })
            .collect();

        ManagerSnapshot {
            group_count: self.groups.len(),
            active_group_count: self.active_group_count(),
            groups,
        }
    }

    pub(crate) fn log_group(&self, group: usize, what: &str) {
        if let Some(g) = self.groups.get(group) {
            let g = g.inner.lock();
            tracing::debug!(
                "{} {}: allocated {}/{} Mb/s",
                GroupTag(g.drv_group_id),
                what,
                g.allocated_bw(),
                g.available_bw
            );
        }
    }

    pub(crate) fn group_tag(drv_group_id: u8) -> impl fmt::Display {
        GroupTag(drv_group_id)
    }
}

/// Tunnel at a slot already validated by [`TunnelManager::with_tunnel`]
pub(crate) fn tunnel_ref(g: &GroupInner, idx: usize) -> &Tunnel {
    match &g.tunnels[idx] {
        Some(t) => t,
        None => unreachable!("tunnel slot validated under the group lock"),
    }
}

pub(crate) fn tunnel_mut(g: &mut GroupInner, idx: usize) -> &mut Tunnel {
    match &mut g.tunnels[idx] {
        Some(t) => t,
        None => unreachable!("tunnel slot validated under the group lock"),
    }
}

pub(crate) fn round_up(bw: u32, granularity: u32) -> u32 {
    if granularity == 0 {
        return bw;
    }
    bw.div_ceil(granularity) * granularity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDpcd, SimFabric, TunnelEndpoint};

    const GROUP: u8 = (1 << 3) | 1;

    fn endpoint(adapter_id: u8, group_id: u8) -> TunnelEndpoint {
        TunnelEndpoint {
            adapter_id,
            group_id,
            ..Default::default()
        }
    }

    fn sim_with_fabric(name: &str, ep: TunnelEndpoint, fabric: &Arc<SimFabric>) -> Arc<SimDpcd> {
        Arc::new(
            SimDpcd::new(name)
                .with_tunnel(ep)
                .with_fabric(fabric.clone()),
        )
    }

    #[test]
    fn test_detect_tunnel() {
        let mgr = TunnelManager::new(TunnelConfig::default());
        let sim = Arc::new(SimDpcd::new("AUX A").with_tunnel(endpoint(8, 1)));

        let tunnel = mgr.detect(sim).unwrap().unwrap();
        assert_eq!(tunnel.id(), "1:1:8");
        assert_eq!(tunnel.to_string(), "[AUX A][DPTUN 1:1:8]");
        assert_eq!(mgr.active_group_count(), 1);
        assert_eq!(mgr.bw_granularity(&tunnel).unwrap(), 50);
        assert_eq!(mgr.max_dprx_rate(&tunnel).unwrap(), 8100);
        assert_eq!(mgr.max_dprx_lane_count(&tunnel).unwrap(), 4);
        assert!(!mgr.is_bw_alloc_enabled(&tunnel).unwrap());
    }

    #[test]
    fn test_detect_without_bw_alloc_support() {
        let mgr = TunnelManager::new(TunnelConfig::default());
        let sim = Arc::new(SimDpcd::new("AUX A").with_tunnel(TunnelEndpoint {
            bw_alloc_supported: false,
            ..Default::default()
        }));

        assert!(mgr.detect(sim).unwrap().is_none());
        assert_eq!(mgr.active_group_count(), 0);
    }

    #[test]
    fn test_group_slots_exhausted() {
        let mgr = TunnelManager::new(TunnelConfig {
            group_count: 1,
            ..Default::default()
        });
        let a = Arc::new(SimDpcd::new("AUX A").with_tunnel(endpoint(8, 1)));
        let b = Arc::new(SimDpcd::new("AUX B").with_tunnel(endpoint(9, 2)));

        let ta = mgr.detect(a).unwrap().unwrap();
        assert!(mgr.detect(b.clone()).unwrap().is_none());

        mgr.destroy(&ta).unwrap();
        assert_eq!(mgr.active_group_count(), 0);
        assert!(mgr.detect(b).unwrap().is_some());
    }

    #[test]
    fn test_group_holds_three_tunnels() {
        let mgr = TunnelManager::new(TunnelConfig::default());
        let mut tunnels = Vec::new();
        for adapter in 8..11 {
            let sim = Arc::new(
                SimDpcd::new(format!("AUX {adapter}")).with_tunnel(endpoint(adapter, 1)),
            );
            tunnels.push(mgr.detect(sim).unwrap().unwrap());
        }
        assert!(tunnels.iter().all(|t| t.group == tunnels[0].group));

        let fourth = Arc::new(SimDpcd::new("AUX 11").with_tunnel(endpoint(11, 1)));
        assert!(mgr.detect(fourth).unwrap().is_none());
        assert_eq!(mgr.active_group_count(), 1);
    }

    #[test]
    fn test_destroyed_handle_is_stale() {
        let mgr = TunnelManager::new(TunnelConfig::default());
        let sim = Arc::new(SimDpcd::new("AUX A").with_tunnel(endpoint(8, 1)));
        let old = mgr.detect(sim.clone()).unwrap().unwrap();
        mgr.destroy(&old).unwrap();

        // same slot, new generation
        let new = mgr.detect(sim).unwrap().unwrap();
        assert_eq!((new.group, new.idx), (old.group, old.idx));

        assert!(matches!(
            mgr.allocated_bw(&old),
            Err(DplinkError::StaleTunnel(_))
        ));
        assert!(matches!(mgr.destroy(&old), Err(DplinkError::StaleTunnel(_))));
        assert!(mgr.allocated_bw(&new).is_ok());
    }

    #[test]
    fn test_enable_allocates_max_tunnel_bw() {
        let fabric = Arc::new(SimFabric::new());
        fabric.add_group(GROUP, 1020);
        let sim = sim_with_fabric("AUX A", endpoint(8, 1), &fabric);
        let mgr = TunnelManager::new(TunnelConfig::default());
        let tunnel = mgr.detect(sim.clone()).unwrap().unwrap();

        assert!(mgr.enable_bw_alloc(&tunnel).unwrap());
        assert!(mgr.is_bw_alloc_enabled(&tunnel).unwrap());
        // estimate is reported in 50 Mb/s units: 1000
        assert_eq!(mgr.allocated_bw(&tunnel).unwrap(), 1000);
        assert_eq!(mgr.available_bw(&tunnel).unwrap(), 1000);
        assert_eq!(
            sim.register(addr::DP_DPTX_BW_ALLOCATION_MODE_CONTROL),
            dpcd_tunnel::DISPLAY_DRIVER_BW_ALLOCATION_MODE_ENABLE
                | dpcd_tunnel::UNMASK_BW_ALLOCATION_IRQ
        );
    }

    #[test]
    fn test_enable_rejects_inconsistent_adapter() {
        let mgr = TunnelManager::new(TunnelConfig::default());
        let sim = Arc::new(SimDpcd::new("AUX A").with_tunnel(endpoint(8, 1)));
        let tunnel = mgr.detect(sim.clone()).unwrap().unwrap();

        sim.set_register(addr::DP_BW_GRANULARITY, 2);
        assert!(!mgr.enable_bw_alloc(&tunnel).unwrap());
        assert!(!mgr.is_bw_alloc_enabled(&tunnel).unwrap());
        assert_eq!(sim.register(addr::DP_DPTX_BW_ALLOCATION_MODE_CONTROL), 0);
    }

    #[test]
    fn test_disable_releases_bw() {
        let fabric = Arc::new(SimFabric::new());
        fabric.add_group(GROUP, 1000);
        let sim = sim_with_fabric("AUX A", endpoint(8, 1), &fabric);
        let mgr = TunnelManager::new(TunnelConfig::default());
        let tunnel = mgr.detect(sim).unwrap().unwrap();
        assert!(mgr.enable_bw_alloc(&tunnel).unwrap());

        mgr.disable_bw_alloc(&tunnel).unwrap();
        assert!(!mgr.is_bw_alloc_enabled(&tunnel).unwrap());
        assert_eq!(mgr.allocated_bw(&tunnel).unwrap(), 0);
        assert_eq!(mgr.available_bw(&tunnel).unwrap(), 0);
        assert_eq!(fabric.allocation("AUX A"), 0);
    }

    #[test]
    fn test_suspend_resume() {
        let fabric = Arc::new(SimFabric::new());
        fabric.add_group(GROUP, 1000);
        let sim = sim_with_fabric("AUX A", endpoint(8, 1), &fabric);
        let mgr = TunnelManager::new(TunnelConfig::default());
        let tunnel = mgr.detect(sim).unwrap().unwrap();
        assert!(mgr.enable_bw_alloc(&tunnel).unwrap());

        mgr.suspend(&tunnel).unwrap();
        assert!(!mgr.is_bw_alloc_enabled(&tunnel).unwrap());
        assert_eq!(fabric.allocation("AUX A"), 0);

        assert!(mgr.resume(&tunnel, true).unwrap());
        assert_eq!(mgr.allocated_bw(&tunnel).unwrap(), 1000);
        assert!(!mgr.has_bw_alloc_errors(&tunnel).unwrap());
    }

    #[test]
    fn test_resume_without_sink() {
        let mgr = TunnelManager::new(TunnelConfig::default());
        let sim = Arc::new(SimDpcd::new("AUX A").with_tunnel(endpoint(8, 1)));
        let tunnel = mgr.detect(sim).unwrap().unwrap();
        assert!(mgr.enable_bw_alloc(&tunnel).unwrap());

        mgr.suspend(&tunnel).unwrap();
        assert!(!mgr.resume(&tunnel, false).unwrap());
        assert!(!mgr.has_bw_alloc_errors(&tunnel).unwrap());
        // no longer suspended, left disabled until redetected
        assert!(!mgr.resume(&tunnel, true).unwrap());
    }

    #[test]
    fn test_update_state_picks_up_new_estimate() {
        let fabric = Arc::new(SimFabric::new());
        fabric.add_group(GROUP, 1000);
        let sim = sim_with_fabric("AUX A", endpoint(8, 1), &fabric);
        let mgr = TunnelManager::new(TunnelConfig::default());
        let tunnel = mgr.detect(sim.clone()).unwrap().unwrap();
        assert!(mgr.enable_bw_alloc(&tunnel).unwrap());

        // no change pending
        assert!(mgr.update_state(&tunnel).unwrap());
        assert_eq!(mgr.available_bw(&tunnel).unwrap(), 1000);

        fabric.set_capacity(GROUP, 2000);
        sim.raise_status(TunnelingStatus::ESTIMATED_BW_CHANGED);
        assert!(mgr.handle_irq(sim.as_ref()).unwrap());

        assert!(mgr.update_state(&tunnel).unwrap());
        assert_eq!(mgr.available_bw(&tunnel).unwrap(), 2000);
        assert_eq!(sim.register(addr::DP_TUNNELING_STATUS), 0);
        assert!(!mgr.handle_irq(sim.as_ref()).unwrap());
    }

    #[test]
    fn test_update_state_detects_mismatch() {
        let mgr = TunnelManager::new(TunnelConfig::default());
        let sim = Arc::new(SimDpcd::new("AUX A").with_tunnel(endpoint(8, 1)));
        let tunnel = mgr.detect(sim.clone()).unwrap().unwrap();

        sim.set_register(addr::DP_IN_ADAPTER_TUNNEL_INFORMATION, 2);
        sim.raise_status(TunnelingStatus::BW_ALLOC_CAPABILITY_CHANGED);
        assert!(!mgr.update_state(&tunnel).unwrap());
    }

    #[test]
    fn test_snapshot() {
        let fabric = Arc::new(SimFabric::new());
        fabric.add_group(GROUP, 500);
        let sim = sim_with_fabric("AUX A", endpoint(8, 1), &fabric);
        let mgr = TunnelManager::new(TunnelConfig::default());
        let tunnel = mgr.detect(sim).unwrap().unwrap();
        assert!(mgr.enable_bw_alloc(&tunnel).unwrap());

        let snapshot = mgr.snapshot();
        assert_eq!(snapshot.group_count, 4);
        assert_eq!(snapshot.active_group_count, 1);
        assert_eq!(snapshot.groups.len(), 1);
        let group = &snapshot.groups[0];
        assert_eq!(group.drv_group_id, GROUP);
        assert_eq!(group.allocated_bw, 500);
        assert_eq!(group.tunnels[0].id, "1:1:8");
        assert_eq!(group.tunnels[0].required_bw, 500);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["groups"][0]["tunnels"][0]["aux"], "AUX A");
    }
}
