//! Two-phase tunnel BW changes for one negotiation attempt
//!
//! A [`TunnelTransaction`] holds the per-tunnel BW requirement of the
//! streams being configured. It plugs into the link BW solver as a
//! [`LinkBwChecker`], then raises allocations ahead of the modeset with
//! [`TunnelTransaction::reserve`] and settles them with
//! [`TunnelTransaction::commit`]. Dropping a reserved transaction without
//! committing it gives the reservations back.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::manager::{round_up, tunnel_mut, tunnel_ref, DpTunnel, TunnelManager};
use crate::error::{DplinkError, Result};
use crate::link_bw::{LinkBwChecker, LinkCheck, StreamConfig, StreamId, StreamMask};

type TunnelKey = (usize, usize);

#[derive(Debug, Clone)]
struct TunnelEntry {
    handle: DpTunnel,
    /// Durable requirement when the tunnel joined the transaction
    old_required: u32,
    new_required: u32,
    /// Allocation held when `reserve` first touched the tunnel
    pre_reserve_bw: Option<u32>,
}

/// One allocation request issued at commit time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationChange {
    pub tunnel: String,
    pub from: u32,
    pub to: u32,
    pub ok: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub changes: Vec<AllocationChange>,
}

impl CommitReport {
    pub fn has_errors(&self) -> bool {
        self.changes.iter().any(|c| !c.ok)
    }
}

pub struct TunnelTransaction<'m> {
    mgr: &'m TunnelManager,
    tunnels: BTreeMap<TunnelKey, TunnelEntry>,
    streams: BTreeMap<StreamId, TunnelKey>,
    reserved: bool,
    committed: bool,
}

impl<'m> TunnelTransaction<'m> {
    pub fn new(mgr: &'m TunnelManager) -> Self {
        Self {
            mgr,
            tunnels: BTreeMap::new(),
            streams: BTreeMap::new(),
            reserved: false,
            committed: false,
        }
    }

    /// Add a tunnel, starting from its committed requirement
    pub fn attach_tunnel(&mut self, tunnel: &DpTunnel) -> Result<()> {
        let key = (tunnel.group, tunnel.idx);
        if let Some(entry) = self.tunnels.get(&key) {
            if entry.handle.generation == tunnel.generation {
                return Ok(());
            }
        }

        let required = self
            .mgr
            .with_tunnel(tunnel, |g, i| tunnel_ref(g, i).required_bw)?;
        self.tunnels.insert(
            key,
            TunnelEntry {
                handle: tunnel.clone(),
                old_required: required,
                new_required: required,
                pre_reserve_bw: None,
            },
        );
        Ok(())
    }

    /// Route `stream` through `tunnel` for this attempt
    pub fn attach(&mut self, stream: StreamId, tunnel: &DpTunnel) -> Result<()> {
        self.attach_tunnel(tunnel)?;
        self.streams.insert(stream, (tunnel.group, tunnel.idx));
        Ok(())
    }

    /// Take `stream` off its tunnel; the tunnel stays in the transaction
    pub fn detach(&mut self, stream: StreamId) {
        self.streams.remove(&stream);
    }

    pub fn tunnel_of(&self, stream: StreamId) -> Option<&DpTunnel> {
        self.streams
            .get(&stream)
            .and_then(|key| self.tunnels.get(key))
            .map(|e| &e.handle)
    }

    /// Requirement computed for `tunnel` by the last check
    pub fn required_bw(&self, tunnel: &DpTunnel) -> Option<u32> {
        self.tunnels
            .get(&(tunnel.group, tunnel.idx))
            .map(|e| e.new_required)
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    fn tunnel_streams(&self, key: TunnelKey) -> StreamMask {
        self.streams
            .iter()
            .filter(|(_, k)| **k == key)
            .map(|(id, _)| *id)
            .collect()
    }

    fn group_streams(&self, group: usize) -> StreamMask {
        self.streams
            .iter()
            .filter(|(_, (g, _))| *g == group)
            .map(|(id, _)| *id)
            .collect()
    }

    fn groups(&self) -> BTreeSet<usize> {
        self.tunnels.keys().map(|(g, _)| *g).collect()
    }

    fn check_group(&self, group: usize) -> Option<(u32, u32, u8)> {
        let inner = self.mgr.groups[group].inner.lock();
        let required: u32 = inner
            .bw_alloc_tunnels()
            .map(|(idx, t)| match self.tunnels.get(&(group, idx)) {
                Some(entry) => entry.new_required,
                None => t.required_bw,
            })
            .sum();
        if required > inner.available_bw {
            return Some((required, inner.available_bw, inner.drv_group_id));
        }
        None
    }

    /// Raise allocations that the new requirements need
    ///
    /// Each increase is capped by the group BW still free at that point.
    /// A failure gives back what this call reserved, newest first, and the
    /// attempt is over. Tunnels with a sticky BW allocation error refuse
    /// any reservation.
    pub fn reserve(&mut self) -> Result<()> {
        let mut current = Vec::with_capacity(self.tunnels.len());
        for (key, entry) in &self.tunnels {
            let (enabled, has_errors, allocated) = self.mgr.with_tunnel(&entry.handle, |g, i| {
                let t = tunnel_ref(g, i);
                (t.bw_alloc_enabled, t.bw_alloc_has_errors, t.allocated_bw)
            })?;
            if !enabled {
                continue;
            }
            if has_errors {
                return Err(DplinkError::ReservationFailed(format!(
                    "{}: BW allocation errors pending",
                    entry.handle.id()
                )));
            }
            current.push((*key, allocated));
        }
        for (key, allocated) in current {
            if let Some(entry) = self.tunnels.get_mut(&key) {
                entry.pre_reserve_bw.get_or_insert(allocated);
            }
        }

        let mut raised: Vec<(DpTunnel, u32)> = Vec::new();

        for group in self.groups() {
            let mut free = {
                let inner = self.mgr.groups[group].inner.lock();
                inner.available_bw.saturating_sub(inner.allocated_bw())
            };

            let entries: Vec<TunnelEntry> = self
                .tunnels
                .range((group, 0)..(group + 1, 0))
                .map(|(_, e)| e.clone())
                .collect();

            for entry in entries {
                let (enabled, allocated) = self.mgr.with_tunnel(&entry.handle, |g, i| {
                    let t = tunnel_ref(g, i);
                    (t.bw_alloc_enabled, t.allocated_bw)
                })?;
                if !enabled || entry.new_required <= allocated {
                    continue;
                }

                let reserved = entry.new_required.min(allocated + free);
                if reserved == allocated {
                    continue;
                }

                match self.mgr.allocate_bw(&entry.handle, reserved) {
                    Ok(()) => {
                        free -= reserved - allocated;
                        raised.push((entry.handle.clone(), allocated));
                    }
                    Err(e) => {
                        tracing::debug!(
                            "{} Reserving {} Mb/s failed: {}",
                            entry.handle,
                            reserved,
                            e
                        );
                        self.rollback(raised);
                        if e.is_transport() {
                            return Err(e);
                        }
                        return Err(DplinkError::ReservationFailed(format!(
                            "{}: {}",
                            entry.handle.id(),
                            e
                        )));
                    }
                }
            }
            self.mgr.log_group(group, "Reserved");
        }

        self.reserved = true;
        Ok(())
    }

    fn rollback(&self, raised: Vec<(DpTunnel, u32)>) {
        for (handle, bw) in raised.into_iter().rev() {
            if let Err(e) = self.mgr.allocate_bw(&handle, bw) {
                tracing::warn!("{} Restoring {} Mb/s failed: {}", handle, bw, e);
            }
        }
    }

    /// Request `target(entry)` on every BW allocation tunnel, decreases first
    ///
    /// Tunnels whose handle went stale come back as failed requests.
    fn apply(
        &self,
        target: impl Fn(&TunnelEntry) -> Option<u32>,
    ) -> Vec<(TunnelEntry, u32, u32, Result<()>)> {
        let mut gone = Vec::new();
        let mut decreases = Vec::new();
        let mut increases = Vec::new();
        for entry in self.tunnels.values() {
            let Some(bw) = target(entry) else {
                continue;
            };
            let (enabled, allocated) = match self.mgr.with_tunnel(&entry.handle, |g, i| {
                let t = tunnel_ref(g, i);
                (t.bw_alloc_enabled, t.allocated_bw)
            }) {
                Ok(state) => state,
                Err(e) => {
                    gone.push((entry.clone(), 0, bw, Err(e)));
                    continue;
                }
            };
            if !enabled {
                continue;
            }
            if bw < allocated {
                decreases.push((entry.clone(), allocated, bw));
            } else if bw > allocated {
                increases.push((entry.clone(), allocated, bw));
            }
        }

        let requested = decreases
            .into_iter()
            .chain(increases)
            .map(|(entry, from, to)| {
                let result = self.mgr.allocate_bw(&entry.handle, to);
                (entry, from, to, result)
            });
        gone.into_iter().chain(requested).collect()
    }

    /// Put every tunnel `reserve` touched back to the allocation it held
    /// before the reservation
    pub fn cancel_reservations(&mut self) -> Result<()> {
        let mut first_err = None;
        for (entry, _, to, result) in self.apply(|e| e.pre_reserve_bw) {
            if let Err(e) = result {
                tracing::warn!(
                    "{} Cancelling reservation to {} Mb/s failed: {}",
                    entry.handle,
                    to,
                    e
                );
                first_err.get_or_insert(e);
            }
        }
        self.reserved = false;
        for entry in self.tunnels.values_mut() {
            entry.pre_reserve_bw = None;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Settle allocations on the new requirements
    ///
    /// Runs to completion: a failed request marks its tunnel with a sticky
    /// BW allocation error and the remaining tunnels are still processed.
    pub fn commit(mut self) -> CommitReport {
        let mut report = CommitReport::default();
        let mut failed = BTreeSet::new();

        for (entry, from, to, result) in self.apply(|e| Some(e.new_required)) {
            let ok = match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!("{} Committing {} Mb/s failed: {}", entry.handle, to, e);
                    let marked = self.mgr.with_tunnel(&entry.handle, |g, i| {
                        tunnel_mut(g, i).bw_alloc_has_errors = true;
                    });
                    if let Err(e) = marked {
                        tracing::warn!("{} Cannot record BW allocation error: {}", entry.handle, e);
                    }
                    failed.insert((entry.handle.group, entry.handle.idx));
                    false
                }
            };
            report.changes.push(AllocationChange {
                tunnel: entry.handle.id(),
                from,
                to,
                ok,
            });
        }

        for (key, entry) in &self.tunnels {
            if failed.contains(key) {
                continue;
            }
            let updated = self.mgr.with_tunnel(&entry.handle, |g, i| {
                let t = tunnel_mut(g, i);
                if t.bw_alloc_enabled {
                    t.required_bw = entry.new_required;
                }
            });
            if let Err(e) = updated {
                tracing::warn!("{} Requirement not committed: {}", entry.handle, e);
                report.changes.push(AllocationChange {
                    tunnel: entry.handle.id(),
                    from: 0,
                    to: entry.new_required,
                    ok: false,
                });
            }
        }
        for group in self.groups() {
            self.mgr.log_group(group, "Committed");
        }

        self.committed = true;
        report
    }
}

impl LinkBwChecker for TunnelTransaction<'_> {
    fn check(&mut self, configs: &[StreamConfig]) -> Result<LinkCheck> {
        let keys: Vec<TunnelKey> = self.tunnels.keys().copied().collect();
        for key in keys {
            let streams = self.tunnel_streams(key);
            let Some(entry) = self.tunnels.get(&key) else {
                continue;
            };
            let (enabled, granularity, max_dprx_bw) =
                self.mgr.with_tunnel(&entry.handle, |g, i| {
                    let t = tunnel_ref(g, i);
                    (t.bw_alloc_enabled, t.bw_granularity, self.mgr.dprx_bw(t))
                })?;
            if !enabled {
                continue;
            }

            let sum: u32 = configs
                .iter()
                .filter(|c| streams.contains(c.id))
                .map(|c| c.required_bw)
                .sum();
            let required = round_up(sum, granularity);

            if required > max_dprx_bw {
                tracing::debug!(
                    "{} Required {} Mb/s exceeds DPRX {} Mb/s (streams {})",
                    entry.handle,
                    required,
                    max_dprx_bw,
                    streams
                );
                return Ok(LinkCheck::Oversubscribed(streams));
            }

            if let Some(entry) = self.tunnels.get_mut(&key) {
                entry.new_required = required;
            }
        }

        for group in self.groups() {
            if let Some((required, available, drv_group_id)) = self.check_group(group) {
                let streams = self.group_streams(group);
                tracing::debug!(
                    "{} Required {} Mb/s exceeds available {} Mb/s (streams {})",
                    TunnelManager::group_tag(drv_group_id),
                    required,
                    available,
                    streams
                );
                return Ok(LinkCheck::Oversubscribed(streams));
            }
        }

        Ok(LinkCheck::Fits)
    }
}

impl Drop for TunnelTransaction<'_> {
    fn drop(&mut self) {
        if self.reserved && !self.committed {
            if let Err(e) = self.cancel_reservations() {
                tracing::warn!("Dropping reserved tunnel transaction: {}", e);
            }
        }
    }
}
