use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Oldest request records are dropped past this many
pub const REQUEST_LOG_CAPACITY: usize = 1024;

/// One BW request seen by the fabric
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BwRequestRecord {
    pub tunnel: String,
    pub bw: u32,
    pub granted: bool,
}

#[derive(Default)]
struct FabricState {
    /// drv_group_id -> capacity in Mb/s
    capacity: HashMap<u8, u32>,
    /// tunnel name -> (drv_group_id, allocated Mb/s)
    allocations: HashMap<String, (u8, u32)>,
    log: VecDeque<BwRequestRecord>,
}

impl FabricState {
    fn allocated_by_others(&self, tunnel: &str, group: u8) -> u32 {
        self.allocations
            .iter()
            .filter(|(name, (g, _))| *g == group && name.as_str() != tunnel)
            .map(|(_, (_, bw))| *bw)
            .sum()
    }
}

/// USB4 host router model: per-group upstream capacity shared by DP tunnels
///
/// A request is granted when the tunnel's new allocation plus everything
/// else allocated in its group fits the group capacity. Groups without a
/// configured capacity are unbounded.
#[derive(Default)]
pub struct SimFabric {
    state: Mutex<FabricState>,
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, drv_group_id: u8, capacity: u32) {
        self.state.lock().capacity.insert(drv_group_id, capacity);
    }

    pub fn set_capacity(&self, drv_group_id: u8, capacity: u32) {
        self.add_group(drv_group_id, capacity);
    }

    /// Register a tunnel with an allocation it already holds
    pub fn attach(&self, tunnel: &str, drv_group_id: u8, bw: u32) {
        self.state
            .lock()
            .allocations
            .insert(tunnel.to_string(), (drv_group_id, bw));
    }

    pub fn request(&self, tunnel: &str, drv_group_id: u8, bw: u32) -> bool {
        let mut state = self.state.lock();
        let granted = match state.capacity.get(&drv_group_id) {
            Some(&capacity) => state.allocated_by_others(tunnel, drv_group_id) + bw <= capacity,
            None => true,
        };

        if granted {
            state
                .allocations
                .insert(tunnel.to_string(), (drv_group_id, bw));
        }
        if state.log.len() == REQUEST_LOG_CAPACITY {
            state.log.pop_front();
        }
        state.log.push_back(BwRequestRecord {
            tunnel: tunnel.to_string(),
            bw,
            granted,
        });

        tracing::debug!(
            "[fabric] {} requests {} Mb/s in group {}: {}",
            tunnel,
            bw,
            drv_group_id,
            if granted { "granted" } else { "rejected" }
        );

        granted
    }

    pub fn release(&self, tunnel: &str) {
        if let Some(entry) = self.state.lock().allocations.get_mut(tunnel) {
            entry.1 = 0;
        }
    }

    /// BW the tunnel could hold: its own allocation plus the group's free BW
    pub fn estimated(&self, tunnel: &str, drv_group_id: u8) -> Option<u32> {
        let state = self.state.lock();
        let capacity = *state.capacity.get(&drv_group_id)?;
        Some(capacity.saturating_sub(state.allocated_by_others(tunnel, drv_group_id)))
    }

    pub fn allocation(&self, tunnel: &str) -> u32 {
        self.state
            .lock()
            .allocations
            .get(tunnel)
            .map(|(_, bw)| *bw)
            .unwrap_or(0)
    }

    pub fn group_allocated(&self, drv_group_id: u8) -> u32 {
        self.state
            .lock()
            .allocations
            .values()
            .filter(|(g, _)| *g == drv_group_id)
            .map(|(_, bw)| *bw)
            .sum()
    }

    /// The most recent requests, oldest first
    pub fn requests(&self) -> Vec<BwRequestRecord> {
        self.state.lock().log.iter().cloned().collect()
    }

    pub fn clear_requests(&self) {
        self.state.lock().log.clear();
    }
}
