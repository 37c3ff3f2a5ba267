//! Simulated topologies for the `dplink run` demo and the tests

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dplink_raw::dpcd::{link, lttpr};
use dplink_raw::dpcd::tunnel::{self, TunnelingStatus};

use super::negotiator::DisplayLink;
use crate::config::DplinkConfig;
use crate::error::{DplinkError, Result};
use crate::link_bw::{validate_streams, Stream};
use crate::sim::{HopBehavior, RepeaterModel, SimDpcd, SimFabric, SinkModel, TunnelEndpoint};

#[derive(Debug, Clone, Deserialize)]
pub struct GroupSpec {
    pub driver_id: u8,
    pub group_id: u8,
    /// Mb/s shared by the group's tunnels
    pub capacity: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkSpec {
    pub dpcd_rev: u8,
    pub max_link_rate: u32,
    pub max_lanes: u8,
    pub tps3: bool,
    pub tps4: bool,
    /// Highest rate the sink actually locks at, if lower than advertised
    pub trains_up_to_rate: Option<u32>,
    pub trains_up_to_lanes: Option<u8>,
}

impl Default for SinkSpec {
    fn default() -> Self {
        Self {
            dpcd_rev: link::DPCD_REV_14,
            max_link_rate: link::rate::HBR3,
            max_lanes: 4,
            tps3: true,
            tps4: true,
            trains_up_to_rate: None,
            trains_up_to_lanes: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSpec {
    pub adapter_id: u8,
    #[serde(default = "default_id")]
    pub driver_id: u8,
    #[serde(default = "default_id")]
    pub group_id: u8,
    #[serde(default = "default_id")]
    pub granularity_code: u8,
}

fn default_id() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkSpec {
    pub aux: String,
    #[serde(default)]
    pub sink: SinkSpec,
    #[serde(default)]
    pub repeaters: u8,
    #[serde(default)]
    pub tunnel: Option<TunnelSpec>,
    pub streams: Vec<Stream>,
}

/// Group capacity change played back by the demo's notification pump
#[derive(Debug, Clone, Deserialize)]
pub struct CapacityChange {
    pub after_secs: u64,
    pub driver_id: u8,
    pub group_id: u8,
    pub capacity: u32,
}

impl CapacityChange {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.after_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub config: DplinkConfig,
    pub groups: Vec<GroupSpec>,
    pub links: Vec<LinkSpec>,
    pub capacity_changes: Vec<CapacityChange>,
}

/// Simulated endpoints built from a [`Scenario`]
pub struct SimTopology {
    pub fabric: Arc<SimFabric>,
    /// Parallel to `links`
    pub sims: Vec<Arc<SimDpcd>>,
    pub links: Vec<DisplayLink>,
    /// drv_group_id of each link's tunnel
    tunnel_groups: Vec<Option<u8>>,
}

impl SimTopology {
    /// Set a group's capacity and flag the estimate change on its tunnels
    pub fn apply(&self, change: &CapacityChange) {
        let drv_group_id = tunnel::drv_group_id(change.driver_id, change.group_id);
        self.fabric.set_capacity(drv_group_id, change.capacity);
        tracing::info!(
            "[fabric] group {}:{} capacity now {} Mb/s",
            change.driver_id,
            change.group_id,
            change.capacity
        );

        for (sim, group) in self.sims.iter().zip(&self.tunnel_groups) {
            if *group == Some(drv_group_id) {
                sim.raise_status(TunnelingStatus::ESTIMATED_BW_CHANGED);
            }
        }
    }
}

impl Scenario {
    pub fn from_json(s: &str) -> Result<Self> {
        let scenario: Self = serde_json::from_str(s)?;
        scenario.config.tunnel.validate()?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    fn validate(&self) -> Result<()> {
        let streams: Vec<Stream> = self
            .links
            .iter()
            .flat_map(|l| l.streams.iter().copied())
            .collect();
        validate_streams(&streams)?;

        let mut names = HashSet::new();
        for link in &self.links {
            if !names.insert(link.aux.as_str()) {
                return Err(DplinkError::ConfigError(format!(
                    "AUX {} used twice",
                    link.aux
                )));
            }
            if link.repeaters > lttpr::MAX_LTTPR_COUNT {
                return Err(DplinkError::ConfigError(format!(
                    "{}: at most {} repeaters",
                    link.aux,
                    lttpr::MAX_LTTPR_COUNT
                )));
            }
        }
        Ok(())
    }

    pub fn build(&self) -> SimTopology {
        let fabric = Arc::new(SimFabric::new());
        for group in &self.groups {
            fabric.add_group(
                tunnel::drv_group_id(group.driver_id, group.group_id),
                group.capacity,
            );
        }

        let mut sims = Vec::with_capacity(self.links.len());
        let mut links = Vec::with_capacity(self.links.len());
        let mut tunnel_groups = Vec::with_capacity(self.links.len());

        for spec in &self.links {
            let sink = &spec.sink;
            let mut behavior = HopBehavior::default();
            if sink.trains_up_to_rate.is_some() || sink.trains_up_to_lanes.is_some() {
                behavior = behavior.limited_to(
                    sink.trains_up_to_rate.unwrap_or(u32::MAX),
                    sink.trains_up_to_lanes.unwrap_or(sink.max_lanes),
                );
            }

            let mut sim = SimDpcd::new(spec.aux.clone()).with_sink(SinkModel {
                dpcd_rev: sink.dpcd_rev,
                max_link_rate: sink.max_link_rate,
                max_lanes: sink.max_lanes,
                tps3: sink.tps3,
                tps4: sink.tps4,
                behavior,
                ..Default::default()
            });

            if spec.repeaters > 0 {
                sim = sim.with_repeaters(RepeaterModel {
                    max_link_rate: sink.max_link_rate,
                    max_lanes: sink.max_lanes,
                    hops: vec![HopBehavior::default(); spec.repeaters as usize],
                });
            }

            let mut group = None;
            if let Some(t) = &spec.tunnel {
                sim = sim
                    .with_tunnel(TunnelEndpoint {
                        adapter_id: t.adapter_id,
                        driver_id: t.driver_id,
                        group_id: t.group_id,
                        granularity_code: t.granularity_code,
                        max_link_rate: sink.max_link_rate,
                        max_lane_count: sink.max_lanes,
                        ..Default::default()
                    })
                    .with_fabric(Arc::clone(&fabric));
                group = Some(tunnel::drv_group_id(t.driver_id, t.group_id));
            }

            let sim = Arc::new(sim);
            links.push(DisplayLink {
                aux: sim.clone(),
                streams: spec.streams.clone(),
                tunneled: spec.tunnel.is_some(),
            });
            sims.push(sim);
            tunnel_groups.push(group);
        }

        SimTopology {
            fabric,
            sims,
            links,
            tunnel_groups,
        }
    }
}
