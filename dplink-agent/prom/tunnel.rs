use prometheus::{GaugeVec, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::metrics::tunnel::TunnelMetric;
use crate::tunnel::TunnelManager;

pub struct TunnelMetricExporter {
    registry: Arc<Registry>,
    manager: Arc<TunnelManager>,
    gauges: HashMap<TunnelMetric, GaugeVec>,
}

impl TunnelMetricExporter {
    pub fn new(manager: Arc<TunnelManager>) -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let mut exporter = Self {
            registry: Arc::clone(&registry),
            manager,
            gauges: HashMap::new(),
        };

        exporter.register_metrics()?;

        Ok(exporter)
    }

    fn register_metrics(&mut self) -> Result<()> {
        for metric in TunnelMetric::all() {
            let opts = Opts::new(metric.name(), metric.help());
            let labels: &[&str] = if metric.is_group_metric() {
                &["group"]
            } else {
                &["tunnel", "aux"]
            };

            let gauge = GaugeVec::new(opts, labels)?;
            self.registry.register(Box::new(gauge.clone()))?;
            self.gauges.insert(metric, gauge);
        }

        Ok(())
    }

    fn set(&self, metric: TunnelMetric, labels: &[&str], value: f64) {
        if let Some(gauge) = self.gauges.get(&metric) {
            gauge.with_label_values(labels).set(value);
        }
    }

    /// Refresh all gauges from a manager snapshot
    pub async fn collect(&self) {
        let snapshot = self.manager.snapshot();

        // Tunnels come and go; drop series of destroyed ones
        for gauge in self.gauges.values() {
            gauge.reset();
        }

        for group in &snapshot.groups {
            let group_label = format!("{}:{}", group.drv_group_id >> 3, group.drv_group_id & 7);
            self.set(
                TunnelMetric::GroupAvailableBw,
                &[&group_label],
                group.available_bw as f64,
            );
            self.set(
                TunnelMetric::GroupAllocatedBw,
                &[&group_label],
                group.allocated_bw as f64,
            );

            for tunnel in &group.tunnels {
                let labels = [tunnel.id.as_str(), tunnel.aux.as_str()];
                self.set(TunnelMetric::AllocatedBw, &labels, tunnel.allocated_bw as f64);
                self.set(TunnelMetric::RequiredBw, &labels, tunnel.required_bw as f64);
                self.set(
                    TunnelMetric::BwAllocEnabled,
                    &labels,
                    if tunnel.bw_alloc_enabled { 1.0 } else { 0.0 },
                );
                self.set(
                    TunnelMetric::BwAllocErrors,
                    &labels,
                    if tunnel.bw_alloc_has_errors { 1.0 } else { 0.0 },
                );
            }
        }

        tracing::debug!(
            "Collected tunnel metrics for {} active groups",
            snapshot.active_group_count
        );
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use crate::sim::{SimDpcd, SimFabric, TunnelEndpoint};

    fn gauge_value(registry: &Registry, name: &str) -> Option<f64> {
        registry
            .gather()
            .iter()
            .find(|mf| mf.get_name() == name)
            .and_then(|mf| mf.get_metric().first().map(|m| m.get_gauge().get_value()))
    }

    #[tokio::test]
    async fn test_collect_tunnel_gauges() {
        let fabric = Arc::new(SimFabric::new());
        fabric.add_group((1 << 3) | 1, 800);
        let sim = Arc::new(
            SimDpcd::new("AUX A")
                .with_tunnel(TunnelEndpoint::default())
                .with_fabric(fabric),
        );
        let manager = Arc::new(TunnelManager::new(TunnelConfig::default()));
        let tunnel = manager.detect(sim).unwrap().unwrap();
        assert!(manager.enable_bw_alloc(&tunnel).unwrap());

        let exporter = TunnelMetricExporter::new(Arc::clone(&manager)).unwrap();
        exporter.collect().await;

        let registry = exporter.registry();
        assert_eq!(gauge_value(&registry, "dptun_allocated_bw_mbps"), Some(800.0));
        assert_eq!(gauge_value(&registry, "dptun_group_available_bw_mbps"), Some(800.0));
        assert_eq!(gauge_value(&registry, "dptun_bw_alloc_enabled"), Some(1.0));

        manager.destroy(&tunnel).unwrap();
        exporter.collect().await;
        assert_eq!(gauge_value(&registry, "dptun_allocated_bw_mbps"), None);
    }
}
