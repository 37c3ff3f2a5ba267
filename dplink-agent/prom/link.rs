use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DplinkError, Result};
use crate::metrics::link::LinkMetric;
use crate::orchestrator::NegotiationReport;

/// Negotiation and link training counters
pub struct LinkMetricExporter {
    registry: Arc<Registry>,
    counters: HashMap<LinkMetric, IntCounter>,
    link_counters: HashMap<LinkMetric, IntCounterVec>,
    solver_iterations: IntGauge,
}

impl LinkMetricExporter {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let solver_iterations = IntGauge::with_opts(Opts::new(
            LinkMetric::SolverIterations.name(),
            "Solver rounds taken by the last negotiation",
        ))?;

        let mut exporter = Self {
            registry: Arc::clone(&registry),
            counters: HashMap::new(),
            link_counters: HashMap::new(),
            solver_iterations,
        };

        exporter.register_metrics()?;

        Ok(exporter)
    }

    fn register_metrics(&mut self) -> Result<()> {
        self.registry
            .register(Box::new(self.solver_iterations.clone()))?;

        for metric in LinkMetric::all() {
            if metric == LinkMetric::SolverIterations {
                continue;
            }
            let opts = Opts::new(metric.name(), format!("DP link {}", metric.name()));

            if metric.is_per_link() {
                let counter = IntCounterVec::new(opts, &["aux"])?;
                self.registry.register(Box::new(counter.clone()))?;
                self.link_counters.insert(metric, counter);
            } else {
                let counter = IntCounter::with_opts(opts)?;
                self.registry.register(Box::new(counter.clone()))?;
                self.counters.insert(metric, counter);
            }
        }

        Ok(())
    }

    fn inc_by(&self, metric: LinkMetric, v: u64) {
        if let Some(counter) = self.counters.get(&metric) {
            counter.inc_by(v);
        }
    }

    fn inc_link_by(&self, metric: LinkMetric, aux: &str, v: u64) {
        if let Some(counter) = self.link_counters.get(&metric) {
            counter.with_label_values(&[aux]).inc_by(v);
        }
    }

    pub fn record(&self, report: &NegotiationReport) {
        self.inc_by(LinkMetric::Negotiations, 1);
        self.solver_iterations
            .set(report.assignment.iterations as i64);
        self.inc_by(
            LinkMetric::ReconfigurationRequests,
            report.reconfiguration_requests.len() as u64,
        );
        self.inc_by(
            LinkMetric::CommitErrors,
            report.commit.changes.iter().filter(|c| !c.ok).count() as u64,
        );

        for link in &report.links {
            let failures = link
                .attempts
                .saturating_sub(u32::from(link.outcome.is_trained()));
            self.inc_link_by(LinkMetric::TrainingAttempts, &link.aux, link.attempts as u64);
            self.inc_link_by(LinkMetric::TrainingFailures, &link.aux, failures as u64);
        }
    }

    pub fn record_failure(&self, err: &DplinkError) {
        tracing::debug!("Negotiation failed: {}", err);
        self.inc_by(LinkMetric::Negotiations, 1);
        self.inc_by(LinkMetric::NegotiationFailures, 1);
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::delay::NoDelay;
    use crate::orchestrator::{Negotiator, Scenario};

    fn counter_value(registry: &Registry, name: &str) -> Option<f64> {
        registry
            .gather()
            .iter()
            .find(|mf| mf.get_name() == name)
            .and_then(|mf| mf.get_metric().first().map(|m| m.get_counter().get_value()))
    }

    #[test]
    fn test_record_report() {
        let scenario = Scenario::from_json(
            r#"{
                "links": [{
                    "aux": "AUX A",
                    "sink": { "trains_up_to_rate": 2700 },
                    "streams": [{ "id": 0, "pixel_clock_khz": 148500, "native_bpp": 24 }]
                }]
            }"#,
        )
        .unwrap();
        let topology = scenario.build();
        let negotiator = Negotiator::new(scenario.config.clone(), Box::new(NoDelay));
        let report = negotiator.negotiate(&topology.links).unwrap();

        let exporter = LinkMetricExporter::new().unwrap();
        exporter.record(&report);
        exporter.record_failure(&DplinkError::Infeasible("test".to_string()));

        let registry = exporter.registry();
        assert_eq!(counter_value(&registry, "dplink_negotiations_total"), Some(2.0));
        assert_eq!(
            counter_value(&registry, "dplink_negotiation_failures_total"),
            Some(1.0)
        );
        assert_eq!(
            counter_value(&registry, "dplink_training_attempts_total"),
            Some(3.0)
        );
        assert_eq!(
            counter_value(&registry, "dplink_training_failures_total"),
            Some(2.0)
        );
    }
}
