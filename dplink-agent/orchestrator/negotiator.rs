//! End-to-end link negotiation
//!
//! One [`Negotiator::negotiate`] call runs a full configuration attempt:
//! tunnel detection, the bpp solver against every link and tunnel
//! constraint, the tunnel BW reserve/commit and finally link training
//! with rate/lane fallback.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use dplink_raw::dpcd::link::addr as link_addr;

use crate::common::aux::DpAux;
use crate::common::delay::Delay;
use crate::config::DplinkConfig;
use crate::error::{DplinkError, Result};
use crate::link_bw::{
    solve_link_limits, validate_streams, Assignment, CheckerChain, LinkCapacityChecker,
    PipeBppConfigurator, Stream, StreamId, StreamMask,
};
use crate::training::{
    LinkParams, LinkTrainer, RateLaneFallback, ReconfigurationLog, ReconfigurationRequest,
    SinkCaps, TrainingOutcome,
};
use crate::tunnel::{CommitReport, DpTunnel, ManagerSnapshot, TunnelManager, TunnelTransaction};

/// One DP link and the streams it carries
#[derive(Clone)]
pub struct DisplayLink {
    pub aux: Arc<dyn DpAux>,
    pub streams: Vec<Stream>,
    /// The link goes through a USB4 DP tunnel
    pub tunneled: bool,
}

impl DisplayLink {
    pub fn name(&self) -> &str {
        self.aux.name()
    }

    pub fn stream_mask(&self) -> StreamMask {
        self.streams.iter().map(|s| s.id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub aux: String,
    pub streams: Vec<StreamId>,
    pub tunnel: Option<String>,
    pub attempts: u32,
    pub outcome: TrainingOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiationReport {
    pub assignment: Assignment,
    pub commit: CommitReport,
    pub links: Vec<LinkReport>,
    pub reconfiguration_requests: Vec<StreamId>,
    pub tunnels: ManagerSnapshot,
}

impl NegotiationReport {
    pub fn all_trained(&self) -> bool {
        self.links.iter().all(|l| l.outcome.is_trained())
    }
}

/// Configuration attempts per call when training lowers a link below what
/// its streams were solved for
const MAX_NEGOTIATION_ROUNDS: u32 = 4;

struct KnownTunnel {
    handle: DpTunnel,
    aux: Arc<dyn DpAux>,
}

pub struct Negotiator {
    config: DplinkConfig,
    manager: Arc<TunnelManager>,
    delay: Box<dyn Delay>,
    /// Detected tunnels by AUX name
    tunnels: Mutex<HashMap<String, KnownTunnel>>,
    /// Parameters a link last trained at after falling back, by AUX name
    link_ceilings: Mutex<HashMap<String, LinkParams>>,
}

impl Negotiator {
    pub fn new(config: DplinkConfig, delay: Box<dyn Delay>) -> Self {
        let manager = Arc::new(TunnelManager::new(config.tunnel.clone()));
        Self {
            config,
            manager,
            delay,
            tunnels: Mutex::new(HashMap::new()),
            link_ceilings: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> Arc<TunnelManager> {
        Arc::clone(&self.manager)
    }

    pub fn tunnel(&self, aux_name: &str) -> Option<DpTunnel> {
        self.tunnels.lock().get(aux_name).map(|t| t.handle.clone())
    }

    fn forget(&self, aux_name: &str) {
        let known = self.tunnels.lock().remove(aux_name);
        if let Some(known) = known {
            if let Err(e) = self.manager.destroy(&known.handle) {
                tracing::debug!("{} Destroy on forget: {}", known.handle, e);
            }
        }
    }

    /// Tunnel behind `aux` with BW allocation mode on, detecting it if needed
    ///
    /// A tunnel with a sticky BW allocation error is destroyed and
    /// detected again.
    fn tunnel_for(&self, aux: &Arc<dyn DpAux>) -> Result<Option<DpTunnel>> {
        let known = self.tunnel(aux.name());
        if let Some(handle) = known {
            match self.manager.has_bw_alloc_errors(&handle) {
                Ok(false) => {
                    if !self.manager.is_bw_alloc_enabled(&handle)? {
                        self.manager.enable_bw_alloc(&handle)?;
                    }
                    return Ok(Some(handle));
                }
                Ok(true) => {
                    tracing::warn!("{} BW allocation errors, redetecting", handle);
                    self.forget(aux.name());
                }
                Err(DplinkError::StaleTunnel(_)) => {
                    self.tunnels.lock().remove(aux.name());
                }
                Err(e) => return Err(e),
            }
        }

        let Some(handle) = self.manager.detect(Arc::clone(aux))? else {
            return Ok(None);
        };
        if !self.manager.enable_bw_alloc(&handle)? {
            tracing::warn!("{} BW allocation mode not enabled", handle);
        }
        self.tunnels.lock().insert(
            aux.name().to_string(),
            KnownTunnel {
                handle: handle.clone(),
                aux: Arc::clone(aux),
            },
        );
        Ok(Some(handle))
    }

    /// Highest link parameters to solve and train `link` with
    fn link_params(&self, link: &DisplayLink, sink: &SinkCaps) -> LinkParams {
        let max = RateLaneFallback::new(&self.config.source, sink).max_params();
        match self.link_ceilings.lock().get(link.name()) {
            Some(ceiling) if self.payload_bw(ceiling) < self.payload_bw(&max) => *ceiling,
            _ => max,
        }
    }

    fn payload_bw(&self, params: &LinkParams) -> u32 {
        self.config
            .tunnel
            .encoding_for(params.link_rate)
            .payload_bw(params.link_rate, params.lane_count)
    }

    /// Configure every stream on `links` and train the links
    ///
    /// An infeasible stream set or a failed reservation fails the attempt
    /// with nothing committed. Training failures are reported per link.
    /// A link that trains below the BW its streams were given is solved
    /// again against what it trained at. When that no longer fits, the
    /// streams get a full reconfiguration request instead.
    pub fn negotiate(&self, links: &[DisplayLink]) -> Result<NegotiationReport> {
        let mut report = self.negotiate_once(links)?;
        let mut round = 1;

        while !report.reconfiguration_requests.is_empty() && round < MAX_NEGOTIATION_ROUNDS {
            if !report.all_trained() {
                break;
            }
            round += 1;
            tracing::info!(
                "Trained link BW below the assignment, negotiating again (round {})",
                round
            );
            match self.negotiate_once(links) {
                Ok(next) => report = next,
                Err(DplinkError::Infeasible(reason)) => {
                    tracing::warn!("Streams do not fit the trained links: {}", reason);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    fn negotiate_once(&self, links: &[DisplayLink]) -> Result<NegotiationReport> {
        let streams: Vec<Stream> = links.iter().flat_map(|l| l.streams.iter().copied()).collect();
        validate_streams(&streams)?;

        let mut sinks = Vec::with_capacity(links.len());
        let mut tunnels = Vec::with_capacity(links.len());
        for link in links {
            sinks.push(SinkCaps::read(link.aux.as_ref())?);
            tunnels.push(if link.tunneled {
                self.tunnel_for(&link.aux)?
            } else {
                None
            });
        }

        let params: Vec<LinkParams> = links
            .iter()
            .zip(&sinks)
            .map(|(link, sink)| self.link_params(link, sink))
            .collect();
        let mut link_checkers: Vec<LinkCapacityChecker> = links
            .iter()
            .zip(&params)
            .map(|(link, p)| {
                LinkCapacityChecker::new(link.name(), self.payload_bw(p), link.stream_mask())
            })
            .collect();

        let mut txn = TunnelTransaction::new(&self.manager);
        for (link, tunnel) in links.iter().zip(&tunnels) {
            if let Some(tunnel) = tunnel {
                for stream in &link.streams {
                    txn.attach(stream.id, tunnel)?;
                }
            }
        }

        let assignment = {
            let mut chain = CheckerChain::new();
            for checker in link_checkers.iter_mut() {
                chain.push(checker);
            }
            chain.push(&mut txn);
            solve_link_limits(&streams, &PipeBppConfigurator, &mut chain)?
        };
        for config in &assignment.configs {
            tracing::debug!(
                "{}: {} bpp{}, {} Mb/s",
                config.id,
                config.bpp,
                if config.fec { " FEC" } else { "" },
                config.required_bw
            );
        }

        txn.reserve()?;
        let commit = txn.commit();

        let reconfig = ReconfigurationLog::new();
        let mut reports = Vec::with_capacity(links.len());
        let per_link = links.iter().zip(sinks).zip(&tunnels).zip(&params);
        for (((link, sink), tunnel), &initial) in per_link {
            let mut fallback = RateLaneFallback::new(&self.config.source, &sink);
            let ids: Vec<StreamId> = link.streams.iter().map(|s| s.id).collect();

            let mut trainer = LinkTrainer::new(
                link.aux.as_ref(),
                self.config.source,
                sink,
                self.delay.as_ref(),
            )
            .with_streams(ids.clone());
            let outcome = trainer.train_with_fallback(initial, &mut fallback, &reconfig)?;

            if let TrainingOutcome::Trained(trained) = &outcome {
                if trained.params != initial {
                    self.link_ceilings
                        .lock()
                        .insert(link.name().to_string(), trained.params);

                    let capacity = self.payload_bw(&trained.params);
                    let required: u32 = assignment
                        .configs
                        .iter()
                        .filter(|c| ids.contains(&c.id))
                        .map(|c| c.required_bw)
                        .sum();
                    if required > capacity {
                        tracing::warn!(
                            "[{}] Trained at {} Mb/s x{}: {} Mb/s payload, streams need {} Mb/s",
                            link.name(),
                            trained.params.link_rate,
                            trained.params.lane_count,
                            capacity,
                            required
                        );
                        for &id in &ids {
                            reconfig.request_full_reconfiguration(id);
                        }
                    }
                }
            }

            reports.push(LinkReport {
                aux: link.name().to_string(),
                streams: ids,
                tunnel: tunnel.as_ref().map(|t| t.id()),
                attempts: trainer.attempts(),
                outcome,
            });
        }

        let report = NegotiationReport {
            assignment,
            commit,
            links: reports,
            reconfiguration_requests: reconfig.requested(),
            tunnels: self.manager.snapshot(),
        };
        tracing::info!(
            "Negotiated {} streams on {} links in {} rounds, all trained: {}",
            streams.len(),
            links.len(),
            report.assignment.iterations,
            report.all_trained()
        );
        Ok(report)
    }

    /// Service a tunneling interrupt on `aux`
    ///
    /// Returns true when the tunnel's BW situation changed and the links
    /// should be negotiated again.
    pub fn service_irq(&self, aux: &dyn DpAux) -> Result<bool> {
        if !self.manager.handle_irq(aux)? {
            return Ok(false);
        }

        let Some(handle) = self.tunnel(aux.name()) else {
            return Ok(true);
        };
        if !self.manager.update_state(&handle)? {
            tracing::warn!("{} Tunnel state inconsistent, dropping it", handle);
            self.forget(aux.name());
        }
        Ok(true)
    }

    pub fn suspend(&self) -> Result<()> {
        let handles: Vec<DpTunnel> = self
            .tunnels
            .lock()
            .values()
            .map(|t| t.handle.clone())
            .collect();
        for handle in handles {
            self.manager.suspend(&handle)?;
        }
        Ok(())
    }

    /// Resume BW allocation on tunnels whose sink still answers
    pub fn resume(&self) -> Result<()> {
        let known: Vec<(DpTunnel, Arc<dyn DpAux>)> = self
            .tunnels
            .lock()
            .values()
            .map(|t| (t.handle.clone(), Arc::clone(&t.aux)))
            .collect();
        for (handle, aux) in known {
            let sink_connected = aux.read_byte(link_addr::DPCD_REV).is_ok_and(|rev| rev != 0);
            if !self.manager.resume(&handle, sink_connected)? {
                tracing::debug!("{} BW allocation stays off after resume", handle);
            }
        }
        Ok(())
    }
}
