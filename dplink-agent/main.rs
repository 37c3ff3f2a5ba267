use anyhow::Context;
use axum::{response::IntoResponse, routing::get, Router};
use clap::{Parser, Subcommand};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dplink::common::{DevAux, NoDelay};
use dplink::orchestrator::{CapacityChange, SimTopology};
use dplink::training::SinkCaps;
use dplink::tunnel::TunnelInfo;
use dplink::{LinkMetricExporter, NegotiationReport, Negotiator, Scenario, TunnelMetricExporter};

const COLLECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "dplink")]
#[command(about = "DisplayPort link bandwidth negotiation and USB4 DP tunnel management")]
struct Args {
    #[arg(
        short,
        long,
        global = true,
        help = "Enable verbose logging (shows every DPCD transaction) when RUST_LOG is unset"
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Negotiate a simulated topology described by a scenario file
    Run {
        scenario: PathBuf,

        #[arg(
            long,
            help = "Keep running, replay the scenario's capacity changes and serve /metrics on ADDR"
        )]
        serve: Option<SocketAddr>,
    },
    /// Read sink and tunnel capabilities from a DP AUX device
    Probe {
        #[arg(long, help = "Index N of /dev/drm_dp_auxN")]
        aux: u32,
    },
}

struct AppState {
    tunnel_exporter: Option<Arc<TunnelMetricExporter>>,
    link_exporter: Option<Arc<LinkMetricExporter>>,
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    dplink::gather_metrics!(buffer, encoder, state.tunnel_exporter, "tunnel");
    dplink::gather_metrics!(buffer, encoder, state.link_exporter, "link");

    let content_type = encoder.format_type().to_string();
    (
        [("Content-Type", content_type)],
        String::from_utf8(buffer).unwrap_or_default(),
    )
}

/// Everything the negotiation tasks share
#[derive(Clone)]
struct RunContext {
    negotiator: Arc<Negotiator>,
    topology: Arc<SimTopology>,
    link_exporter: Arc<LinkMetricExporter>,
    tunnel_exporter: Arc<TunnelMetricExporter>,
}

impl RunContext {
    fn negotiate_blocking(&self) -> dplink::Result<NegotiationReport> {
        match self.negotiator.negotiate(&self.topology.links) {
            Ok(report) => {
                self.link_exporter.record(&report);
                Ok(report)
            }
            Err(e) => {
                self.link_exporter.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Apply a capacity change, service the resulting interrupts and
    /// renegotiate if any tunnel reported a BW change
    fn resync_blocking(&self, change: &CapacityChange) -> dplink::Result<Option<NegotiationReport>> {
        self.topology.apply(change);

        let mut changed = false;
        for sim in &self.topology.sims {
            changed |= self.negotiator.service_irq(sim.as_ref())?;
        }
        if !changed {
            return Ok(None);
        }
        self.negotiate_blocking().map(Some)
    }

    async fn negotiate(&self) -> anyhow::Result<NegotiationReport> {
        let ctx = self.clone();
        let report = tokio::task::spawn_blocking(move || ctx.negotiate_blocking()).await??;
        self.tunnel_exporter.collect().await;
        Ok(report)
    }

    async fn resync(&self, change: CapacityChange) {
        let ctx = self.clone();
        match tokio::task::spawn_blocking(move || ctx.resync_blocking(&change)).await {
            Ok(Ok(Some(report))) => {
                let bpp: Vec<u32> = report.assignment.configs.iter().map(|s| s.bpp).collect();
                tracing::info!(
                    "Renegotiated after capacity change: bpp {:?}, all trained: {}",
                    bpp,
                    report.all_trained()
                );
            }
            Ok(Ok(None)) => tracing::debug!("Capacity change needs no renegotiation"),
            Ok(Err(e)) => tracing::error!("Renegotiation failed: {}", e),
            Err(e) => tracing::error!("Renegotiation task panicked: {}", e),
        }
        self.tunnel_exporter.collect().await;
    }

    fn spawn_event_loop(
        self,
        mut changes: Vec<CapacityChange>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        changes.sort_by_key(|c| c.after_secs);

        tokio::spawn(async move {
            let start = Instant::now();
            let mut pending = changes.into_iter();
            let mut next = pending.next();
            let mut interval = tokio::time::interval(COLLECT_INTERVAL);

            loop {
                let due = next.as_ref().map(|c| start + c.delay());
                let change_due = async move {
                    match due {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::info!("Event loop cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        self.tunnel_exporter.collect().await;
                    }
                    _ = change_due => {
                        if let Some(change) = next.take() {
                            self.resync(change).await;
                        }
                        next = pending.next();
                    }
                }
            }
        })
    }
}

async fn run(path: PathBuf, serve: Option<SocketAddr>) -> anyhow::Result<()> {
    let scenario = Scenario::load(&path)
        .with_context(|| format!("failed to load scenario {}", path.display()))?;
    tracing::info!(
        "Loaded scenario {}: {} links, {} tunnel groups",
        path.display(),
        scenario.links.len(),
        scenario.groups.len()
    );

    let negotiator = Arc::new(Negotiator::new(scenario.config.clone(), Box::new(NoDelay)));
    let ctx = RunContext {
        tunnel_exporter: Arc::new(TunnelMetricExporter::new(negotiator.manager())?),
        link_exporter: Arc::new(LinkMetricExporter::new()?),
        topology: Arc::new(scenario.build()),
        negotiator,
    };

    let report = ctx.negotiate().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let Some(addr) = serve else {
        return Ok(());
    };

    let cancel_token = CancellationToken::new();
    let event_handle = ctx
        .clone()
        .spawn_event_loop(scenario.capacity_changes.clone(), cancel_token.clone());

    let app_state = Arc::new(AppState {
        tunnel_exporter: Some(Arc::clone(&ctx.tunnel_exporter)),
        link_exporter: Some(Arc::clone(&ctx.link_exporter)),
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(app_state);

    tracing::warn!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token))
        .await?;

    tracing::info!("Server shutdown complete, waiting for event loop to finish...");
    let _ = event_handle.await;

    let ctx_suspend = ctx.clone();
    tokio::task::spawn_blocking(move || ctx_suspend.negotiator.suspend()).await??;
    tracing::info!("Tunnels suspended, exiting");

    Ok(())
}

fn probe(index: u32) -> anyhow::Result<()> {
    let aux = DevAux::open(index).with_context(|| format!("failed to open drm_dp_aux{index}"))?;

    let sink = SinkCaps::read(&aux).context("failed to read receiver capabilities")?;
    println!("{}", serde_json::to_string_pretty(&sink)?);

    match TunnelInfo::read(&aux) {
        Ok(info) => match info.validate() {
            None => println!("DP tunnel: {}", info.describe()),
            Some(reason) => println!("No usable DP tunnel: {reason}"),
        },
        Err(e) => tracing::warn!("Failed to read tunneling capabilities: {}", e),
    }

    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    tracing::info!("Installing signal handlers...");

    let ctrl_c = async {
        tracing::debug!("Waiting for Ctrl+C...");
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        tracing::info!("Ctrl+C received!");
    };

    #[cfg(unix)]
    let terminate = async {
        tracing::debug!("Waiting for SIGTERM...");
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
        tracing::info!("SIGTERM received!");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::warn!("Shutdown triggered by Ctrl+C");
        },
        _ = terminate => {
            tracing::warn!("Shutdown triggered by SIGTERM");
        },
    }

    tracing::warn!("Shutdown signal received, initiating graceful shutdown...");
    cancel_token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Run { scenario, serve } => run(scenario, serve).await,
        Command::Probe { aux } => probe(aux),
    }
}
