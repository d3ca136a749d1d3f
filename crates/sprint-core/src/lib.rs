//! Bitcoin Sprint relay core: tip polling, dedup, authenticated peer mesh,
//! bounded fan-out, tier-aware rate limiting, and license enforcement.

pub mod api;
pub mod backoff;
pub mod cancel;
pub mod circuit;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fanout;
pub mod gossip;
pub mod handshake;
pub mod license;
pub mod metrics;
pub mod peer;
pub mod poller;
pub mod ratelimit;
pub mod rpc;
pub mod secure;
pub mod wire;

use cancel::CancelToken;
use circuit::CircuitBreaker;
use config::SprintConfig;
use dedup::Deduper;
use fanout::{FanOut, FanOutLimits};
use gossip::SeenMessages;
use license::LicenseGuard;
use log::{info, warn};
use metrics::{MetricsPipeline, MetricsRegistry};
use peer::PeerMesh;
use poller::TipPoller;
use ratelimit::RateLimiter;
use rpc::RpcClient;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Owns every subsystem and the background tasks that drive them. One
/// `Sprint` per process; `run` returns once `cancel` fires.
pub struct Sprint {
    config: SprintConfig,
    cancel: CancelToken,
    dedup: Arc<Deduper>,
    seen: Arc<SeenMessages>,
    poller: Arc<TipPoller>,
    mesh: Arc<PeerMesh>,
    fanout: Arc<FanOut>,
    license: Arc<LicenseGuard>,
    metrics: Arc<MetricsPipeline>,
    registry: Arc<MetricsRegistry>,
    rate_limits: std::collections::HashMap<String, f64>,
}

impl Sprint {
    pub fn new(config: SprintConfig, license_state_path: PathBuf) -> Self {
        let cancel = CancelToken::new();
        let dedup = Arc::new(Deduper::with_defaults(config.network_label.clone()));
        let seen = Arc::new(SeenMessages::new());
        let registry = Arc::new(MetricsRegistry::default());

        let endpoints: Vec<(String, RpcClient)> = config
            .rpc_endpoints
            .iter()
            .enumerate()
            .map(|(i, ep)| {
                let name = format!("rpc-{i}");
                let client = RpcClient::new(ep.url.clone(), config.rpc_user.clone(), config.rpc_password.clone());
                (name, client)
            })
            .collect();
        let breaker = CircuitBreaker::new(circuit::CircuitBreakerConfig::default());
        let poller = Arc::new(TipPoller::new(endpoints, breaker, config.turbo));

        let (relay_tx, relay_rx) = tokio::sync::mpsc::unbounded_channel();
        let mesh = Arc::new(PeerMesh::new(
            config.peer_addresses.clone(),
            config.max_peers,
            config.peer_secret.clone(),
            config.license_key.clone(),
            config.peer_listen_port,
            Arc::clone(&seen),
            relay_tx,
        ));

        // License validation endpoint semantics are an external collaborator
        // (spec.md §1 Non-goals); this core only knows whether local
        // persisted state is fresh. A full deployment wires a real
        // endpoint in; absent one, ensure_valid() degrades to local-only.
        let license = Arc::new(LicenseGuard::new(
            config.license_key.clone(),
            None,
            license_state_path,
        ));

        let (metrics_tx, metrics_rx) = metrics::metric_channel(metrics::METRIC_CHANNEL_CAPACITY);
        let license_id_masked = config.license_key.masked();
        let limits = FanOutLimits { tier: config.tier, daily_limit: default_daily_limit(config.tier) };
        let fanout = Arc::new(FanOut::new(
            Arc::clone(&mesh),
            Arc::clone(&seen),
            limits,
            config.turbo,
            license_id_masked,
            metrics_tx,
            Arc::clone(&license),
        ));

        let metrics = Arc::new(MetricsPipeline::new(config.metrics_endpoint.clone()));

        let rate_limits = config.rate_limits.clone();

        let sprint = Self {
            config,
            cancel,
            dedup,
            seen,
            poller,
            mesh,
            fanout,
            license,
            metrics,
            registry,
            rate_limits,
        };

        sprint.spawn_relay_consumer(relay_rx);
        sprint.spawn_metrics_consumer(metrics_rx);
        sprint
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn spawn_relay_consumer(&self, mut relay_rx: tokio::sync::mpsc::UnboundedReceiver<(wire::BlockMessage, String)>) {
        let dedup = Arc::clone(&self.dedup);
        let fanout = Arc::clone(&self.fanout);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some((msg, source)) = relay_rx.recv() => {
                        if dedup.seen(&msg.hash, std::time::Instant::now()) {
                            continue;
                        }
                        fanout.on_new_block(&msg.hash, 0, &source, Some(msg.message_id)).await;
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    fn spawn_metrics_consumer(&self, metrics_rx: metrics::MetricReceiver) {
        let pipeline = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            pipeline.run(metrics_rx).await;
        });
    }

    /// Runs every background task (tip polling, peer mesh, API surface,
    /// license tick, sweepers) until the cancel token fires.
    pub async fn run(&self) {
        let api_state = Arc::new(api::ApiState {
            tier: self.config.tier,
            turbo: self.config.turbo,
            started_at: Instant::now(),
            rate_limiter: RateLimiter::new(self.rate_limits.clone()),
            poller: Arc::clone(&self.poller),
            fanout: Arc::clone(&self.fanout),
            mesh: Arc::clone(&self.mesh),
            license: Arc::clone(&self.license),
            metrics: Arc::clone(&self.metrics),
            registry: Arc::clone(&self.registry),
        });

        let api_bind = self.config.api_bind_addr.clone();
        let api_port = self.config.api_port;
        let api_cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = api::run(&api_bind, api_port, api_state, api_cancel).await {
                warn!("[sprint] API surface stopped: {e}");
            }
        });

        let mesh_cancel = self.cancel.clone();
        let mesh_for_maintainer = Arc::clone(&self.mesh);
        tokio::spawn(async move {
            mesh_for_maintainer.run_outbound_maintainer(mesh_cancel).await;
        });

        let mesh_cancel = self.cancel.clone();
        let mesh_for_listener = Arc::clone(&self.mesh);
        tokio::spawn(async move {
            if let Err(e) = mesh_for_listener.run_inbound_listener(mesh_cancel).await {
                warn!("[sprint] inbound listener stopped: {e}");
            }
        });

        let license_cancel = self.cancel.clone();
        let license = Arc::clone(&self.license);
        tokio::spawn(async move {
            license.run_hourly_tick(license_cancel).await;
        });

        self.spawn_gossip_sweeper();
        self.spawn_poll_loop();

        self.cancel.cancelled().await;
        info!("[sprint] shutdown signal observed, draining");
    }

    fn spawn_gossip_sweeper(&self) {
        let seen = Arc::clone(&self.seen);
        let dedup = Arc::clone(&self.dedup);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(300)) => {
                        let now = std::time::Instant::now();
                        seen.sweep(now);
                        dedup.cleanup(now);
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    fn spawn_poll_loop(&self) {
        let poller = Arc::clone(&self.poller);
        let dedup = Arc::clone(&self.dedup);
        let fanout = Arc::clone(&self.fanout);
        let license = Arc::clone(&self.license);
        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();
        let base_interval = Duration::from_secs(self.config.poll_interval_secs);

        tokio::spawn(async move {
            loop {
                let now = std::time::Instant::now();
                if license.ensure_valid().await {
                    registry.rpc_requests_total.fetch_add(1, Ordering::Relaxed);
                    match poller.poll_once(now).await {
                        Ok(tip) => {
                            if !dedup.seen(&tip.hash, now) {
                                // FanOut records the send against the same
                                // license.blocks_sent_today counter that
                                // gates admission (license.rs, fanout.rs).
                                fanout.on_new_block(&tip.hash, tip.height, &tip.source_node, None).await;
                            }
                        }
                        Err(e) => {
                            registry.rpc_failures_total.fetch_add(1, Ordering::Relaxed);
                            warn!("[sprint] poll failed: {e}");
                        }
                    }
                } else {
                    warn!("[sprint] license invalid, skipping poll cycle");
                }

                let interval = poller.adaptive_interval(base_interval, now);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }
}

fn default_daily_limit(tier: config::Tier) -> u64 {
    match tier {
        config::Tier::Free => 100,
        config::Tier::Pro => 1_000,
        config::Tier::Business => 0,
        config::Tier::Turbo => 0,
        config::Tier::Enterprise => u64::MAX,
    }
}
