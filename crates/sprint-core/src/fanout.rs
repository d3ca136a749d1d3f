// FanOut (spec.md §4.6): the OnNewBlock contract — license admission,
// message-ID synthesis, loop suppression, bounded-concurrency broadcast,
// metric emission, and counters. Grounded on the teacher's webhook
// broadcaster (engine/webhook.rs) for the "build the payload once, fan
// out with bounded concurrency, evict on write error" shape.

use crate::config::Tier;
use crate::gossip::SeenMessages;
use crate::license::LicenseGuard;
use crate::metrics::MetricSender;
use crate::peer::PeerMesh;
use crate::wire::BlockMessage;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, serde::Serialize)]
pub struct Metric {
    pub block_hash: String,
    pub height: i64,
    pub latency_ms: f64,
    pub peer_count: usize,
    pub timestamp: i64,
    pub rpc_node: String,
    pub success: bool,
    pub license_id: String,
}

/// Admission + counters for the current license tier. Daily reset and
/// remote validation live in `license::LicenseGuard`; this struct only
/// holds the numbers FanOut needs on the hot path.
pub struct FanOutLimits {
    pub tier: Tier,
    pub daily_limit: u64,
}

impl FanOutLimits {
    /// free=limit, pro=2x limit, enterprise=unbounded, all other tiers=0
    /// (spec.md §4.6 — business/turbo are fan-out-gated by design; turbo
    /// only affects polling/rate-limit multipliers, not send admission).
    pub fn effective_limit(&self) -> u64 {
        match self.tier {
            Tier::Free => self.daily_limit,
            Tier::Pro => self.daily_limit.saturating_mul(2),
            Tier::Enterprise => u64::MAX,
            Tier::Business | Tier::Turbo => 0,
        }
    }
}

pub struct FanOut {
    mesh: Arc<PeerMesh>,
    seen: Arc<SeenMessages>,
    limits: FanOutLimits,
    turbo: bool,
    license_id_masked: String,
    license: Arc<LicenseGuard>,
    sprint_latency_ema: Mutex<Option<f64>>,
    metrics_tx: MetricSender,
}

impl FanOut {
    pub fn new(
        mesh: Arc<PeerMesh>,
        seen: Arc<SeenMessages>,
        limits: FanOutLimits,
        turbo: bool,
        license_id_masked: String,
        metrics_tx: MetricSender,
        license: Arc<LicenseGuard>,
    ) -> Self {
        Self {
            mesh,
            seen,
            limits,
            turbo,
            license_id_masked,
            license,
            sprint_latency_ema: Mutex::new(None),
            metrics_tx,
        }
    }

    /// The single counter gating admission, owned by `LicenseGuard` and
    /// reset on its hourly tick (spec.md §4.9) — `FanOut` never keeps its
    /// own copy.
    pub fn blocks_sent(&self) -> u64 {
        self.license.blocks_sent_today()
    }

    /// Daily admission ceiling for the configured tier (spec.md §6).
    pub fn block_limit(&self) -> u64 {
        self.limits.effective_limit()
    }

    pub fn sprint_latency_ema(&self) -> Option<f64> {
        *self.sprint_latency_ema.lock()
    }

    /// Drives a newly detected block through admission, dedup, broadcast,
    /// and metrics. Returns the number of peers that accepted the frame.
    pub async fn on_new_block(
        &self,
        hash: &str,
        height: i64,
        source: &str,
        message_id: Option<String>,
    ) -> usize {
        let started = std::time::Instant::now();

        let limit = self.limits.effective_limit();
        if self.license.blocks_sent_today() >= limit {
            info!("[fan-out] dropping {hash}: daily license limit reached");
            return 0;
        }

        let message_id = message_id.unwrap_or_else(|| synthesize_message_id(hash));
        if !self.seen.record_if_new(&message_id, std::time::Instant::now()) {
            debug!("[fan-out] {message_id} already relayed, skipping");
            return 0;
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let frame = match BlockMessage::new(hash, now, message_id.clone()).to_frame() {
            Ok(f) => f,
            Err(e) => {
                warn!("[fan-out] failed to encode block frame: {e}");
                return 0;
            }
        };

        let peers = self.mesh.authenticated_peers();
        let peer_count = peers.len();
        let concurrency = if self.turbo {
            peer_count.min(100)
        } else {
            peer_count.min(50)
        };

        let accepted = broadcast(&frame, peers, concurrency).await;

        self.license.record_block_sent();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut ema = self.sprint_latency_ema.lock();
        *ema = Some(match *ema {
            Some(prev) => EMA_ALPHA * elapsed_ms + (1.0 - EMA_ALPHA) * prev,
            None => elapsed_ms,
        });
        drop(ema);

        let metric = Metric {
            block_hash: hash.to_string(),
            height,
            latency_ms: elapsed_ms,
            peer_count: accepted,
            timestamp: now,
            rpc_node: source.to_string(),
            success: accepted > 0,
            license_id: self.license_id_masked.clone(),
        };
        enqueue_metric(&self.metrics_tx, metric);

        info!("[fan-out] relayed {hash} to {accepted}/{peer_count} peers");
        accepted
    }
}

/// `hex(hash || nano_now)` per spec.md §4.6.
fn synthesize_message_id(hash: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut bytes = hash.as_bytes().to_vec();
    bytes.extend_from_slice(nanos.to_string().as_bytes());
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn broadcast(
    frame: &[u8],
    peers: Vec<Arc<crate::peer::PeerConnection>>,
    concurrency: usize,
) -> usize {
    use futures::stream::{self, StreamExt};

    if peers.is_empty() || concurrency == 0 {
        return 0;
    }

    stream::iter(peers)
        .map(|peer| {
            let frame = frame.to_vec();
            async move { peer.send_frame(&frame).await.is_ok() }
        })
        .buffer_unordered(concurrency)
        .filter(|ok| std::future::ready(*ok))
        .count()
        .await
}

/// Enqueues onto the bounded, drop-oldest metric channel (spec.md §4.6
/// step 5, §4.10) — never blocks the fan-out hot path.
fn enqueue_metric(tx: &MetricSender, metric: Metric) {
    tx.send(metric);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_limit_by_tier() {
        assert_eq!(FanOutLimits { tier: Tier::Free, daily_limit: 100 }.effective_limit(), 100);
        assert_eq!(FanOutLimits { tier: Tier::Pro, daily_limit: 100 }.effective_limit(), 200);
        assert_eq!(FanOutLimits { tier: Tier::Enterprise, daily_limit: 100 }.effective_limit(), u64::MAX);
        assert_eq!(FanOutLimits { tier: Tier::Business, daily_limit: 100 }.effective_limit(), 0);
        assert_eq!(FanOutLimits { tier: Tier::Turbo, daily_limit: 100 }.effective_limit(), 0);
    }

    #[test]
    fn message_id_synthesis_is_deterministic_length_hex() {
        let id = synthesize_message_id("abc123");
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.len() > "abc123".len());
    }

    #[tokio::test]
    async fn broadcast_with_no_peers_returns_zero() {
        assert_eq!(broadcast(b"frame\n", vec![], 10).await, 0);
    }
}
