// Metrics pipeline (spec.md §4.10) plus the ambient counters/gauges a
// production relay exposes alongside it. Grounded on rpc.rs for the
// "reqwest client with a fixed POST budget and best-effort retry" shape.

use crate::fanout::Metric;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;

const BATCH_INTERVAL: Duration = Duration::from_secs(10);
const MAX_BATCH_SIZE: usize = 100;
const POST_BUDGET: Duration = Duration::from_secs(5);
const REQUEUE_CAPACITY: usize = 500;

/// Capacity of the channel `FanOut` enqueues metrics onto, distinct from
/// `REQUEUE_CAPACITY` above (that one bounds `MetricsPipeline`'s own
/// retry backlog, a different structure downstream of this channel).
/// Producers never block: past capacity, the oldest buffered metric is
/// dropped to make room (spec.md §4.6 step 5, §5).
pub const METRIC_CHANNEL_CAPACITY: usize = 5000;

struct MetricChannelInner {
    queue: Mutex<VecDeque<Metric>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

/// The producer half of a bounded, drop-oldest-on-full metric channel.
/// Cloning shares the same underlying queue (mirrors `mpsc::Sender`).
#[derive(Clone)]
pub struct MetricSender {
    inner: Arc<MetricChannelInner>,
}

/// The single consumer half of a bounded, drop-oldest-on-full metric
/// channel.
pub struct MetricReceiver {
    inner: Arc<MetricChannelInner>,
}

/// Builds a bounded channel that never blocks its producers: once
/// `capacity` metrics are buffered, `send` drops the oldest before
/// pushing the newest (spec.md §4.6 step 5, §5's "metric channel: bounded;
/// producers never block — on full, drop the oldest before inserting").
pub fn metric_channel(capacity: usize) -> (MetricSender, MetricReceiver) {
    let inner = Arc::new(MetricChannelInner {
        queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        capacity,
        notify: Notify::new(),
        closed: AtomicBool::new(false),
    });
    (MetricSender { inner: Arc::clone(&inner) }, MetricReceiver { inner })
}

impl MetricSender {
    pub fn send(&self, metric: Metric) {
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
        }
        queue.push_back(metric);
        drop(queue);
        self.inner.notify.notify_one();
    }
}

impl Drop for MetricReceiver {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Relaxed);
    }
}

impl MetricReceiver {
    /// Waits for the next metric, or `None` once every `MetricSender`
    /// has been dropped and the queue has drained.
    pub async fn recv(&mut self) -> Option<Metric> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(metric) = self.inner.queue.lock().pop_front() {
                return Some(metric);
            }
            if self.inner.closed.load(Ordering::Relaxed) {
                return self.inner.queue.lock().pop_front();
            }
            notified.await;
        }
    }
}

/// Process-wide counters and gauges, read by the API surface's
/// `/internal/metrics_debug` endpoint (spec.md §6). Plain atomics: none
/// of these need a lock, and critical sections elsewhere must not
/// perform I/O, so incrementing one is always a single non-blocking op.
#[derive(Default)]
pub struct MetricsRegistry {
    pub duplicates_suppressed_total: AtomicU64,
    pub blocks_sent_total: AtomicU64,
    pub peers_connected: AtomicU64,
    pub rpc_requests_total: AtomicU64,
    pub rpc_failures_total: AtomicU64,
    pub rate_limited_total: AtomicU64,
}

impl MetricsRegistry {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "duplicates_suppressed_total": self.duplicates_suppressed_total.load(Ordering::Relaxed),
            "blocks_sent_total": self.blocks_sent_total.load(Ordering::Relaxed),
            "peers_connected": self.peers_connected.load(Ordering::Relaxed),
            "rpc_requests_total": self.rpc_requests_total.load(Ordering::Relaxed),
            "rpc_failures_total": self.rpc_failures_total.load(Ordering::Relaxed),
            "rate_limited_total": self.rate_limited_total.load(Ordering::Relaxed),
        })
    }
}

/// Drains `Metric` records from a channel every 10s and POSTs them as a
/// single JSON array. On POST failure, records are re-enqueued
/// best-effort, dropping the oldest under contention (spec.md §4.10).
pub struct MetricsPipeline {
    endpoint: Option<String>,
    client: reqwest::Client,
    requeue: AsyncMutex<VecDeque<Metric>>,
    recent: AsyncMutex<VecDeque<Metric>>,
}

impl MetricsPipeline {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::builder()
                .timeout(POST_BUDGET)
                .build()
                .expect("reqwest client with a fixed timeout always builds"),
            requeue: AsyncMutex::new(VecDeque::new()),
            recent: AsyncMutex::new(VecDeque::new()),
        }
    }

    /// Up to 100 of the most recently buffered records, for the
    /// `GET /metrics` API surface (spec.md §6).
    pub async fn recent_snapshot(&self) -> Vec<Metric> {
        self.recent.lock().await.iter().cloned().collect()
    }

    pub async fn run(self: Arc<Self>, mut rx: MetricReceiver) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(BATCH_INTERVAL) => {
                    self.drain_and_send().await;
                }
                maybe_metric = rx.recv() => {
                    match maybe_metric {
                        Some(metric) => self.buffer(metric).await,
                        None => {
                            debug!("[metrics] producer channel closed, draining remainder");
                            self.drain_and_send().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn buffer(&self, metric: Metric) {
        let mut recent = self.recent.lock().await;
        if recent.len() >= MAX_BATCH_SIZE {
            recent.pop_front();
        }
        recent.push_back(metric.clone());
        drop(recent);

        let mut requeue = self.requeue.lock().await;
        if requeue.len() >= REQUEUE_CAPACITY {
            requeue.pop_front();
        }
        requeue.push_back(metric);
    }

    async fn drain_and_send(&self) {
        let batch: Vec<Metric> = {
            let mut requeue = self.requeue.lock().await;
            let n = requeue.len().min(MAX_BATCH_SIZE);
            requeue.drain(..n).collect()
        };
        if batch.is_empty() {
            return;
        }

        let Some(endpoint) = &self.endpoint else {
            return;
        };

        match self.client.post(endpoint).json(&batch).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("[metrics] posted {} records", batch.len());
            }
            Ok(resp) => {
                warn!("[metrics] POST rejected with status {}", resp.status());
                self.requeue_best_effort(batch).await;
            }
            Err(e) => {
                warn!("[metrics] POST failed: {e}");
                self.requeue_best_effort(batch).await;
            }
        }
    }

    async fn requeue_best_effort(&self, batch: Vec<Metric>) {
        let mut requeue = self.requeue.lock().await;
        for metric in batch {
            if requeue.len() >= REQUEUE_CAPACITY {
                requeue.pop_front();
            }
            requeue.push_back(metric);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metric(hash: &str) -> Metric {
        Metric {
            block_hash: hash.to_string(),
            height: 100,
            latency_ms: 12.5,
            peer_count: 3,
            timestamp: 1_700_000_000,
            rpc_node: "node-1".to_string(),
            success: true,
            license_id: "lic-****-abcd".to_string(),
        }
    }

    #[tokio::test]
    async fn buffering_without_endpoint_never_sends() {
        let pipeline = MetricsPipeline::new(None);
        pipeline.buffer(sample_metric("a")).await;
        pipeline.drain_and_send().await;
        assert_eq!(pipeline.recent_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn recent_snapshot_caps_at_max_batch_size() {
        let pipeline = MetricsPipeline::new(None);
        for i in 0..150 {
            pipeline.buffer(sample_metric(&format!("hash-{i}"))).await;
        }
        assert_eq!(pipeline.recent_snapshot().await.len(), MAX_BATCH_SIZE);
    }

    #[test]
    fn registry_snapshot_reports_zero_initially() {
        let registry = MetricsRegistry::default();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot["blocks_sent_total"], 0);
    }
}
