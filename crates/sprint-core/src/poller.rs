// Tip poller (spec.md §4.2): multi-node racing in turbo mode, per-node
// backoff, circuit breaker integration, adaptive polling interval.

use crate::backoff::BackoffRegistry;
use crate::circuit::{BreakerState, CircuitBreaker, FailureKind};
use crate::rpc::RpcClient;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

const EMA_ALPHA: f64 = 0.2;

struct EndpointState {
    client: RpcClient,
    ema_latency: Mutex<Option<f64>>,
}

pub struct TipPoller {
    endpoints: Vec<(String, EndpointState)>,
    backoff: BackoffRegistry,
    breaker: CircuitBreaker,
    turbo: bool,
    last_hash: Mutex<Option<String>>,
    last_block_at: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone)]
pub struct Tip {
    pub hash: String,
    pub height: i64,
    pub source_node: String,
}

impl TipPoller {
    pub fn new(
        endpoints: Vec<(String, RpcClient)>,
        breaker: CircuitBreaker,
        turbo: bool,
    ) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|(name, client)| {
                (
                    name,
                    EndpointState {
                        client,
                        ema_latency: Mutex::new(None),
                    },
                )
            })
            .collect();
        Self {
            endpoints,
            backoff: BackoffRegistry::new(),
            breaker,
            turbo,
            last_hash: Mutex::new(None),
            last_block_at: Mutex::new(None),
        }
    }

    /// Discover the current tip from one of the configured endpoints.
    /// Returns `Err` if the circuit breaker is open or every endpoint
    /// failed.
    pub async fn poll_once(&self, now: Instant) -> Result<Tip, String> {
        if !self.breaker.allow(now) {
            return Err("circuit open".to_string());
        }

        let result = if self.turbo && self.endpoints.len() > 1 {
            self.poll_racing(now).await
        } else {
            self.poll_sequential(now).await
        };

        match &result {
            Ok(_) => self.breaker.record_success(now),
            Err(_) => self.breaker.record_failure(FailureKind::Error, now),
        }
        result
    }

    async fn poll_sequential(&self, now: Instant) -> Result<Tip, String> {
        for (name, state) in &self.endpoints {
            if self.backoff.is_backed_off(name, now) {
                continue;
            }
            if let Ok(tip) = self.try_endpoint(name, state, now).await {
                return Ok(tip);
            }
        }
        Err("all endpoints failed or backed off".to_string())
    }

    /// Launches one request per endpoint not in backoff, ordered by
    /// ascending EMA latency, and returns the first success. The rest
    /// are cancelled by `select_ok` dropping them once a winner resolves.
    async fn poll_racing(&self, now: Instant) -> Result<Tip, String> {
        let mut candidates: Vec<&(String, EndpointState)> = self
            .endpoints
            .iter()
            .filter(|(name, _)| !self.backoff.is_backed_off(name, now))
            .collect();

        candidates.sort_by(|(_, a), (_, b)| {
            let ema_a = a.ema_latency.lock().as_ref().copied().unwrap_or(f64::MAX);
            let ema_b = b.ema_latency.lock().as_ref().copied().unwrap_or(f64::MAX);
            ema_a.partial_cmp(&ema_b).unwrap_or(std::cmp::Ordering::Equal)
        });

        if candidates.is_empty() {
            return Err("all endpoints in backoff".to_string());
        }

        let futures = candidates
            .iter()
            .map(|(name, state)| Box::pin(self.try_endpoint(name, state, now)));

        match futures::future::select_ok(futures).await {
            Ok((tip, _still_running)) => Ok(tip),
            Err(last_err) => Err(last_err),
        }
    }

    async fn try_endpoint(&self, name: &str, state: &EndpointState, now: Instant) -> Result<Tip, String> {
        let started = std::time::Instant::now();
        let result = state.client.get_tip().await;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(tip) => {
                let mut ema = state.ema_latency.lock();
                *ema = Some(match *ema {
                    Some(prev) => EMA_ALPHA * elapsed + (1.0 - EMA_ALPHA) * prev,
                    None => elapsed,
                });
                self.backoff.clear(name);

                let is_new = self.last_hash.lock().as_deref() != Some(tip.hash.as_str());
                if is_new {
                    *self.last_hash.lock() = Some(tip.hash.clone());
                    *self.last_block_at.lock() = Some(now);
                    info!("[tip-poller] new tip {} height={} via {}", &tip.hash[..tip.hash.len().min(16)], tip.height, name);
                } else {
                    debug!("[tip-poller] tip unchanged via {name}");
                }

                Ok(Tip {
                    hash: tip.hash,
                    height: tip.height,
                    source_node: name.to_string(),
                })
            }
            Err(e) => {
                warn!("[tip-poller] {name} failed: {e}");
                self.backoff.record_failure(name, now, e.clone());
                Err(e)
            }
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Queries the first endpoint not currently backed off for mempool
    /// size, for the `/predictive` API surface (spec.md §6). Best-effort:
    /// `None` if every endpoint is backed off or the call fails.
    pub async fn mempool_size(&self, now: Instant) -> Option<i64> {
        for (name, state) in &self.endpoints {
            if self.backoff.is_backed_off(name, now) {
                continue;
            }
            if let Ok(info) = state.client.get_mempool_info().await {
                return Some(info.size);
            }
        }
        None
    }

    pub fn active_node_count(&self, now: Instant) -> usize {
        self.endpoints
            .iter()
            .filter(|(name, _)| !self.backoff.is_backed_off(name, now))
            .count()
    }

    /// Four-speed adaptive interval: shrinks toward 1s right after a
    /// new block, relaxes toward 10s during quiet periods (spec.md
    /// §4.2, DESIGN.md's "state machine of four speeds").
    pub fn adaptive_interval(&self, base: Duration, now: Instant) -> Duration {
        if !self.turbo {
            return base;
        }
        let Some(last_block) = *self.last_block_at.lock() else {
            return base;
        };
        let since = now.duration_since(last_block);
        match since {
            d if d < Duration::from_secs(10) => Duration::from_secs(1),
            d if d < Duration::from_secs(60) => Duration::from_secs(3),
            d if d < Duration::from_secs(300) => Duration::from_secs(6),
            _ => Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_interval_shrinks_after_block_then_relaxes() {
        let breaker = CircuitBreaker::new(Default::default());
        let poller = TipPoller::new(vec![], breaker, true);
        let t0 = Instant::now();
        *poller.last_block_at.lock() = Some(t0);

        assert_eq!(poller.adaptive_interval(Duration::from_secs(5), t0), Duration::from_secs(1));
        assert_eq!(
            poller.adaptive_interval(Duration::from_secs(5), t0 + Duration::from_secs(30)),
            Duration::from_secs(3)
        );
        assert_eq!(
            poller.adaptive_interval(Duration::from_secs(5), t0 + Duration::from_secs(600)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn non_turbo_uses_base_interval() {
        let breaker = CircuitBreaker::new(Default::default());
        let poller = TipPoller::new(vec![], breaker, false);
        assert_eq!(
            poller.adaptive_interval(Duration::from_secs(5), Instant::now()),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn poll_fails_fast_when_circuit_open() {
        let breaker = CircuitBreaker::new(crate::circuit::CircuitBreakerConfig {
            consecutive_failure_threshold: 1,
            ..Default::default()
        });
        let t0 = Instant::now();
        breaker.record_failure(FailureKind::Error, t0);
        let poller = TipPoller::new(vec![], breaker, false);
        let result = poller.poll_once(t0).await;
        assert_eq!(result.unwrap_err(), "circuit open");
    }
}
