// HTTP surface (spec.md §6) on a raw `tokio::net::TcpListener`, no
// framework dependency — grounded on the teacher's webhook bridge
// (engine/webhook.rs) for the "read-the-whole-request, match on
// method+path, write a hand-built HTTP/1.1 response" shape.

use crate::config::Tier;
use crate::error::SprintError;
use crate::fanout::FanOut;
use crate::license::LicenseGuard;
use crate::metrics::MetricsRegistry;
use crate::peer::PeerMesh;
use crate::poller::TipPoller;
use crate::ratelimit::RateLimiter;
use log::{info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SECURITY_HEADERS: &str = "X-Content-Type-Options: nosniff\r\n\
X-Frame-Options: DENY\r\n\
Content-Security-Policy: default-src 'self'\r\n\
Strict-Transport-Security: max-age=31536000; includeSubDomains\r\n";

pub struct ApiState {
    pub tier: Tier,
    pub turbo: bool,
    pub started_at: Instant,
    pub rate_limiter: RateLimiter,
    pub poller: Arc<TipPoller>,
    pub fanout: Arc<FanOut>,
    pub mesh: Arc<PeerMesh>,
    pub license: Arc<LicenseGuard>,
    pub metrics: Arc<crate::metrics::MetricsPipeline>,
    pub registry: Arc<MetricsRegistry>,
}

pub async fn run(bind_addr: &str, port: u16, state: Arc<ApiState>, cancel: crate::cancel::CancelToken) -> std::io::Result<()> {
    let listener = TcpListener::bind((bind_addr, port)).await?;
    info!("[api] listening on {bind_addr}:{port}");

    let sweep_state = Arc::clone(&state);
    let sweep_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
                    sweep_state.rate_limiter.sweep(Instant::now());
                }
                _ = sweep_cancel.cancelled() => return,
            }
        }
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("[api] accept error: {e}");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                let peer_ip = peer.ip().to_string();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &peer_ip, state).await {
                        warn!("[api] request from {peer_ip} failed: {e}");
                    }
                });
            }
            _ = cancel.cancelled() => {
                info!("[api] server stopping");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer_ip: &str, state: Arc<ApiState>) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    let raw = String::from_utf8_lossy(&buf[..n]).to_string();
    let first_line = raw.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    let (method, path) = match parts.as_slice() {
        [m, p, ..] => (*m, *p),
        _ => {
            return write_error(&mut stream, &SprintError::BadRequest("malformed request line".to_string())).await;
        }
    };

    if method == "GET" && path == "/health" {
        let body = json!({
            "status": "ok",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        });
        return write_json(&mut stream, 200, &body).await;
    }

    let endpoint = path.split('?').next().unwrap_or(path);
    if !state.rate_limiter.allow(peer_ip, endpoint, state.turbo, Instant::now()) {
        state.registry.rate_limited_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        return write_error(&mut stream, &SprintError::RateLimited).await;
    }

    match (method, endpoint) {
        ("GET", "/status") => handle_status(&mut stream, &state).await,
        ("GET", "/latest") => handle_latest(&mut stream, &state).await,
        ("GET", "/metrics") => handle_metrics(&mut stream, &state).await,
        ("GET", "/predictive") => handle_predictive(&mut stream, &state).await,
        ("GET", "/stream") => handle_stream(&mut stream, &state).await,
        ("GET", "/internal/metrics_debug") => handle_metrics_debug(&mut stream, &state).await,
        _ => write_error(&mut stream, &SprintError::NotFound(format!("no route for {method} {endpoint}"))).await,
    }
}

async fn handle_status(stream: &mut TcpStream, state: &ApiState) -> std::io::Result<()> {
    let now = Instant::now();
    let recent = state.metrics.recent_snapshot().await;
    let last_block_time = recent.last().map(|m| {
        chrono::DateTime::from_timestamp(m.timestamp, 0)
            .unwrap_or_else(|| chrono::Utc::now())
            .to_rfc3339()
    });
    let body = json!({
        "tier": format!("{:?}", state.tier),
        "license_key": "****",
        "valid": state.license.is_valid(),
        "blocks_sent_today": state.license.blocks_sent_today(),
        "block_limit": state.fanout.block_limit(),
        "last_block_time": last_block_time,
        "peers_connected": state.mesh.peer_count(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "turbo_mode_enabled": state.turbo,
        "rpc_nodes_active": state.poller.active_node_count(now),
        "circuit_breaker_state": format!("{:?}", state.poller.breaker_state()),
    });
    write_json(stream, 200, &body).await
}

async fn handle_latest(stream: &mut TcpStream, state: &ApiState) -> std::io::Result<()> {
    let recent = state.metrics.recent_snapshot().await;
    match recent.last() {
        Some(metric) => write_json(stream, 200, &serde_json::to_value(metric).unwrap_or(json!({}))).await,
        None => write_error(stream, &SprintError::NoData("no block observed yet".to_string())).await,
    }
}

async fn handle_metrics(stream: &mut TcpStream, state: &ApiState) -> std::io::Result<()> {
    let recent = state.metrics.recent_snapshot().await;
    write_json(stream, 200, &serde_json::to_value(recent).unwrap_or(json!([]))).await
}

async fn handle_predictive(stream: &mut TcpStream, state: &ApiState) -> std::io::Result<()> {
    let recent = state.metrics.recent_snapshot().await;
    let mempool_size = state.poller.mempool_size(Instant::now()).await.unwrap_or(0);
    let body = json!({
        "mempool_size": mempool_size,
        "trend": "medium",
        "probability_next_block_60s": estimate_probability(&recent),
        "last_update": chrono::Utc::now().to_rfc3339(),
        "average_block_time_minutes": 10.0,
    });
    write_json(stream, 200, &body).await
}

fn estimate_probability(recent: &[crate::fanout::Metric]) -> f64 {
    if recent.is_empty() {
        0.0
    } else {
        (recent.len() as f64 / 100.0).min(1.0)
    }
}

async fn handle_stream(stream: &mut TcpStream, state: &ApiState) -> std::io::Result<()> {
    let headers = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n{SECURITY_HEADERS}\r\n"
    );
    stream.write_all(headers.as_bytes()).await?;

    let mut last_sent = 0usize;
    for _ in 0..30 {
        let recent = state.metrics.recent_snapshot().await;
        if recent.len() > last_sent {
            for metric in &recent[last_sent..] {
                let line = format!("data: {}\n\n", serde_json::to_string(metric).unwrap_or_default());
                if stream.write_all(line.as_bytes()).await.is_err() {
                    return Ok(());
                }
            }
            last_sent = recent.len();
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
    Ok(())
}

async fn handle_metrics_debug(stream: &mut TcpStream, state: &ApiState) -> std::io::Result<()> {
    let snapshot = state.registry.snapshot();
    let mut body = String::new();
    if let serde_json::Value::Object(map) = snapshot {
        for (k, v) in map {
            body.push_str(&format!("{k} {v}\n"));
        }
    }
    body.push_str(&format!("circuit_breaker_state {:?}\n", state.poller.breaker_state()));
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n{SECURITY_HEADERS}\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}

async fn write_json(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> std::io::Result<()> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{SECURITY_HEADERS}\r\n{json}",
        status_text(status),
        json.len()
    );
    stream.write_all(response.as_bytes()).await
}

async fn write_error(stream: &mut TcpStream, err: &SprintError) -> std::io::Result<()> {
    write_json(stream, err.http_status(), &json!({ "error": err.kind(), "message": err.to_string() })).await
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_covers_documented_codes() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(429), "Too Many Requests");
        assert_eq!(status_text(503), "Service Unavailable");
    }

    #[test]
    fn estimate_probability_is_bounded() {
        assert_eq!(estimate_probability(&[]), 0.0);
        let many: Vec<crate::fanout::Metric> = (0..500)
            .map(|i| crate::fanout::Metric {
                block_hash: i.to_string(),
                height: 0,
                latency_ms: 0.0,
                peer_count: 0,
                timestamp: 0,
                rpc_node: String::new(),
                success: true,
                license_id: String::new(),
            })
            .collect();
        assert_eq!(estimate_probability(&many), 1.0);
    }
}
