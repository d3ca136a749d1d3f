// End-to-end check of the authenticated peer mesh: a real loopback
// handshake followed by a gossip frame, then a dedup check against the
// single authoritative gate (spec.md invariant 3 / §4.4, §4.5, §4.8).
//
// `PeerMesh::run_gossip_read_loop` only pre-checks `seen.contains(..)`;
// it never records into `seen` itself. The sole recorder is
// `FanOut::on_new_block`. So a retransmitted frame legitimately reaches
// `relay_tx` twice — the "relayed exactly once" guarantee lives one
// layer downstream, where `Sprint::spawn_relay_consumer` feeds
// `relay_rx` into a shared `FanOut`.

use sprint_core::cancel::CancelToken;
use sprint_core::config::Tier;
use sprint_core::fanout::{FanOut, FanOutLimits};
use sprint_core::gossip::SeenMessages;
use sprint_core::handshake;
use sprint_core::license::LicenseGuard;
use sprint_core::metrics;
use sprint_core::peer::PeerMesh;
use sprint_core::secure::SecureBytes;
use sprint_core::wire::BlockMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Reserves an ephemeral loopback port by binding and immediately
/// releasing it, so `PeerMesh::run_inbound_listener` can rebind the
/// same port under test.
async fn reserve_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn connect(port: u16) -> TcpStream {
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    TcpStream::connect(addr).await.unwrap()
}

fn unlimited_license(name: &str) -> Arc<LicenseGuard> {
    let state_path = std::env::temp_dir().join(format!(
        "sprint-test-license-{name}-{}-{}.json",
        std::process::id(),
        now_unix()
    ));
    Arc::new(LicenseGuard::new(SecureBytes::from_str("license-xyz"), None, state_path))
}

#[tokio::test]
async fn inbound_peer_authenticates_and_a_retransmit_is_suppressed_by_fanout() {
    let secret = SecureBytes::from_str("shared-peer-secret");
    let license = SecureBytes::from_str("license-xyz");
    let seen = Arc::new(SeenMessages::new());
    let (relay_tx, mut relay_rx) = tokio::sync::mpsc::unbounded_channel();
    let port = reserve_port().await;

    let mesh = Arc::new(PeerMesh::new(
        vec![],
        50,
        secret.clone(),
        license.clone(),
        port,
        Arc::clone(&seen),
        relay_tx,
    ));

    let cancel = CancelToken::new();
    let mesh_for_listener = Arc::clone(&mesh);
    let listener_cancel = cancel.clone();
    tokio::spawn(async move {
        mesh_for_listener.run_inbound_listener(listener_cancel).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = connect(port).await;
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let license_str = license.expose_as_string();
    let outbound = handshake::sign(&secret, &license_str, now_unix());
    drop(license_str);
    let mut bytes = serde_json::to_vec(&outbound).unwrap();
    bytes.push(b'\n');
    writer.write_all(&bytes).await.unwrap();

    let mut response_line = String::new();
    reader.read_line(&mut response_line).await.unwrap();
    let response: sprint_core::wire::PeerHandshake =
        serde_json::from_str(response_line.trim_end()).unwrap();
    assert!(handshake::verify(&secret, &response, now_unix()));

    let msg = BlockMessage::new("a".repeat(64), now_unix(), "relay-test-id");
    let frame = msg.to_frame().unwrap();
    writer.write_all(&frame).await.unwrap();
    // A retransmit of the exact same frame: the gossip loop only reads
    // `seen`, it never writes to it, so both copies legitimately reach
    // `relay_tx`.
    writer.write_all(&frame).await.unwrap();

    let (first, source) = tokio::time::timeout(Duration::from_secs(2), relay_rx.recv())
        .await
        .expect("relay channel should deliver the first frame")
        .expect("channel should not be closed");
    assert_eq!(first.hash, "a".repeat(64));
    assert!(!source.is_empty());

    let (second, _source) = tokio::time::timeout(Duration::from_secs(2), relay_rx.recv())
        .await
        .expect("the retransmit reaches relay_rx too, since the gossip loop never dedups")
        .expect("channel should not be closed");
    assert_eq!(second.message_id, first.message_id);

    cancel.cancel();

    // The actual "relayed exactly once" guarantee lives in FanOut, the
    // sole caller of `seen.record_if_new`.
    let (metrics_tx, _metrics_rx) = metrics::metric_channel(16);
    let license = unlimited_license("fanout-dedup");
    let limits = FanOutLimits { tier: Tier::Enterprise, daily_limit: 0 };
    let fanout = FanOut::new(
        Arc::clone(&mesh),
        Arc::clone(&seen),
        limits,
        false,
        "lic-****-test".to_string(),
        metrics_tx,
        Arc::clone(&license),
    );

    fanout
        .on_new_block(&first.hash, 0, &source, Some(first.message_id.clone()))
        .await;
    assert_eq!(license.blocks_sent_today(), 1);

    fanout
        .on_new_block(&second.hash, 0, &source, Some(second.message_id.clone()))
        .await;
    assert_eq!(
        license.blocks_sent_today(),
        1,
        "the retransmitted message_id must not be counted as a second send"
    );
}

#[tokio::test]
async fn handshake_with_wrong_secret_is_rejected_silently() {
    let server_secret = SecureBytes::from_str("server-secret");
    let client_secret = SecureBytes::from_str("client-secret");
    let license = SecureBytes::from_str("license");
    let (relay_tx, mut relay_rx) = tokio::sync::mpsc::unbounded_channel();
    let port = reserve_port().await;

    let mesh = Arc::new(PeerMesh::new(
        vec![],
        50,
        server_secret,
        license,
        port,
        Arc::new(SeenMessages::new()),
        relay_tx,
    ));

    let cancel = CancelToken::new();
    let mesh_for_listener = Arc::clone(&mesh);
    let listener_cancel = cancel.clone();
    tokio::spawn(async move {
        mesh_for_listener.run_inbound_listener(listener_cancel).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = connect(port).await;
    let (_reader, mut writer) = tokio::io::split(stream);
    let outbound = handshake::sign(&client_secret, "license", now_unix());
    let mut bytes = serde_json::to_vec(&outbound).unwrap();
    bytes.push(b'\n');
    writer.write_all(&bytes).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mesh.peer_count(), 0);
    let nothing = tokio::time::timeout(Duration::from_millis(200), relay_rx.recv()).await;
    assert!(nothing.is_err(), "an unauthenticated peer must never reach the relay channel");

    cancel.cancel();
}
