// Peer mesh (spec.md §4.4): outbound maintainer, inbound listener, and the
// per-peer gossip read loop. Grounded on the teacher's IRC bridge
// (engine/irc.rs) for the connect/read-loop/shared-writer shape, adapted
// from a single long-lived text socket to many short-lived authenticated
// peers tracked in one map.

use crate::cancel::CancelToken;
use crate::gossip::SeenMessages;
use crate::handshake;
use crate::secure::SecureBytes;
use crate::wire::{BlockMessage, PeerHandshake, MAX_FRAME_BYTES, PROTOCOL_VERSION};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex as AsyncMutex;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const GOSSIP_READ_TIMEOUT: Duration = Duration::from_secs(30);
const FANOUT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const MAX_UPTIME: Duration = Duration::from_secs(2 * 3600);
const FAILURE_THRESHOLD: u32 = 5;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// A single authenticated outbound write half, serialized by one lock so
/// concurrent fan-out writers and the reconcile loop never interleave bytes
/// (spec.md §3: "PeerConnection's socket is exclusively owned by PeerMesh").
pub struct PeerConnection {
    pub address: String,
    writer: AsyncMutex<tokio::io::WriteHalf<TcpStream>>,
    connected_at: std::time::Instant,
    last_sent_at: RwLock<Option<std::time::Instant>>,
    successes: AtomicU64,
    failures: AtomicU32,
    authenticated: std::sync::atomic::AtomicBool,
}

impl PeerConnection {
    fn new(address: String, writer: tokio::io::WriteHalf<TcpStream>) -> Self {
        Self {
            address,
            writer: AsyncMutex::new(writer),
            connected_at: std::time::Instant::now(),
            last_sent_at: RwLock::new(None),
            successes: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            authenticated: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Relaxed);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    fn should_evict(&self, now: std::time::Instant) -> bool {
        !self.is_authenticated()
            || self.failures.load(Ordering::Relaxed) > FAILURE_THRESHOLD
            || now.duration_since(self.connected_at) > MAX_UPTIME
    }

    /// Writes one frame with a 2s deadline. On any error the caller evicts
    /// this connection (spec.md §4.6).
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), String> {
        let mut writer = self.writer.lock().await;
        let result = tokio::time::timeout(FANOUT_WRITE_TIMEOUT, writer.write_all(frame)).await;
        match result {
            Ok(Ok(())) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                *self.last_sent_at.write() = Some(std::time::Instant::now());
                Ok(())
            }
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(format!("write error: {e}"))
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err("write deadline exceeded".to_string())
            }
        }
    }
}

/// Owns the peer map, the declared peer-address list, and the shared
/// secrets needed to dial/authenticate. One RW lock guards the map
/// (spec.md §5); the sockets themselves are never covered by that lock.
pub struct PeerMesh {
    peers: RwLock<HashMap<String, Arc<PeerConnection>>>,
    declared_addresses: Vec<String>,
    max_peers: usize,
    peer_secret: SecureBytes,
    license_key: SecureBytes,
    listen_port: u16,
    seen: Arc<SeenMessages>,
    /// Relayed blocks that passed frame validation and SeenMessages are
    /// pushed here for the caller's OnNewBlock hook (kept out of this
    /// module to avoid a cyclic dependency with fan-out).
    relay_tx: UnboundedSender<(BlockMessage, String)>,
}

impl PeerMesh {
    pub fn new(
        declared_addresses: Vec<String>,
        max_peers: usize,
        peer_secret: SecureBytes,
        license_key: SecureBytes,
        listen_port: u16,
        seen: Arc<SeenMessages>,
        relay_tx: UnboundedSender<(BlockMessage, String)>,
    ) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            declared_addresses,
            max_peers,
            peer_secret,
            license_key,
            listen_port,
            seen,
            relay_tx,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn authenticated_peers(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .read()
            .values()
            .filter(|p| p.is_authenticated())
            .cloned()
            .collect()
    }

    fn evict(&self, address: &str) {
        if self.peers.write().remove(address).is_some() {
            debug!("[peer-mesh] evicted {address}");
        }
    }

    fn insert(&self, address: String, conn: Arc<PeerConnection>) {
        self.peers.write().insert(address, conn);
    }

    fn is_connected(&self, address: &str) -> bool {
        self.peers.read().contains_key(address)
    }

    /// Runs the 30s outbound reconcile loop until cancelled (spec.md §4.4).
    pub async fn run_outbound_maintainer(self: &Arc<Self>, cancel: CancelToken) {
        loop {
            self.reconcile_once().await;
            tokio::select! {
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    info!("[peer-mesh] outbound maintainer stopping");
                    return;
                }
            }
        }
    }

    async fn reconcile_once(self: &Arc<Self>) {
        let now = std::time::Instant::now();
        let stale: Vec<String> = self
            .peers
            .read()
            .iter()
            .filter(|(_, conn)| conn.should_evict(now))
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in stale {
            self.evict(&addr);
        }

        for addr in self.declared_addresses.clone() {
            if self.peer_count() >= self.max_peers {
                break;
            }
            if self.is_connected(&addr) {
                continue;
            }
            let mesh = Arc::clone(self);
            let addr_owned = addr.clone();
            tokio::spawn(async move {
                if let Err(e) = mesh.dial(&addr_owned).await {
                    warn!("[peer-mesh] dial {addr_owned} failed: {e}");
                }
            });
        }
    }

    async fn dial(self: &Arc<Self>, address: &str) -> Result<(), String> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| "dial timeout".to_string())?
            .map_err(|e| format!("connect error: {e}"))?;

        let (reader, mut writer) = tokio::io::split(stream);
        let license_key = self.license_key.expose_as_string();
        let handshake = handshake::sign(&self.peer_secret, &license_key, now_unix());
        drop(license_key);
        let outbound = serde_json::to_vec(&handshake).map_err(|e| e.to_string())?;

        tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            writer.write_all(&outbound).await?;
            writer.write_all(b"\n").await
        })
        .await
        .map_err(|_| "handshake write timeout".to_string())?
        .map_err(|e| format!("handshake write error: {e}"))?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| "handshake read timeout".to_string())?
            .map_err(|e| format!("handshake read error: {e}"))?;

        let peer_frame: PeerHandshake =
            serde_json::from_str(line.trim_end()).map_err(|e| format!("bad handshake frame: {e}"))?;
        if !handshake::verify(&self.peer_secret, &peer_frame, now_unix()) {
            return Err("handshake verification failed".to_string());
        }

        let conn = Arc::new(PeerConnection::new(address.to_string(), writer));
        conn.mark_authenticated();
        self.insert(address.to_string(), Arc::clone(&conn));
        info!("[peer-mesh] outbound peer {address} authenticated");

        let mesh = Arc::clone(self);
        let addr_owned = address.to_string();
        tokio::spawn(async move {
            mesh.run_gossip_read_loop(addr_owned, reader).await;
        });

        Ok(())
    }

    /// Accepts inbound connections until cancelled (spec.md §4.4).
    pub async fn run_inbound_listener(self: &Arc<Self>, cancel: CancelToken) -> Result<(), String> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .map_err(|e| format!("bind failed: {e}"))?;
        info!("[peer-mesh] listening on port {}", self.listen_port);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("[peer-mesh] accept error: {e}");
                            continue;
                        }
                    };
                    let mesh = Arc::clone(self);
                    tokio::spawn(async move {
                        mesh.handle_inbound(stream, addr.to_string()).await;
                    });
                }
                _ = cancel.cancelled() => {
                    info!("[peer-mesh] inbound listener stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, address: String) {
        if self.peer_count() >= self.max_peers {
            debug!("[peer-mesh] rejecting {address}: mesh at capacity");
            return;
        }

        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        let read_result =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_line(&mut line)).await;
        let Ok(Ok(_)) = read_result else {
            debug!("[peer-mesh] {address} handshake read failed or timed out");
            return;
        };

        let Ok(peer_frame) = serde_json::from_str::<PeerHandshake>(line.trim_end()) else {
            debug!("[peer-mesh] {address} sent an unparseable handshake frame");
            return;
        };

        if !handshake::verify(&self.peer_secret, &peer_frame, now_unix()) {
            debug!("[peer-mesh] {address} failed handshake verification");
            return;
        }

        let license_key = self.license_key.expose_as_string();
        let response = handshake::sign(&self.peer_secret, &license_key, now_unix());
        drop(license_key);
        let Ok(mut outbound) = serde_json::to_vec(&response) else {
            return;
        };
        outbound.push(b'\n');

        let write_result =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, writer.write_all(&outbound)).await;
        if !matches!(write_result, Ok(Ok(()))) {
            debug!("[peer-mesh] {address} handshake response write failed");
            return;
        }

        let conn = Arc::new(PeerConnection::new(address.clone(), writer));
        conn.mark_authenticated();
        self.insert(address.clone(), Arc::clone(&conn));
        info!("[peer-mesh] inbound peer {address} authenticated");

        self.run_gossip_read_loop(address, reader).await;
    }

    /// Reads newline-delimited `BlockMessage` frames from an authenticated
    /// peer and pushes genuinely new ones onto `relay_tx` (spec.md §4.4,
    /// §4.8) — the channel keeps this module decoupled from `fanout`,
    /// whose OnNewBlock hook is the actual consumer.
    async fn run_gossip_read_loop<R>(self: Arc<Self>, address: String, mut reader: BufReader<R>)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::time::timeout(
                GOSSIP_READ_TIMEOUT,
                read_bounded_line(&mut reader, &mut line, MAX_FRAME_BYTES),
            )
            .await;

            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("[peer-mesh] {address} read error: {e}");
                    break;
                }
                Err(_) => {
                    debug!("[peer-mesh] {address} gossip read timed out");
                    break;
                }
            };
            if n == 0 {
                debug!("[peer-mesh] {address} closed the connection");
                break;
            }

            let Ok(msg) = BlockMessage::from_line(line.trim_end()) else {
                debug!("[peer-mesh] {address} sent an unparseable frame");
                break;
            };
            if msg.kind != "block" || msg.protocol != PROTOCOL_VERSION {
                debug!("[peer-mesh] {address} sent an invalid frame kind/version");
                break;
            }
            let Some(ts) = msg.timestamp_secs() else {
                break;
            };
            if (now_unix() - ts).abs() > 60 {
                debug!("[peer-mesh] {address} sent a stale block ({ts})");
                continue;
            }

            // Early-exit on an obviously-already-relayed id; the
            // authoritative atomic record-and-gate is FanOut::on_new_block's
            // own SeenMessages check (spec.md §4.6 step 3) so a block is
            // still forwarded on to this node's own peers exactly once.
            if self.seen.contains(&msg.message_id) {
                continue;
            }
            self.relay_tx.send((msg, address.clone())).ok();
        }

        self.evict(&address);
    }
}

/// Reads one `\n`-terminated line, failing if more than `max_bytes` are
/// consumed before the newline (spec.md §4.4's 1 KiB frame cap).
async fn read_bounded_line<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    out: &mut String,
    max_bytes: usize,
) -> std::io::Result<usize> {
    let mut total = 0;
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Ok(total);
        }
        total += 1;
        if total > max_bytes {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"));
        }
        out.push(byte[0] as char);
        if byte[0] == b'\n' {
            return Ok(total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mesh_starts_with_no_peers() {
        let (relay_tx, _relay_rx) = tokio::sync::mpsc::unbounded_channel();
        let mesh = PeerMesh::new(
            vec![],
            50,
            SecureBytes::from_str("secret"),
            SecureBytes::from_str("license"),
            0,
            Arc::new(SeenMessages::new()),
            relay_tx,
        );
        assert_eq!(mesh.peer_count(), 0);
        assert!(mesh.authenticated_peers().is_empty());
    }

    // A PeerConnection is only ever inserted post-authentication in
    // production, so the "never authenticated" arm of should_evict only
    // matters for a future refactor that inserts before auth completes;
    // guard it directly here against a real loopback socket.
    #[tokio::test]
    async fn evicts_never_authenticated_peer_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_fut = TcpStream::connect(addr);
        let (accepted, client) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            client_fut
        );
        let client = client.unwrap();
        let (_, writer) = tokio::io::split(accepted);
        drop(client);

        let conn = PeerConnection::new("127.0.0.1:1".to_string(), writer);
        assert!(conn.should_evict(std::time::Instant::now()));
        conn.mark_authenticated();
        assert!(!conn.should_evict(std::time::Instant::now()));
    }
}
