// Wire formats (spec.md §3, §6): the block announcement frame exchanged
// between peers, the handshake frame, and the upstream JSON-RPC envelope.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 2;
pub const MAX_FRAME_BYTES: usize = 1024;

/// One newline-delimited JSON block announcement frame (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub hash: String,
    /// Decimal unix seconds, transmitted as a string per §6's wire format.
    pub ts: String,
    pub version: String,
    pub protocol: u32,
    pub message_id: String,
}

impl BlockMessage {
    pub fn new(hash: impl Into<String>, timestamp_secs: i64, message_id: impl Into<String>) -> Self {
        Self {
            kind: "block".to_string(),
            hash: hash.into(),
            ts: timestamp_secs.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
            message_id: message_id.into(),
        }
    }

    pub fn timestamp_secs(&self) -> Option<i64> {
        self.ts.parse().ok()
    }

    pub fn to_frame(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// `{license_key, timestamp, signature}` handshake frame (spec.md §3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHandshake {
    pub license_key: String,
    pub timestamp: i64,
    pub signature: String,
}

impl PeerHandshake {
    /// The exact byte sequence that gets HMAC'd: `license_key || decimal(timestamp)`.
    pub fn signing_payload(license_key: &str, timestamp: i64) -> Vec<u8> {
        let mut payload = license_key.as_bytes().to_vec();
        payload.extend_from_slice(timestamp.to_string().as_bytes());
        payload
    }
}

/// Upstream JSON-RPC request envelope (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: &'static str,
    pub method: &'a str,
    pub params: [(); 0],
}

impl<'a> RpcRequest<'a> {
    pub fn new(method: &'a str) -> Self {
        Self {
            jsonrpc: "1.0",
            id: "sprint",
            method,
            params: [],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcEnvelope<T> {
    pub result: Option<T>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfoResult {
    pub bestblockhash: String,
    pub blocks: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MempoolInfoResult {
    pub size: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_message_round_trips() {
        let msg = BlockMessage::new("a".repeat(64), 1_700_000_000, "deadbeef");
        let frame = msg.to_frame().unwrap();
        let line = std::str::from_utf8(&frame).unwrap();
        let parsed = BlockMessage::from_line(line.trim_end()).unwrap();
        assert_eq!(msg, parsed);
        assert_eq!(parsed.protocol, PROTOCOL_VERSION);
    }

    #[test]
    fn handshake_signing_payload_is_concatenation() {
        let payload = PeerHandshake::signing_payload("lic-123", 42);
        assert_eq!(payload, b"lic-12342");
    }

    #[test]
    fn rpc_request_matches_wire_shape() {
        let req = RpcRequest::new("getblockchaininfo");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "1.0");
        assert_eq!(json["id"], "sprint");
        assert_eq!(json["method"], "getblockchaininfo");
        assert_eq!(json["params"], serde_json::json!([]));
    }

    #[test]
    fn rejects_oversized_frame() {
        let huge_hash = "a".repeat(MAX_FRAME_BYTES);
        let msg = BlockMessage::new(huge_hash, 0, "id");
        let frame = msg.to_frame().unwrap();
        assert!(frame.len() > MAX_FRAME_BYTES);
    }
}
