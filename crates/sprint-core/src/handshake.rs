// Peer handshake (spec.md §4.5). Signature = HMAC-SHA256 of
// `license_key || decimal(timestamp)` keyed by the shared peer secret,
// held in `SecureBytes`. Accepted iff the signature verifies and
// `|now - timestamp| <= 30s`.

use crate::secure::SecureBytes;
use crate::wire::PeerHandshake;

pub const MAX_CLOCK_SKEW_SECS: i64 = 30;

pub fn sign(peer_secret: &SecureBytes, license_key: &str, timestamp: i64) -> PeerHandshake {
    let payload = PeerHandshake::signing_payload(license_key, timestamp);
    let signature = peer_secret.hmac_hex(&payload);
    PeerHandshake {
        license_key: license_key.to_string(),
        timestamp,
        signature,
    }
}

/// Verifies a received handshake frame against the shared peer secret
/// and the clock-skew bound. Rejects without revealing *why* beyond a
/// boolean — callers close the socket silently on `false` (spec.md §7:
/// peer protocol violations yield silent disconnection).
pub fn verify(peer_secret: &SecureBytes, frame: &PeerHandshake, now: i64) -> bool {
    let payload = PeerHandshake::signing_payload(&frame.license_key, frame.timestamp);
    if !peer_secret.verify_hmac_hex(&payload, &frame.signature) {
        return false;
    }
    (now - frame.timestamp).abs() <= MAX_CLOCK_SKEW_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_fresh_valid_signature() {
        let secret = SecureBytes::from_str("peer-secret");
        let now = 1_700_000_000;
        let frame = sign(&secret, "license-abc", now);
        assert!(verify(&secret, &frame, now));
    }

    #[test]
    fn s3_rejects_stale_timestamp() {
        let secret = SecureBytes::from_str("peer-secret");
        let now = 1_700_000_000;
        let frame = sign(&secret, "license-abc", now - 31);
        assert!(!verify(&secret, &frame, now));
    }

    #[test]
    fn accepts_boundary_skew() {
        let secret = SecureBytes::from_str("peer-secret");
        let now = 1_700_000_000;
        let frame = sign(&secret, "license-abc", now - 30);
        assert!(verify(&secret, &frame, now));
    }

    #[test]
    fn rejects_wrong_secret() {
        let secret = SecureBytes::from_str("peer-secret");
        let other = SecureBytes::from_str("different-secret");
        let now = 1_700_000_000;
        let frame = sign(&secret, "license-abc", now);
        assert!(!verify(&other, &frame, now));
    }

    #[test]
    fn rejects_tampered_license_key() {
        let secret = SecureBytes::from_str("peer-secret");
        let now = 1_700_000_000;
        let mut frame = sign(&secret, "license-abc", now);
        frame.license_key = "license-xyz".to_string();
        assert!(!verify(&secret, &frame, now));
    }
}
