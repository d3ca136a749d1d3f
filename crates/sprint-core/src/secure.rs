// Secured memory capability for secrets (license key, peer secret, RPC
// credentials). Modeled on the engine's `Zeroizing<String>` idiom in
// engine/providers/anthropic.rs, generalized into a reusable capability:
// the crate never stringifies a secret for logs, and no caller-visible
// copy outlives the scoped callback that requested it.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// A secret byte string that is zeroized on drop. Plain access is
/// intentionally not exposed; use `within_bytes` or one of the
/// higher-level helpers (`hmac_hex`, `basic_auth_header`).
#[derive(Clone)]
pub struct SecureBytes(Zeroizing<Vec<u8>>);

impl SecureBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    pub fn from_str(s: impl AsRef<str>) -> Self {
        Self::new(s.as_ref().as_bytes().to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Grant scoped access to the raw bytes. `f`'s return value must not
    /// retain a borrow; any owned copy `f` makes is the caller's
    /// responsibility to zero (prefer returning derived, non-secret data).
    pub fn within_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.0)
    }

    /// HMAC-SHA256 of `data`, keyed by these bytes, as lowercase hex.
    /// Used for the peer handshake signature (§4.5) and deterministic
    /// by construction: same key + payload always yields the same hex.
    pub fn hmac_hex(&self, data: &[u8]) -> String {
        self.within_bytes(|key| {
            let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            let bytes = mac.finalize().into_bytes();
            hex_encode(&bytes)
        })
    }

    /// Verify an HMAC-SHA256 hex digest against these bytes in constant time.
    pub fn verify_hmac_hex(&self, data: &[u8], signature_hex: &str) -> bool {
        let expected = self.hmac_hex(data);
        constant_time_eq(expected.as_bytes(), signature_hex.as_bytes())
    }

    /// Build an HTTP Basic auth header value for `user:password`, consuming
    /// both secrets only within this call.
    pub fn basic_auth_header(&self, password: &SecureBytes) -> String {
        self.within_bytes(|user| {
            password.within_bytes(|pass| {
                let mut raw = Vec::with_capacity(user.len() + 1 + pass.len());
                raw.extend_from_slice(user);
                raw.push(b':');
                raw.extend_from_slice(pass);
                let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &raw);
                format!("Basic {encoded}")
            })
        })
    }

    /// First 4 + `****` + last 4 bytes, interpreted as UTF-8 lossily.
    /// Strings shorter than 8 bytes become `****` (§6 masking rule).
    pub fn masked(&self) -> String {
        self.within_bytes(|bytes| mask_bytes(bytes))
    }

    /// Exposes these bytes as a UTF-8 string wrapped in `Zeroizing`, for
    /// call sites that need an owned `&str` (e.g. building one outbound
    /// handshake frame) but must not retain it. The returned value is
    /// zeroized when it drops at the end of the caller's own scope —
    /// never stash this in a struct field (§4.5: no long-lived copy of
    /// the license key outside `SecureBytes` itself).
    pub fn expose_as_string(&self) -> Zeroizing<String> {
        self.within_bytes(|bytes| Zeroizing::new(String::from_utf8_lossy(bytes).into_owned()))
    }
}

impl std::fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecureBytes").field(&self.masked()).finish()
    }
}

fn mask_bytes(bytes: &[u8]) -> String {
    if bytes.len() < 8 {
        return "****".to_string();
    }
    let head = String::from_utf8_lossy(&bytes[..4]);
    let tail = String::from_utf8_lossy(&bytes[bytes.len() - 4..]);
    format!("{head}****{tail}")
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").expect("writing to String cannot fail");
    }
    s
}

/// Constant-time byte comparison to avoid timing side channels on
/// handshake signature verification.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_keys() {
        let k = SecureBytes::from_str("sprint-license-abcdef123456");
        assert_eq!(k.masked(), "spri****3456");
    }

    #[test]
    fn masks_short_keys_fully() {
        let k = SecureBytes::from_str("short");
        assert_eq!(k.masked(), "****");
    }

    #[test]
    fn hmac_is_deterministic() {
        let key = SecureBytes::from_str("peer-secret");
        let a = key.hmac_hex(b"payload");
        let b = key.hmac_hex(b"payload");
        assert_eq!(a, b);
    }

    #[test]
    fn hmac_verifies_round_trip() {
        let key = SecureBytes::from_str("peer-secret");
        let sig = key.hmac_hex(b"license||1700000000");
        assert!(key.verify_hmac_hex(b"license||1700000000", &sig));
        assert!(!key.verify_hmac_hex(b"license||1700000001", &sig));
    }

    #[test]
    fn basic_auth_header_encodes_user_pass() {
        let user = SecureBytes::from_str("alice");
        let pass = SecureBytes::from_str("hunter2");
        let header = user.basic_auth_header(&pass);
        assert!(header.starts_with("Basic "));
    }
}
