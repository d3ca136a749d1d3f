// License guard (spec.md §4.9): local-state validation, remote revalidation,
// and the hourly reset/revalidate tick. Grounded on the teacher's provider
// clients (engine/providers/anthropic.rs) for the "Zeroizing key + reqwest
// client with a fixed budget" shape, and on config.rs for file I/O.

use crate::cancel::CancelToken;
use crate::secure::SecureBytes;
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const REMOTE_BUDGET: Duration = Duration::from_secs(5);
const TICK_INTERVAL: Duration = Duration::from_secs(3600);
const DAILY_RESET_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const REVALIDATE_WINDOW: Duration = Duration::from_secs(24 * 3600);

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    license_key: String,
    expires_at: i64,
    daily_reset_at: i64,
    valid: bool,
}

#[derive(Debug, Clone)]
pub struct LicenseState {
    pub valid: bool,
    pub expires_at: i64,
    pub daily_reset_at: i64,
}

/// Validates and tracks a license key, persisting state to disk so
/// short-lived restarts don't require an immediate remote round-trip.
pub struct LicenseGuard {
    license_key: SecureBytes,
    remote_endpoint: Option<String>,
    client: reqwest::Client,
    state_path: PathBuf,
    state: RwLock<LicenseState>,
    blocks_sent_today: AtomicU64,
}

impl LicenseGuard {
    pub fn new(license_key: SecureBytes, remote_endpoint: Option<String>, state_path: PathBuf) -> Self {
        let state = load_persisted(&state_path, &license_key)
            .unwrap_or(LicenseState { valid: false, expires_at: 0, daily_reset_at: now_unix() });
        Self {
            license_key,
            remote_endpoint,
            client: reqwest::Client::builder()
                .timeout(REMOTE_BUDGET)
                .build()
                .expect("reqwest client with a fixed timeout always builds"),
            state_path,
            state: RwLock::new(state),
            blocks_sent_today: AtomicU64::new(0),
        }
    }

    pub fn is_valid(&self) -> bool {
        let state = self.state.read();
        state.valid && state.expires_at > now_unix()
    }

    pub fn blocks_sent_today(&self) -> u64 {
        self.blocks_sent_today.load(Ordering::Relaxed)
    }

    pub fn record_block_sent(&self) {
        self.blocks_sent_today.fetch_add(1, Ordering::Relaxed);
    }

    /// Validates via local persisted state if still fresh; otherwise
    /// falls back to a remote call (spec.md §4.9 (a)/(b)).
    pub async fn ensure_valid(&self) -> bool {
        if self.is_valid() {
            return true;
        }
        self.revalidate_remote().await
    }

    async fn revalidate_remote(&self) -> bool {
        let Some(endpoint) = &self.remote_endpoint else {
            warn!("[license] no remote endpoint configured, cannot revalidate");
            return false;
        };

        let key = self.license_key.within_bytes(|bytes| String::from_utf8_lossy(bytes).into_owned());
        let result = self
            .client
            .post(endpoint)
            .json(&serde_json::json!({ "license_key": key }))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => match resp.json::<RemoteLicenseResponse>().await {
                Ok(body) => {
                    let mut state = self.state.write();
                    state.valid = body.valid;
                    state.expires_at = body.expires_at;
                    drop(state);
                    self.persist();
                    info!("[license] remote validation succeeded, expires_at={}", body.expires_at);
                    body.valid
                }
                Err(e) => {
                    warn!("[license] remote response decode failed: {e}");
                    false
                }
            },
            Ok(resp) => {
                warn!("[license] remote validation rejected with status {}", resp.status());
                false
            }
            Err(e) => {
                warn!("[license] remote validation request failed: {e}");
                false
            }
        }
    }

    async fn reset_daily_counter(&self) {
        if let Some(endpoint) = &self.remote_endpoint {
            let reset_url = format!("{endpoint}/reset");
            let key = self.license_key.within_bytes(|bytes| String::from_utf8_lossy(bytes).into_owned());
            let _ = self
                .client
                .post(&reset_url)
                .json(&serde_json::json!({ "license_key": key }))
                .send()
                .await;
        }
        self.blocks_sent_today.store(0, Ordering::Relaxed);
        let mut state = self.state.write();
        state.daily_reset_at = now_unix();
        drop(state);
        self.persist();
        info!("[license] daily block counter reset");
    }

    fn persist(&self) {
        let state = self.state.read();
        let key = self.license_key.within_bytes(|bytes| String::from_utf8_lossy(bytes).into_owned());
        let persisted = PersistedState {
            license_key: key,
            expires_at: state.expires_at,
            daily_reset_at: state.daily_reset_at,
            valid: state.valid,
        };
        drop(state);

        let Ok(json) = serde_json::to_string(&persisted) else {
            return;
        };
        if let Err(e) = write_state_file(&self.state_path, &json) {
            warn!("[license] failed to persist license state: {e}");
        }
    }

    /// Hourly tick: resets the daily counter if 24h have elapsed, and
    /// revalidates remotely if the license is within 24h of expiry
    /// (spec.md §4.9).
    pub async fn run_hourly_tick(&self, cancel: CancelToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    info!("[license] hourly tick stopping");
                    return;
                }
            }

            let now = now_unix();
            let daily_reset_at = self.state.read().daily_reset_at;
            if Duration::from_secs((now - daily_reset_at).max(0) as u64) >= DAILY_RESET_INTERVAL {
                self.reset_daily_counter().await;
            }

            let expires_at = self.state.read().expires_at;
            if Duration::from_secs((expires_at - now).max(0) as u64) <= REVALIDATE_WINDOW {
                self.revalidate_remote().await;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteLicenseResponse {
    valid: bool,
    expires_at: i64,
}

fn load_persisted(path: &PathBuf, expected_key: &SecureBytes) -> Option<LicenseState> {
    let contents = std::fs::read_to_string(path).ok()?;
    let persisted: PersistedState = serde_json::from_str(&contents).ok()?;
    let matches_key = expected_key.within_bytes(|bytes| bytes == persisted.license_key.as_bytes());
    if !matches_key {
        return None;
    }
    Some(LicenseState {
        valid: persisted.valid,
        expires_at: persisted.expires_at,
        daily_reset_at: persisted.daily_reset_at,
    })
}

fn write_state_file(path: &PathBuf, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_state_file_is_not_valid() {
        let guard = LicenseGuard::new(
            SecureBytes::from_str("lic-abc"),
            None,
            PathBuf::from("/nonexistent/sprint-license-state-test.json"),
        );
        assert!(!guard.is_valid());
    }

    #[test]
    fn persisted_state_with_mismatched_key_is_ignored() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("sprint-license-test-{}.json", std::process::id()));
        let persisted = PersistedState {
            license_key: "other-key".to_string(),
            expires_at: now_unix() + 1000,
            daily_reset_at: now_unix(),
            valid: true,
        };
        std::fs::write(&path, serde_json::to_string(&persisted).unwrap()).unwrap();

        let guard = LicenseGuard::new(SecureBytes::from_str("lic-abc"), None, path.clone());
        assert!(!guard.is_valid());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn valid_persisted_state_with_matching_key_and_future_expiry_is_valid() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("sprint-license-test2-{}.json", std::process::id()));
        let persisted = PersistedState {
            license_key: "lic-abc".to_string(),
            expires_at: now_unix() + 1000,
            daily_reset_at: now_unix(),
            valid: true,
        };
        std::fs::write(&path, serde_json::to_string(&persisted).unwrap()).unwrap();

        let guard = LicenseGuard::new(SecureBytes::from_str("lic-abc"), None, path.clone());
        assert!(guard.is_valid());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn record_block_sent_increments_counter() {
        let guard = LicenseGuard::new(
            SecureBytes::from_str("lic-abc"),
            None,
            std::env::temp_dir().join("sprint-license-never-written.json"),
        );
        guard.record_block_sent();
        guard.record_block_sent();
        assert_eq!(guard.blocks_sent_today(), 2);
    }
}
