// Layered configuration: environment variables (authoritative) with an
// optional TOML file supplying defaults. Resolves spec.md §9's "multiple
// parallel Config definitions" open question — see DESIGN.md.

use crate::secure::SecureBytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    FileParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Business,
    Turbo,
    Enterprise,
}

impl Tier {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "pro" => Some(Self::Pro),
            "business" => Some(Self::Business),
            "turbo" => Some(Self::Turbo),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    /// Whether this tier enables parallel RPC racing, larger fan-out
    /// concurrency, multiplied rate limits, and tighter write deadlines.
    pub fn is_turbo(&self) -> bool {
        matches!(self, Tier::Turbo)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcEndpointConfig {
    pub url: String,
}

/// Raw shape of the optional TOML defaults file. All fields optional —
/// anything unset falls back to the hardcoded default, then any
/// environment variable of the same name overrides it.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    tier: Option<String>,
    peer_listen_port: Option<u16>,
    rpc_endpoints: Option<Vec<String>>,
    peer_addresses: Option<Vec<String>>,
    api_bind_addr: Option<String>,
    api_port: Option<u16>,
    metrics_endpoint: Option<String>,
    poll_interval_secs: Option<u64>,
    turbo: Option<bool>,
    max_peers: Option<usize>,
    log_level: Option<String>,
    network_label: Option<String>,
    rate_limits: Option<HashMap<String, f64>>,
}

#[derive(Clone)]
pub struct SprintConfig {
    pub tier: Tier,
    pub peer_listen_port: u16,
    pub rpc_endpoints: Vec<RpcEndpointConfig>,
    pub license_key: SecureBytes,
    pub rpc_user: SecureBytes,
    pub rpc_password: SecureBytes,
    pub peer_secret: SecureBytes,
    pub api_bind_addr: String,
    pub api_port: u16,
    pub metrics_endpoint: Option<String>,
    pub poll_interval_secs: u64,
    pub turbo: bool,
    pub max_peers: usize,
    pub log_level: String,
    pub rate_limits: HashMap<String, f64>,
    pub peer_addresses: Vec<String>,
    pub network_label: String,
}

impl SprintConfig {
    /// Load configuration from environment variables, optionally layered
    /// over a TOML file named by `SPRINT_CONFIG_FILE`. Validates at the
    /// end; any failure here is a `Fatal` startup error (spec.md §7).
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = load_file_config()?;

        let tier_str = env_or(file.tier, "SPRINT_TIER", "free");
        let tier = Tier::parse(&tier_str).ok_or_else(|| ConfigError::Invalid {
            field: "SPRINT_TIER",
            reason: format!("unknown tier '{tier_str}'"),
        })?;

        let peer_listen_port: u16 = env_or_num(file.peer_listen_port, "SPRINT_PEER_PORT", 8333)?;

        let rpc_endpoints_raw = env_list("SPRINT_RPC_ENDPOINTS").or(file.rpc_endpoints);
        let rpc_endpoints = match rpc_endpoints_raw {
            Some(urls) if !urls.is_empty() => urls
                .into_iter()
                .map(|url| validate_rpc_url(&url).map(|_| RpcEndpointConfig { url }))
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(ConfigError::Missing("SPRINT_RPC_ENDPOINTS")),
        };

        let license_key_raw = env::var("SPRINT_LICENSE_KEY").unwrap_or_default();
        if license_key_raw.is_empty() {
            return Err(ConfigError::Missing("SPRINT_LICENSE_KEY"));
        }

        let peer_secret_raw = env::var("SPRINT_PEER_SECRET").unwrap_or_default();
        if peer_secret_raw.is_empty() {
            return Err(ConfigError::Missing("SPRINT_PEER_SECRET"));
        }

        let rpc_user = SecureBytes::from_str(env::var("SPRINT_RPC_USER").unwrap_or_default());
        let rpc_password =
            SecureBytes::from_str(env::var("SPRINT_RPC_PASSWORD").unwrap_or_default());

        let api_bind_addr = env_or(file.api_bind_addr, "SPRINT_API_BIND", "0.0.0.0");
        let api_port: u16 = env_or_num(file.api_port, "SPRINT_API_PORT", 8080)?;
        let metrics_endpoint = env::var("SPRINT_METRICS_ENDPOINT").ok().or(file.metrics_endpoint);
        let poll_interval_secs: u64 =
            env_or_num(file.poll_interval_secs, "SPRINT_POLL_INTERVAL_SECS", 5)?;
        let turbo = env_or_bool(file.turbo, "SPRINT_TURBO", tier.is_turbo());
        let max_peers: usize = env_or_num(file.max_peers, "SPRINT_MAX_PEERS", 50)?;
        let log_level = env_or(file.log_level, "SPRINT_LOG_LEVEL", "info");
        let network_label = env_or(file.network_label, "SPRINT_NETWORK", "bitcoin");
        let peer_addresses = env_list("SPRINT_PEER_ADDRESSES")
            .or(file.peer_addresses)
            .unwrap_or_default();

        let mut rate_limits = file.rate_limits.unwrap_or_default();
        for (endpoint, default) in default_rate_limits() {
            rate_limits.entry(endpoint.to_string()).or_insert(default);
            let env_key = format!("SPRINT_RATE_LIMIT_{}", endpoint.trim_start_matches('/').to_uppercase());
            if let Ok(v) = env::var(&env_key) {
                if let Ok(parsed) = v.parse::<f64>() {
                    rate_limits.insert(endpoint.to_string(), parsed);
                }
            }
        }

        Ok(SprintConfig {
            tier,
            peer_listen_port,
            rpc_endpoints,
            license_key: SecureBytes::from_str(license_key_raw),
            rpc_user,
            rpc_password,
            peer_secret: SecureBytes::from_str(peer_secret_raw),
            api_bind_addr,
            api_port,
            metrics_endpoint,
            poll_interval_secs,
            turbo,
            max_peers,
            log_level,
            rate_limits,
            peer_addresses,
            network_label,
        })
    }

    /// A redacted summary suitable for `sprint check-config` / startup logs.
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "tier": format!("{:?}", self.tier),
            "peer_listen_port": self.peer_listen_port,
            "rpc_endpoints": self.rpc_endpoints.iter().map(|e| &e.url).collect::<Vec<_>>(),
            "license_key": self.license_key.masked(),
            "api_bind_addr": self.api_bind_addr,
            "api_port": self.api_port,
            "poll_interval_secs": self.poll_interval_secs,
            "turbo": self.turbo,
            "max_peers": self.max_peers,
            "network": self.network_label,
        })
    }
}

pub fn default_rate_limits() -> Vec<(&'static str, f64)> {
    vec![
        ("/latest", 4.0),
        ("/metrics", 2.0),
        ("/status", 1.0),
        ("/predictive", 2.0),
        ("/stream", 1.0),
    ]
}

fn validate_rpc_url(url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field: "SPRINT_RPC_ENDPOINTS",
            reason: format!("'{url}' must start with http:// or https://"),
        })
    }
}

fn load_file_config() -> Result<FileConfig, ConfigError> {
    let Ok(path) = env::var("SPRINT_CONFIG_FILE") else {
        return Ok(FileConfig::default());
    };
    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::FileParse { path, source })
}

fn env_or(file_value: Option<String>, key: &str, default: &str) -> String {
    env::var(key).ok().or(file_value).unwrap_or_else(|| default.to_string())
}

fn env_or_num<T: std::str::FromStr>(
    file_value: Option<T>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    if let Ok(v) = env::var(key) {
        return v.parse().map_err(|_| ConfigError::Invalid {
            field: "env",
            reason: format!("{key} is not a valid number"),
        });
    }
    Ok(file_value.unwrap_or(default))
}

fn env_or_bool(file_value: Option<bool>, key: &str, default: bool) -> bool {
    if let Ok(v) = env::var(key) {
        return matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
    file_value.unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_rpc_url() {
        assert!(validate_rpc_url("ftp://node:8332").is_err());
        assert!(validate_rpc_url("http://node:8332").is_ok());
        assert!(validate_rpc_url("https://node:8332").is_ok());
    }

    #[test]
    fn default_rate_limits_cover_every_documented_endpoint() {
        let limits: HashMap<_, _> = default_rate_limits().into_iter().collect();
        assert_eq!(limits["/latest"], 4.0);
        assert_eq!(limits["/metrics"], 2.0);
        assert_eq!(limits["/status"], 1.0);
        assert_eq!(limits["/predictive"], 2.0);
        assert_eq!(limits["/stream"], 1.0);
    }

    #[test]
    fn tier_parse_is_case_insensitive() {
        assert_eq!(Tier::parse("TURBO"), Some(Tier::Turbo));
        assert_eq!(Tier::parse("bogus"), None);
    }
}
