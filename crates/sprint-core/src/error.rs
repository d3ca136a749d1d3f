// Core error types.
//
// Design rules (carried from the engine's error module):
//   • Variants are coarse-grained by failure domain, matching the error
//     kinds the spec defines (TransientNetwork, ProtocolViolation, ...).
//   • `#[from]` wires std/external error conversions automatically.
//   • No variant carries secret material (license keys, peer secrets,
//     RPC credentials) in its message — callers must mask first.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SprintError {
    /// Connect/read/write timeout or reset. Fed to the circuit breaker,
    /// retried per-component policy.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Bad JSON, wrong protocol version, signature mismatch, stale
    /// timestamp. Connection is closed; never retried.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Local rate limit exceeded. Never fatal; callers map this to 429.
    #[error("rate limited")]
    RateLimited,

    /// `blocks_sent` has reached the tier's effective limit.
    #[error("license block-send limit exceeded")]
    LicenseExceeded,

    /// Circuit breaker is open; caller should back off.
    #[error("circuit open")]
    CircuitOpen,

    /// Configuration validation failure at startup. Aborts the process.
    #[error("fatal configuration error: {0}")]
    Fatal(String),

    /// Malformed HTTP request line or headers.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No route matches the requested method/path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Requested data does not exist yet (e.g. no block observed).
    #[error("no data: {0}")]
    NoData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Catch-all for errors without a dedicated variant yet.
    #[error("{0}")]
    Other(String),
}

impl SprintError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// HTTP status code for the `/api` JSON problem body (§6).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::RateLimited => 429,
            Self::NoData(_) | Self::CircuitOpen => 503,
            _ => 500,
        }
    }

    /// Stable machine-readable tag used in JSON problem bodies (§6).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientNetwork(_) => "transient_network",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::RateLimited => "rate_limited",
            Self::LicenseExceeded => "license_exceeded",
            Self::CircuitOpen => "circuit_open",
            Self::Fatal(_) => "fatal",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::NoData(_) => "no_data",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Http(_) => "http",
            Self::Other(_) => "other",
        }
    }
}

pub type SprintResult<T> = Result<T, SprintError>;
