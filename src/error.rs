//! Error taxonomy shared by the gate, the tool handlers, and both transports.
//!
//! Gate errors surface as JSON-RPC `error` objects; tool-level domain errors
//! surface as tool results with `isError: true`. Retrieval internals never
//! propagate errors out of a handler — they degrade to empty results and log.

use thiserror::Error;

pub const UPGRADE_URL: &str = "https://midos.dev/pricing";
pub const KEYS_URL: &str = "https://midos.dev/keys";

#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed JSON-RPC, unknown tool, schema violation, URL validation failure.
    #[error("{0}")]
    InvalidArgument(String),

    /// Key format wrong, unknown key, revoked key.
    #[error("{0}")]
    AuthInvalid(String),

    /// Tool requires a higher tier than the caller holds.
    #[error("{0}")]
    TierForbidden(String),

    /// Monthly quota exhausted.
    #[error("Rate limit exceeded: {count}/{limit} queries this month. Upgrade your tier at https://midos.dev/pricing")]
    QuotaExceeded { count: u64, limit: u64 },

    /// Named document (skill/protocol/eureka/truth) does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Partial result (e.g. semantic search falling back to keyword-only).
    #[error("{0}")]
    Degraded(String),

    /// Unexpected failure in a dependency. Always logged at the raise site.
    #[error("{0}")]
    Internal(String),
}

impl ServerError {
    /// JSON-RPC error code for errors raised at the dispatcher boundary.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            ServerError::InvalidArgument(_) => -32602,
            ServerError::AuthInvalid(_) => -32001,
            ServerError::TierForbidden(_) => -32003,
            ServerError::QuotaExceeded { .. } => -32004,
            ServerError::NotFound(_) => -32005,
            ServerError::Degraded(_) => -32006,
            ServerError::Internal(_) => -32603,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ServerError::InvalidArgument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ServerError::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
