//! The typed error surface for the proxy and worker.
//!
//! `ProxyError` is the caller-visible/internal taxonomy from the design
//! notes. Call sites that just need to propagate (CLI startup, task
//! bodies) wrap it in `anyhow::Error` instead of matching on it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Tenant header missing or not a well-formed UUID. Caller-visible.
    #[error("missing or malformed {header} header")]
    Unauthorized { header: &'static str },

    /// The RPC deadline elapsed before a reply arrived. Caller-visible.
    #[error("request timed out waiting for worker reply")]
    TimeoutException,

    /// The broker session is not `Ready`. Caller-visible.
    #[error("broker session is not connected")]
    NotConnected,

    /// Envelope failed to decode through the wire codec.
    #[error("failed to decode envelope: {0}")]
    DecodeError(String),

    /// Per-tenant schema lookup failed against the store.
    #[error("invalid schema for tenant {tenant_id}")]
    InvalidSchema { tenant_id: uuid::Uuid },

    /// Fatal at startup: one or more required broker env vars are unset.
    #[error("missing required environment variables: {0:?}")]
    MissingEnvironmentVariables(Vec<&'static str>),
}

/// `{kind, message, stack_text}` captured when a dispatch fails so the
/// failure can still be written to the persistence store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorCapture {
    pub kind: String,
    pub message: String,
    pub stack_text: String,
}

impl ErrorCapture {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            kind: classify(err),
            message: err.to_string(),
            stack_text: format!("{err:?}"),
        }
    }
}

fn classify(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<ProxyError>() {
        match e {
            ProxyError::Unauthorized { .. } => "Unauthorized",
            ProxyError::TimeoutException => "TimeoutException",
            ProxyError::NotConnected => "NotConnected",
            ProxyError::DecodeError(_) => "DecodeError",
            ProxyError::InvalidSchema { .. } => "InvalidSchema",
            ProxyError::MissingEnvironmentVariables(_) => "MissingEnvironmentVariables",
        }
        .to_string()
    } else {
        "Exception".to_string()
    }
}
