use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors surfaced while constructing or running the bridge.
///
/// Variants map onto the stable error *kinds* from the bridge's error-handling
/// design: each kind keeps a fixed name (see [`BridgeError::kind`]) so callers
/// downstream of the response envelope can match on it even as messages change.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown server `{0}`")]
    UnknownServer(String),

    #[error("downstream server `{server}` is unavailable: {reason}")]
    DownstreamUnavailable { server: String, reason: String },

    #[error("downstream server `{server}` returned an error ({code}): {message}")]
    DownstreamError {
        server: String,
        code: i64,
        message: String,
    },

    #[error("sandbox invocation exceeded its {timeout:?} deadline")]
    SandboxTimeout { timeout: Duration },

    #[error("sandbox exited without a `done` frame: {stderr}")]
    SandboxCrash { stderr: String },

    #[error("no container runtime is available: {0}")]
    RuntimeUnavailable(String),

    #[error("malformed frame from sandbox: {0}")]
    ProtocolError(String),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to join task: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to load config at `{path}`: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// The stable, surface-visible name for this error's class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownServer(_) => "unknown_server",
            Self::DownstreamUnavailable { .. } => "downstream_unavailable",
            Self::DownstreamError { .. } => "downstream_error",
            Self::SandboxTimeout { .. } => "sandbox_timeout",
            Self::SandboxCrash { .. } => "sandbox_crash",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::ProtocolError(_) => "protocol_error",
            Self::Spawn { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Join(_)
            | Self::Config { .. }
            | Self::Internal(_) => "internal",
        }
    }
}
