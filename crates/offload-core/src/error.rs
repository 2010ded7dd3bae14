//! Error types for the offload runtime.
//!
//! Every failure in the runtime is fatal for the process that observes it,
//! with one exception: the peer closing its end of a session is a normal
//! terminal transition and maps to exit code 0.

use thiserror::Error;
use tracing::{error, info};

/// Main error type for the offload runtime.
#[derive(Debug, Error)]
pub enum OffloadError {
    // Signature and type errors
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Malformed signature '{token}': {message}")]
    MalformedSignature { token: String, message: String },

    #[error("Pointer argument {index} is not followed by an integer element count")]
    MissingElementCount { index: usize },

    #[error("Argument mismatch: {message}")]
    ArgumentMismatch { message: String },

    // Dispatch errors
    #[error("Function not found in module: {0}")]
    FunctionNotFound(String),

    #[error("Module rejected: {message}")]
    ModuleRejected { message: String },

    #[error("Backend failed to execute {function}: {message}")]
    Backend { function: String, message: String },

    // Wire and transport errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Peer closed the session")]
    PeerClosed,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias using OffloadError.
pub type Result<T> = std::result::Result<T, OffloadError>;

impl From<std::io::Error> for OffloadError {
    fn from(err: std::io::Error) -> Self {
        OffloadError::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for OffloadError {
    fn from(err: serde_json::Error) -> Self {
        OffloadError::Other(format!("JSON error: {}", err))
    }
}

#[cfg(unix)]
impl From<nix::Error> for OffloadError {
    fn from(err: nix::Error) -> Self {
        OffloadError::Transport {
            message: err.desc().to_string(),
            source: Some(std::io::Error::from(err)),
        }
    }
}

impl OffloadError {
    /// Build a protocol error from any displayable message.
    pub fn protocol(message: impl Into<String>) -> Self {
        OffloadError::Protocol {
            message: message.into(),
        }
    }

    /// Build an argument mismatch error.
    pub fn argument(message: impl Into<String>) -> Self {
        OffloadError::ArgumentMismatch {
            message: message.into(),
        }
    }

    /// Build a transport error wrapping an OS error.
    pub fn transport(message: impl Into<String>, source: std::io::Error) -> Self {
        OffloadError::Transport {
            message: message.into(),
            source: Some(source),
        }
    }

    /// True when the error is the normal end of a session.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, OffloadError::PeerClosed)
    }

    /// Process exit code for this error under the fail-fast policy.
    pub fn exit_code(&self) -> i32 {
        if self.is_peer_closed() {
            0
        } else {
            1
        }
    }
}

/// Terminate the process according to the fail-fast policy.
///
/// Peer-closed exits quietly with status 0; every other error is logged with
/// the runtime prefix and exits with status 1.
pub fn exit_on_fatal(err: &OffloadError) -> ! {
    if err.is_peer_closed() {
        info!("offload: peer closed the session, exiting");
    } else {
        error!("offload: {}", err);
    }
    std::process::exit(err.exit_code())
}
