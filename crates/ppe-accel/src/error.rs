//! Error types for PPE acceleration

use thiserror::Error;

use crate::hal::HwStatus;

/// Acceleration error type
#[derive(Error, Debug)]
pub enum AccelError {
    /// Offload engine rejected a table programming call
    #[error("hardware {op} failed: {status}")]
    Hardware {
        /// Hardware operation that failed
        op: &'static str,
        /// Status code returned by the engine
        #[source]
        status: HwStatus,
    },

    /// Prefix table index outside the engine's capacity
    #[error("prefix index {0} out of range")]
    PrefixIndexOutOfRange(u32),

    /// IID table index outside the engine's capacity
    #[error("IID index {0} out of range")]
    IidIndexOutOfRange(u32),

    /// Prefix value or length not a valid IPv6 prefix
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    /// Completion arrived after the pending deadline force-resolved the attempt
    #[error("pending acceleration for {0} expired before completion")]
    PendingExpired(crate::connection::ConnectionId),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AccelError {
    pub(crate) fn hw(op: &'static str, status: HwStatus) -> Self {
        Self::Hardware { op, status }
    }

    /// Hardware status code, if this error came from the engine
    pub fn hw_status(&self) -> Option<HwStatus> {
        match self {
            Self::Hardware { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for PPE acceleration
pub type Result<T> = std::result::Result<T, AccelError>;
