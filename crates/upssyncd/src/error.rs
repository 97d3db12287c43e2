//! Error types for upssyncd
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with endpoint context
//! - AU-3: Content of Audit Records - Errors carry endpoint and phase

use thiserror::Error;

/// UPS synchronization daemon errors
#[derive(Error, Debug)]
pub enum UpssyncError {
    /// NIS frame could not be decoded (bad length prefix or record shape)
    #[error("Malformed NIS frame: {0}")]
    MalformedFrame(String),

    /// TCP connection to an apcupsd endpoint failed
    #[error("Connection error to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// A request/response exchange exceeded its deadline
    #[error("Timeout talking to {endpoint} during {phase}")]
    Timeout {
        endpoint: String,
        phase: &'static str,
    },

    /// Request issued on a client that holds no connection
    #[error("Not connected to {0}")]
    NotConnected(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// State store rejected an operation
    #[error("State store error: {0}")]
    Store(String),

    /// Redis backend error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON (de)serialization of stored values or metadata
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persistent connection could not be re-established
    #[error("Maximum number of reconnect attempts reached for {endpoint}: {attempts}")]
    ReconnectExhausted { endpoint: String, attempts: u32 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpssyncError {
    /// Failure scoped to a single NIS call; the scheduler absorbs these.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpssyncError::MalformedFrame(_)
                | UpssyncError::Connection { .. }
                | UpssyncError::Timeout { .. }
                | UpssyncError::NotConnected(_)
        )
    }

    /// Conditions that stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UpssyncError::Configuration(_) | UpssyncError::ReconnectExhausted { .. }
        )
    }
}

/// Result type for upssyncd operations
pub type Result<T> = std::result::Result<T, UpssyncError>;
