//! Error types for window state.

use confluence_core::PartitionId;

/// Errors raised by window stores and state logs.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// IO error while reading or writing a state log.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A key or value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A log record failed its checksum during replay.
    #[error("checksum mismatch at position {position} in {partition}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        partition: PartitionId,
        position: u64,
        expected: u32,
        actual: u32,
    },

    /// The store was read or written before its log was replayed.
    #[error("window store `{namespace}` used before replay")]
    NotReplayed { namespace: String },

    /// A key does not belong to the store's namespace.
    #[error("key of operator `{operator_name}` is outside store namespace `{namespace}`")]
    OutOfScope {
        operator_name: String,
        namespace: String,
    },
}

impl From<bincode::Error> for StateError {
    fn from(e: bincode::Error) -> Self {
        StateError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Codec(e.to_string())
    }
}

pub type StateResult<T> = std::result::Result<T, StateError>;
