//! Core traits for window state.

use async_trait::async_trait;
use bytes::Bytes;
use confluence_core::PartitionId;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::StateResult;

// ============================================================================
// Trait Bound
// ============================================================================

/// Trait bound for types that can be stored as state values.
pub trait StateValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> StateValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

// ============================================================================
// Codec
// ============================================================================

/// Byte-exact encode/decode pair for stored values.
pub trait StateCodec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> StateResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> StateResult<T>;
}

// ============================================================================
// State Log
// ============================================================================

/// One mutation in a state log. A missing value is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl LogRecord {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn tombstone(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Durable, ordered, replayable log of state mutations, partitioned like the
/// source it backs.
///
/// A partition is written by exactly one worker at a time; ownership is
/// enforced outside this crate.
#[async_trait]
pub trait StateLog: Send + Sync + 'static {
    /// Append a mutation. Returns once the log has acknowledged it.
    async fn append(&self, partition: &PartitionId, record: LogRecord) -> StateResult<()>;

    /// Read back every mutation of a partition in append order.
    async fn replay(&self, partition: &PartitionId) -> StateResult<Vec<LogRecord>>;

    /// Get the name of this log implementation.
    fn name(&self) -> &'static str;
}
