//! In-memory state log for development and testing.

use async_trait::async_trait;
use confluence_core::PartitionId;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::StateResult;
use crate::traits::{LogRecord, StateLog};

/// In-memory state log.
///
/// Records survive for as long as the log itself, so sharing one instance
/// through an `Arc` lets a test drop a store and replay it as a restarted
/// operator would.
pub struct MemoryStateLog {
    partitions: RwLock<HashMap<PartitionId, Vec<LogRecord>>>,
}

impl MemoryStateLog {
    /// Create a new, empty in-memory log.
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records appended to a partition, tombstones included.
    pub fn len(&self, partition: &PartitionId) -> usize {
        self.partitions
            .read()
            .get(partition)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, partition: &PartitionId) -> bool {
        self.len(partition) == 0
    }
}

impl Default for MemoryStateLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateLog for MemoryStateLog {
    async fn append(&self, partition: &PartitionId, record: LogRecord) -> StateResult<()> {
        self.partitions
            .write()
            .entry(partition.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn replay(&self, partition: &PartitionId) -> StateResult<Vec<LogRecord>> {
        Ok(self
            .partitions
            .read()
            .get(partition)
            .cloned()
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_log_keeps_partitions_apart() {
        let log = MemoryStateLog::new();
        let p0 = PartitionId::new("t-state", "b", 0);
        let p1 = PartitionId::new("t-state", "b", 1);

        log.append(&p0, LogRecord::put(&b"a"[..], &b"1"[..])).await.unwrap();
        log.append(&p0, LogRecord::tombstone(&b"a"[..])).await.unwrap();
        log.append(&p1, LogRecord::put(&b"b"[..], &b"2"[..])).await.unwrap();

        let records = log.replay(&p0).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[1].is_tombstone());
        assert_eq!(log.len(&p1), 1);
        assert!(log.is_empty(&PartitionId::new("t-state", "b", 2)));
    }
}
