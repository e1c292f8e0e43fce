//! Keyed, range-queryable window store backed by a replayable state log.

use confluence_core::{PartitionId, TimeWindow};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::codec::BincodeCodec;
use crate::error::{StateError, StateResult};
use crate::traits::{LogRecord, StateCodec, StateLog, StateValue};
use crate::window::{WindowKey, WindowState};

/// Window store for one operator namespace on one state partition.
///
/// Reads are served from an in-memory index ordered by [`WindowKey`]; every
/// mutation is appended to the [`StateLog`] before the index changes, so the
/// index can be rebuilt by [`WindowStore::wait_for_replay`] after a restart or
/// a partition reassignment.
///
/// Several stores may share one log partition (e.g. both sides of a join);
/// each only accepts and replays keys whose `operator_name` is its namespace
/// or extends it after an `@` (`join` owns `join@LEFT_STREAM`, but `clicks`
/// does not own `clicks-by-user`).
pub struct WindowStore<K, V, C = BincodeCodec> {
    log: Arc<dyn StateLog>,
    partition: PartitionId,
    namespace: String,
    codec: C,
    index: BTreeMap<WindowKey, WindowState<K, V>>,
    replayed: bool,
}

impl<K, V> WindowStore<K, V, BincodeCodec>
where
    K: StateValue,
    V: StateValue,
{
    /// Create a store using the default binary codec.
    ///
    /// # Arguments
    /// * `log` - Durable log shared by every store of the partition
    /// * `partition` - State partition the store appends to
    /// * `namespace` - Prefix of the operator names this store owns
    pub fn new(
        log: Arc<dyn StateLog>,
        partition: PartitionId,
        namespace: impl Into<String>,
    ) -> Self {
        Self::with_codec(log, partition, namespace, BincodeCodec)
    }
}

impl<K, V, C> WindowStore<K, V, C>
where
    K: StateValue,
    V: StateValue,
    C: StateCodec<WindowState<K, V>>,
{
    /// Create a store with a caller-supplied value codec.
    pub fn with_codec(
        log: Arc<dyn StateLog>,
        partition: PartitionId,
        namespace: impl Into<String>,
        codec: C,
    ) -> Self {
        Self {
            log,
            partition,
            namespace: namespace.into(),
            codec,
            index: BTreeMap::new(),
            replayed: false,
        }
    }

    /// Rebuild the index from the state log.
    ///
    /// Applies every record of the partition in order, tombstones included.
    /// On failure the index is left empty and the store stays unusable.
    /// Calling it again after success is a no-op. Returns the number of live
    /// entries.
    pub async fn wait_for_replay(&mut self) -> StateResult<usize> {
        if self.replayed {
            return Ok(self.index.len());
        }

        let records = self.log.replay(&self.partition).await?;
        let total = records.len();
        let mut index = BTreeMap::new();
        for record in records {
            let key = WindowKey::decode(&record.key)?;
            if !self.in_scope(&key) {
                continue;
            }
            match record.value {
                Some(bytes) => {
                    index.insert(key, self.codec.decode(&bytes)?);
                }
                None => {
                    index.remove(&key);
                }
            }
        }

        self.index = index;
        self.replayed = true;
        info!(
            namespace = %self.namespace,
            partition = %self.partition,
            log = self.log.name(),
            records = total,
            live = self.index.len(),
            "window store replayed"
        );
        Ok(self.index.len())
    }

    /// Insert or overwrite the state of a window entry.
    pub async fn put(&mut self, key: WindowKey, state: WindowState<K, V>) -> StateResult<()> {
        self.ensure_replayed()?;
        self.ensure_in_scope(&key)?;

        let value = self.codec.encode(&state)?;
        self.log
            .append(&self.partition, LogRecord::put(key.encode()?, value))
            .await?;
        self.index.insert(key, state);
        Ok(())
    }

    /// Look up a single entry.
    pub fn get(&self, key: &WindowKey) -> StateResult<Option<&WindowState<K, V>>> {
        self.ensure_replayed()?;
        Ok(self.index.get(key))
    }

    /// Every entry of `prefix.operator_name` with `window_end <= prefix.window_end`.
    ///
    /// The result is a snapshot, ordered by window end, then window start,
    /// then key.
    pub fn search_less_than_or_equal_watermark(
        &self,
        prefix: &WindowKey,
    ) -> StateResult<Vec<(WindowKey, WindowState<K, V>)>> {
        self.ensure_replayed()?;

        let lower = WindowKey::prefix(prefix.operator_name.clone(), 0);
        let found: Vec<_> = self
            .index
            .range(lower..)
            .take_while(|(k, _)| {
                k.operator_name == prefix.operator_name && k.window_end <= prefix.window_end
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        debug!(
            operator = %prefix.operator_name,
            watermark = prefix.window_end,
            found = found.len(),
            "window store searched"
        );
        Ok(found)
    }

    /// Remove an entry, appending a tombstone. Returns whether it existed.
    pub async fn delete_by_key(&mut self, key: &WindowKey) -> StateResult<bool> {
        self.ensure_replayed()?;
        if !self.index.contains_key(key) {
            return Ok(false);
        }

        self.log
            .append(&self.partition, LogRecord::tombstone(key.encode()?))
            .await?;
        self.index.remove(key);
        Ok(true)
    }

    /// Distinct windows holding state for `operator_name`.
    pub fn windows(&self, operator_name: &str) -> StateResult<BTreeSet<TimeWindow>> {
        self.ensure_replayed()?;
        Ok(self
            .index
            .keys()
            .filter(|k| k.operator_name == operator_name)
            .map(WindowKey::window)
            .collect())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    pub fn is_replayed(&self) -> bool {
        self.replayed
    }

    /// The namespace itself, or a name extending it after an `@`.
    fn in_scope(&self, key: &WindowKey) -> bool {
        match key.operator_name.strip_prefix(self.namespace.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('@'),
            None => false,
        }
    }

    fn ensure_in_scope(&self, key: &WindowKey) -> StateResult<()> {
        if self.in_scope(key) {
            Ok(())
        } else {
            Err(StateError::OutOfScope {
                operator_name: key.operator_name.clone(),
                namespace: self.namespace.clone(),
            })
        }
    }

    fn ensure_replayed(&self) -> StateResult<()> {
        if self.replayed {
            Ok(())
        } else {
            Err(StateError::NotReplayed {
                namespace: self.namespace.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::file::{FileStateLog, FileStateLogConfig};
    use crate::memory::MemoryStateLog;

    fn partition() -> PartitionId {
        PartitionId::new("orders", "broker-a", 0).state_partition()
    }

    async fn open_store(log: Arc<dyn StateLog>, ns: &str) -> WindowStore<String, i64> {
        let mut store = WindowStore::new(log, partition(), ns);
        store.wait_for_replay().await.unwrap();
        store
    }

    fn key(op: &str, k: &str, start: u64, end: u64) -> WindowKey {
        WindowKey::new(op, k, end, start)
    }

    #[tokio::test]
    async fn test_use_before_replay_is_rejected() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let mut store: WindowStore<String, i64> = WindowStore::new(log, partition(), "sum");
        let res = store
            .put(key("sum", "01", 0, 10), WindowState::new("a".into(), 1, 1))
            .await;
        assert!(matches!(res, Err(StateError::NotReplayed { .. })));
        assert!(store
            .search_less_than_or_equal_watermark(&WindowKey::prefix("sum", 10))
            .is_err());
    }

    #[tokio::test]
    async fn test_put_overwrites_same_key() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let mut store = open_store(log, "sum").await;
        let k = key("sum", "01", 0, 10);
        store.put(k.clone(), WindowState::new("a".into(), 1, 1)).await.unwrap();
        store.put(k.clone(), WindowState::new("a".into(), 5, 2)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&k).unwrap().unwrap().value, 5);
    }

    #[tokio::test]
    async fn test_search_is_bounded_by_watermark_and_operator() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let mut store = open_store(log, "join").await;
        store.put(key("join@LEFT", "01", 10, 20), WindowState::new("a".into(), 1, 11)).await.unwrap();
        store.put(key("join@LEFT", "01", 0, 10), WindowState::new("a".into(), 2, 1)).await.unwrap();
        store.put(key("join@LEFT", "02", 20, 30), WindowState::new("b".into(), 3, 21)).await.unwrap();
        store.put(key("join@RIGHT", "01", 0, 10), WindowState::new("a".into(), 4, 2)).await.unwrap();

        let found = store
            .search_less_than_or_equal_watermark(&WindowKey::prefix("join@LEFT", 20))
            .unwrap();
        let ends: Vec<u64> = found.iter().map(|(k, _)| k.window_end).collect();
        assert_eq!(ends, vec![10, 20]);
        assert!(found.iter().all(|(k, _)| k.operator_name == "join@LEFT"));
    }

    #[tokio::test]
    async fn test_out_of_scope_put_is_rejected() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let mut store = open_store(log, "join@LEFT").await;
        let res = store
            .put(key("join@RIGHT", "01", 0, 10), WindowState::new("a".into(), 1, 1))
            .await;
        assert!(matches!(res, Err(StateError::OutOfScope { .. })));
    }

    #[tokio::test]
    async fn test_replay_rebuilds_identical_index() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let mut store = open_store(log.clone(), "sum").await;
        store.put(key("sum", "01", 0, 10), WindowState::new("a".into(), 1, 1)).await.unwrap();
        store.put(key("sum", "02", 0, 10), WindowState::new("b".into(), 2, 2)).await.unwrap();
        store.put(key("sum", "01", 10, 20), WindowState::new("a".into(), 3, 12)).await.unwrap();
        assert!(store.delete_by_key(&key("sum", "02", 0, 10)).await.unwrap());
        let before = store
            .search_less_than_or_equal_watermark(&WindowKey::prefix("sum", 20))
            .unwrap();
        drop(store);

        let restarted = open_store(log, "sum").await;
        let after = restarted
            .search_less_than_or_equal_watermark(&WindowKey::prefix("sum", 20))
            .unwrap();
        assert_eq!(before, after);
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn test_stores_sharing_a_partition_replay_their_own_keys() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let mut left: WindowStore<String, i64> = WindowStore::new(log.clone(), partition(), "j@LEFT");
        let mut right: WindowStore<String, String> =
            WindowStore::new(log.clone(), partition(), "j@RIGHT");
        left.wait_for_replay().await.unwrap();
        right.wait_for_replay().await.unwrap();
        left.put(key("j@LEFT", "01", 0, 10), WindowState::new("a".into(), 1, 1)).await.unwrap();
        right
            .put(key("j@RIGHT", "01", 0, 10), WindowState::new("a".into(), "x".into(), 1))
            .await
            .unwrap();

        let mut left: WindowStore<String, i64> = WindowStore::new(log.clone(), partition(), "j@LEFT");
        let mut right: WindowStore<String, String> = WindowStore::new(log, partition(), "j@RIGHT");
        assert_eq!(left.wait_for_replay().await.unwrap(), 1);
        assert_eq!(right.wait_for_replay().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_key_writes_nothing() {
        let mem = Arc::new(MemoryStateLog::new());
        let log: Arc<dyn StateLog> = mem.clone();
        let mut store = open_store(log, "sum").await;
        assert!(!store.delete_by_key(&key("sum", "01", 0, 10)).await.unwrap());
        assert!(mem.is_empty(&partition()));
    }

    #[tokio::test]
    async fn test_windows_lists_distinct_bounds() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let mut store = open_store(log, "sum").await;
        store.put(key("sum", "01", 0, 10), WindowState::new("a".into(), 1, 1)).await.unwrap();
        store.put(key("sum", "02", 0, 10), WindowState::new("b".into(), 1, 1)).await.unwrap();
        store.put(key("sum", "01", 5, 15), WindowState::new("a".into(), 1, 6)).await.unwrap();
        let windows: Vec<TimeWindow> = store.windows("sum").unwrap().into_iter().collect();
        assert_eq!(windows, vec![TimeWindow::new(0, 10), TimeWindow::new(5, 15)]);
    }

    #[tokio::test]
    async fn test_file_backed_store_with_json_codec_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileStateLogConfig {
            dir: dir.path().to_path_buf(),
            sync_on_append: true,
        };
        let log: Arc<dyn StateLog> = Arc::new(FileStateLog::open(config.clone()).unwrap());
        let mut store: WindowStore<String, i64, JsonCodec> =
            WindowStore::with_codec(log, partition(), "sum", JsonCodec);
        store.wait_for_replay().await.unwrap();
        store.put(key("sum", "01", 0, 10), WindowState::new("a".into(), 9, 3)).await.unwrap();
        drop(store);

        let log: Arc<dyn StateLog> = Arc::new(FileStateLog::open(config).unwrap());
        let mut store: WindowStore<String, i64, JsonCodec> =
            WindowStore::with_codec(log, partition(), "sum", JsonCodec);
        assert_eq!(store.wait_for_replay().await.unwrap(), 1);
        let entry = store.get(&key("sum", "01", 0, 10)).unwrap().unwrap();
        assert_eq!(entry.value, 9);
    }

    #[tokio::test]
    async fn test_store_ignores_operators_sharing_its_name_prefix() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let mut by_user: WindowStore<String, bool> =
            WindowStore::new(log.clone(), partition(), "clicks-by-user");
        by_user.wait_for_replay().await.unwrap();
        by_user
            .put(key("clicks-by-user", "01", 0, 10), WindowState::new("a".into(), true, 1))
            .await
            .unwrap();

        let mut clicks: WindowStore<String, u64> = WindowStore::new(log, partition(), "clicks");
        assert_eq!(clicks.wait_for_replay().await.unwrap(), 0);
        assert!(clicks.is_empty());
        let res = clicks
            .put(key("clicks-by-user", "02", 0, 10), WindowState::new("b".into(), 1, 1))
            .await;
        assert!(matches!(res, Err(StateError::OutOfScope { .. })));
        clicks
            .put(key("clicks@hourly", "02", 0, 10), WindowState::new("b".into(), 1, 1))
            .await
            .unwrap();
    }
}
