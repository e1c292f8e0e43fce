//! File-backed state log.

mod segment;

use async_trait::async_trait;
use confluence_core::PartitionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StateResult;
use crate::traits::{LogRecord, StateLog};

use segment::{encode_frame, Frame, SegmentReader};

/// Configuration for [`FileStateLog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStateLogConfig {
    /// Directory holding one segment file per state partition.
    pub dir: PathBuf,
    /// Whether every append waits for the data to reach the disk.
    pub sync_on_append: bool,
}

impl Default for FileStateLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./state"),
            sync_on_append: true,
        }
    }
}

/// State log storing each partition in its own append-only segment file.
///
/// ```text
/// dir/
///   broker-a_orders-state_0.log
///   broker-a_orders-state_1.log
/// ```
///
/// A torn record at the end of a segment (crash mid-append) is cut off during
/// replay; a checksum mismatch anywhere fails the replay.
pub struct FileStateLog {
    config: FileStateLogConfig,
    writers: Mutex<HashMap<PartitionId, File>>,
}

impl FileStateLog {
    /// Open (or create) a log in `config.dir`.
    pub fn open(config: FileStateLogConfig) -> StateResult<Self> {
        std::fs::create_dir_all(&config.dir)?;
        info!(dir = %config.dir.display(), "file state log opened");
        Ok(Self {
            config,
            writers: Mutex::new(HashMap::new()),
        })
    }

    /// Get the log directory.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Path of the segment file for a partition.
    pub fn segment_path(&self, partition: &PartitionId) -> PathBuf {
        self.config.dir.join(format!(
            "{}_{}_{}.log",
            sanitize(&partition.broker),
            sanitize(&partition.topic),
            partition.queue_id
        ))
    }
}

#[async_trait]
impl StateLog for FileStateLog {
    async fn append(&self, partition: &PartitionId, record: LogRecord) -> StateResult<()> {
        let frame = encode_frame(&record)?;

        let mut writers = self.writers.lock().await;
        let file = match writers.entry(partition.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.segment_path(partition))
                    .await?;
                e.insert(file)
            }
        };

        file.write_all(&frame).await?;
        file.flush().await?;
        if self.config.sync_on_append {
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn replay(&self, partition: &PartitionId) -> StateResult<Vec<LogRecord>> {
        // Hold the writer map so no append interleaves with a tail repair.
        let mut writers = self.writers.lock().await;
        let path = self.segment_path(partition);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = SegmentReader::new(partition, &data);
        let mut records = Vec::new();
        loop {
            match reader.read_next()? {
                Frame::Record(record) => records.push(record),
                Frame::Eof => break,
                Frame::TornWrite { position, reason } => {
                    warn!(%partition, position, %reason, "truncating torn state log tail");
                    writers.remove(partition);
                    let file = OpenOptions::new().write(true).open(&path).await?;
                    file.set_len(position).await?;
                    file.sync_all().await?;
                    break;
                }
            }
        }

        debug!(%partition, records = records.len(), bytes = data.len(), "state log read");
        Ok(records)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;

    fn log_in(dir: &Path) -> FileStateLog {
        FileStateLog::open(FileStateLogConfig {
            dir: dir.to_path_buf(),
            sync_on_append: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let p = PartitionId::new("orders-state", "broker-a", 0);

        {
            let log = log_in(dir.path());
            log.append(&p, LogRecord::put(&b"a"[..], &b"1"[..])).await.unwrap();
            log.append(&p, LogRecord::put(&b"b"[..], &b"2"[..])).await.unwrap();
            log.append(&p, LogRecord::tombstone(&b"a"[..])).await.unwrap();
        }

        let log = log_in(dir.path());
        let records = log.replay(&p).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], LogRecord::put(&b"b"[..], &b"2"[..]));
        assert!(records[2].is_tombstone());
    }

    #[tokio::test]
    async fn test_missing_segment_replays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = log_in(dir.path());
        let p = PartitionId::new("orders-state", "broker-a", 7);
        assert!(log.replay(&p).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated_and_appends_continue() {
        let dir = tempfile::tempdir().unwrap();
        let p = PartitionId::new("orders-state", "broker-a", 0);
        let log = log_in(dir.path());
        log.append(&p, LogRecord::put(&b"a"[..], &b"1"[..])).await.unwrap();

        let path = log.segment_path(&p);
        let mut bytes = std::fs::read(&path).unwrap();
        let good_len = bytes.len();
        bytes.extend_from_slice(&[9, 0, 0]);
        std::fs::write(&path, &bytes).unwrap();

        let log = log_in(dir.path());
        assert_eq!(log.replay(&p).await.unwrap().len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len as u64);

        log.append(&p, LogRecord::put(&b"b"[..], &b"2"[..])).await.unwrap();
        assert_eq!(log.replay(&p).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_record_fails_replay() {
        let dir = tempfile::tempdir().unwrap();
        let p = PartitionId::new("orders-state", "broker-a", 0);
        let log = log_in(dir.path());
        log.append(&p, LogRecord::put(&b"a"[..], &b"1"[..])).await.unwrap();

        let path = log.segment_path(&p);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let log = log_in(dir.path());
        assert!(matches!(
            log.replay(&p).await,
            Err(StateError::ChecksumMismatch { .. })
        ));
    }
}
