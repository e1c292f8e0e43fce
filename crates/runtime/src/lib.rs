//! Per-partition runtime for window processors.
//!
//! - one worker task per source partition, processing records strictly in
//!   arrival order
//! - the processor is opened (and its state replayed) before the first record
//!   is admitted
//! - watermarks are tracked per partition and handed to the processor with
//!   every record
//! - results leave a processor only through its [`Downstream`]

mod clock;
mod context;
mod watermark;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{Downstream, FnSink, StreamContext};
pub use watermark::{WatermarkPolicy, WatermarkTracker};

use anyhow::{Context, Result};
use async_trait::async_trait;
use confluence_core::{PartitionId, Record, StreamMessage, Timestamp};
use confluence_state::StateLog;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub type Sender<T> = mpsc::Sender<StreamMessage<T>>;
pub type Receiver<T> = mpsc::Receiver<StreamMessage<T>>;

/// A processor consumes keyed records of one partition, one at a time.
#[async_trait]
pub trait Processor: Send + 'static {
    type Key: Clone + Send + Sync + 'static;
    type In: Send + 'static;

    /// Called once before the first record; stateful processors replay here.
    async fn open(&mut self, _task: &TaskContext) -> Result<()> {
        Ok(())
    }

    async fn process(&mut self, ctx: &StreamContext<Self::Key>, value: Self::In) -> Result<()>;

    /// Called when the worker stops.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn metrics(&self) -> OperatorMetrics {
        OperatorMetrics::default()
    }
}

/// Everything a processor needs from the partition it runs on.
#[derive(Clone)]
pub struct TaskContext {
    pub partition: PartitionId,
    pub state_log: Arc<dyn StateLog>,
    pub clock: Arc<dyn Clock>,
}

impl TaskContext {
    pub fn new(partition: PartitionId, state_log: Arc<dyn StateLog>) -> Self {
        Self {
            partition,
            state_log,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Partition of the state log backing this source partition.
    pub fn state_partition(&self) -> PartitionId {
        self.partition.state_partition()
    }
}

/// Counters kept by a processor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperatorMetrics {
    pub records_in: u64,
    pub records_out: u64,
    /// Records older than the watermark, dropped on admission.
    pub late_dropped: u64,
    /// Window assignments skipped by the early-fire staleness cutoff.
    pub stale_dropped: u64,
    pub windows_fired: u64,
    pub windows_retired: u64,
    pub watermark: Timestamp,
}

/// Create a bounded channel for stream messages.
pub fn stream_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    mpsc::channel(capacity)
}

/// Spawn the worker of one partition.
///
/// The processor is opened first; an open failure (e.g. a replay failure)
/// stops the worker before any record is processed. A processing failure also
/// stops it: restarting is left to whoever supervises the worker.
pub fn spawn_partition_worker<P>(
    name: &'static str,
    task: TaskContext,
    mut processor: P,
    policy: WatermarkPolicy,
    mut rx: Receiver<Record<P::Key, P::In>>,
) -> JoinHandle<Result<OperatorMetrics>>
where
    P: Processor,
{
    tokio::spawn(async move {
        let partition = task.partition.clone();
        debug!(%name, %partition, "partition worker started");

        if let Err(e) = processor.open(&task).await {
            error!(%name, %partition, error = %e, "processor open failed");
            return Err(e.context(format!("open {name} on {partition}")));
        }
        info!(%name, %partition, "processor opened");

        let mut watermarks = WatermarkTracker::new(policy);
        while let Some(msg) = rx.recv().await {
            match msg {
                StreamMessage::Data(record) => {
                    watermarks.observe(record.timestamp);
                    let ctx = StreamContext::new(record.key, record.timestamp, watermarks.current())
                        .with_headers(record.headers);
                    if let Err(e) = processor.process(&ctx, record.value).await {
                        error!(%name, %partition, error = %e, "processor error");
                        if let Err(e) = processor.close().await {
                            error!(%name, %partition, error = %e, "processor close failed");
                        }
                        return Err(e.context(format!("process record on {partition}")));
                    }
                }
                StreamMessage::Watermark(wm) => {
                    if watermarks.advance_to(wm) {
                        debug!(%name, %partition, watermark = wm, "watermark advanced");
                    }
                }
                StreamMessage::End => break,
            }
        }

        processor
            .close()
            .await
            .with_context(|| format!("close {name} on {partition}"))?;

        let metrics = processor.metrics();
        debug!(%name, %partition, ?metrics, "partition worker stopped");
        Ok(metrics)
    })
}
