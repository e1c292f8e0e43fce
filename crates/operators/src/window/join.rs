//! Windowed stream-stream join.
//!
//! Both sides are buffered per key and window in one state partition; a
//! window is joined and retired once the watermark passes its end.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use confluence_core::{JoinType, Record, StreamSide, TimeWindow, WindowSpec, STREAM_TAG};
use confluence_runtime::{Downstream, OperatorMetrics, Processor, StreamContext, TaskContext};
use confluence_state::{encode_key_hex, StateValue, WindowKey, WindowState, WindowStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::assigner::assign_windows;
use super::config::JoinWindowConfig;

/// A value arriving at a join, tagged with its stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JoinInput<V1, V2> {
    Left(V1),
    Right(V2),
}

impl<V1, V2> JoinInput<V1, V2> {
    pub fn side(&self) -> StreamSide {
        match self {
            JoinInput::Left(_) => StreamSide::Left,
            JoinInput::Right(_) => StreamSide::Right,
        }
    }
}

/// Combines the two sides of a match. The absent side of an outer join is
/// `None`.
pub trait ValueJoiner<V1, V2, Out>: Send + 'static {
    fn join(&mut self, left: Option<&V1>, right: Option<&V2>) -> Result<Out>;
}

impl<V1, V2, Out, F> ValueJoiner<V1, V2, Out> for F
where
    F: FnMut(Option<&V1>, Option<&V2>) -> Result<Out> + Send + 'static,
{
    fn join(&mut self, left: Option<&V1>, right: Option<&V2>) -> Result<Out> {
        self(left, right)
    }
}

type Entries<K, V> = Vec<(WindowKey, WindowState<K, V>)>;

pub struct JoinWindowProcessor<K, V1, V2, Out, J> {
    config: JoinWindowConfig,
    spec: WindowSpec,
    joiner: J,
    left: Option<WindowStore<K, V1>>,
    right: Option<WindowStore<K, V2>>,
    downstream: Downstream<K, Out>,
    metrics: OperatorMetrics,
}

impl<K, V1, V2, Out, J> JoinWindowProcessor<K, V1, V2, Out, J>
where
    K: StateValue,
    V1: StateValue,
    V2: StateValue,
    Out: Clone + Send + 'static,
    J: ValueJoiner<V1, V2, Out>,
{
    pub fn new(config: JoinWindowConfig, joiner: J) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            spec: config.window.spec(),
            config,
            joiner,
            left: None,
            right: None,
            downstream: Downstream::new(),
            metrics: OperatorMetrics::default(),
        })
    }

    pub fn with_downstream(mut self, downstream: Downstream<K, Out>) -> Self {
        self.downstream = downstream;
        self
    }

    /// Operator name of one side's state entries.
    pub fn side_name(&self, side: StreamSide) -> String {
        format!("{}@{}", self.config.name, side.name())
    }

    /// Buffer the value under every window containing the event time.
    async fn store(
        &mut self,
        ctx: &StreamContext<K>,
        side: StreamSide,
        value: JoinInput<V1, V2>,
    ) -> Result<()> {
        let key_hex = encode_key_hex(&ctx.key)?;
        let windows = assign_windows(&self.spec, ctx.event_time);
        let name = self.side_name(side);
        let (left, right) = self.stores()?;

        match value {
            JoinInput::Left(v) if side == StreamSide::Left => {
                for w in windows {
                    let key = WindowKey::new(name.as_str(), key_hex.as_str(), w.end, w.start);
                    left.put(key, WindowState::new(ctx.key.clone(), v.clone(), ctx.event_time))
                        .await?;
                }
            }
            JoinInput::Right(v) if side == StreamSide::Right => {
                for w in windows {
                    let key = WindowKey::new(name.as_str(), key_hex.as_str(), w.end, w.start);
                    right
                        .put(key, WindowState::new(ctx.key.clone(), v.clone(), ctx.event_time))
                        .await?;
                }
            }
            other => bail!("record tagged {} carries a {} value", side, other.side()),
        }
        Ok(())
    }

    /// Join and retire every buffered window ending at or before the watermark.
    async fn fire(&mut self, ctx: &StreamContext<K>) -> Result<()> {
        let watermark = ctx.watermark;
        let left_name = self.side_name(StreamSide::Left);
        let right_name = self.side_name(StreamSide::Right);
        let (left, right) = self.stores()?;

        let mut lefts =
            left.search_less_than_or_equal_watermark(&WindowKey::prefix(left_name, watermark))?;
        let mut rights =
            right.search_less_than_or_equal_watermark(&WindowKey::prefix(right_name, watermark))?;
        if lefts.is_empty() && rights.is_empty() {
            return Ok(());
        }
        lefts.sort_by_key(|(k, _)| k.window_end);
        rights.sort_by_key(|(k, _)| k.window_end);
        debug!(
            operator = %self.config.name,
            watermark,
            left = lefts.len(),
            right = rights.len(),
            "join windows due"
        );

        let joined = self.join_windows(ctx, &lefts, &rights).await;
        let retired = self.retire(&lefts, &rights).await;
        if let (Err(_), Err(e)) = (&joined, &retired) {
            error!(operator = %self.config.name, error = %e, "retiring join windows failed");
        }
        joined.and(retired)
    }

    async fn join_windows(
        &mut self,
        ctx: &StreamContext<K>,
        lefts: &Entries<K, V1>,
        rights: &Entries<K, V2>,
    ) -> Result<()> {
        match self.config.join_type {
            JoinType::Inner => {
                for (lk, ls) in lefts {
                    let mut matched = false;
                    let matches = rights
                        .iter()
                        .filter(|(rk, _)| rk.key_and_window() == lk.key_and_window());
                    for (_, rs) in matches {
                        let out = self.joiner.join(Some(&ls.value), Some(&rs.value))?;
                        self.emit(ctx, lk.window(), ls.key.clone(), out).await?;
                        matched = true;
                    }
                    if matched {
                        self.metrics.windows_fired += 1;
                    }
                }
            }
            JoinType::Left => {
                for (lk, ls) in lefts {
                    let right = rights
                        .iter()
                        .find(|(rk, _)| rk.key_and_window() == lk.key_and_window())
                        .map(|(_, rs)| &rs.value);
                    let out = self.joiner.join(Some(&ls.value), right)?;
                    self.emit(ctx, lk.window(), ls.key.clone(), out).await?;
                    self.metrics.windows_fired += 1;
                }
            }
            JoinType::Right => {
                for (rk, rs) in rights {
                    let left = lefts
                        .iter()
                        .find(|(lk, _)| lk.key_and_window() == rk.key_and_window())
                        .map(|(_, ls)| &ls.value);
                    let out = self.joiner.join(left, Some(&rs.value))?;
                    self.emit(ctx, rk.window(), rs.key.clone(), out).await?;
                    self.metrics.windows_fired += 1;
                }
            }
        }
        Ok(())
    }

    async fn emit(
        &mut self,
        ctx: &StreamContext<K>,
        window: TimeWindow,
        key: K,
        value: Out,
    ) -> Result<()> {
        let mut headers = ctx.header_copy();
        headers.set_window(window);
        let record = Record::new(key, value, ctx.event_time).with_headers(headers);
        self.downstream.forward(record, ctx.watermark).await?;
        self.metrics.records_out += 1;
        Ok(())
    }

    async fn retire(&mut self, lefts: &Entries<K, V1>, rights: &Entries<K, V2>) -> Result<()> {
        let (left, right) = self.stores()?;
        let mut retired = 0;
        for (key, _) in lefts {
            if left.delete_by_key(key).await? {
                retired += 1;
            }
        }
        for (key, _) in rights {
            if right.delete_by_key(key).await? {
                retired += 1;
            }
        }
        self.metrics.windows_retired += retired;
        Ok(())
    }

    fn stores(&mut self) -> Result<(&mut WindowStore<K, V1>, &mut WindowStore<K, V2>)> {
        match (self.left.as_mut(), self.right.as_mut()) {
            (Some(left), Some(right)) => Ok((left, right)),
            _ => Err(anyhow!("join {} used before open", self.config.name)),
        }
    }
}

#[async_trait]
impl<K, V1, V2, Out, J> Processor for JoinWindowProcessor<K, V1, V2, Out, J>
where
    K: StateValue,
    V1: StateValue,
    V2: StateValue,
    Out: Clone + Send + 'static,
    J: ValueJoiner<V1, V2, Out>,
{
    type Key = K;
    type In = JoinInput<V1, V2>;

    async fn open(&mut self, task: &TaskContext) -> Result<()> {
        let partition = task.state_partition();
        let mut left = WindowStore::new(
            task.state_log.clone(),
            partition.clone(),
            self.side_name(StreamSide::Left),
        );
        let mut right = WindowStore::new(
            task.state_log.clone(),
            partition.clone(),
            self.side_name(StreamSide::Right),
        );
        let left_entries = left
            .wait_for_replay()
            .await
            .with_context(|| format!("replay left state of {}", self.config.name))?;
        let right_entries = right
            .wait_for_replay()
            .await
            .with_context(|| format!("replay right state of {}", self.config.name))?;
        self.left = Some(left);
        self.right = Some(right);

        info!(
            operator = %self.config.name,
            %partition,
            left_entries,
            right_entries,
            "join state restored"
        );
        self.downstream.open_all(task).await
    }

    async fn process(&mut self, ctx: &StreamContext<K>, value: JoinInput<V1, V2>) -> Result<()> {
        self.metrics.records_in += 1;
        self.metrics.watermark = ctx.watermark;

        if ctx.event_time < ctx.watermark {
            self.metrics.late_dropped += 1;
            debug!(
                operator = %self.config.name,
                event_time = ctx.event_time,
                watermark = ctx.watermark,
                "late record dropped"
            );
            return Ok(());
        }

        let side = ctx
            .stream_side()
            .ok_or_else(|| anyhow!("record without a valid {} header", STREAM_TAG))?;
        self.store(ctx, side, value).await?;
        self.fire(ctx).await
    }

    async fn close(&mut self) -> Result<()> {
        self.downstream.close_all().await
    }

    fn metrics(&self) -> OperatorMetrics {
        self.metrics.clone()
    }
}
