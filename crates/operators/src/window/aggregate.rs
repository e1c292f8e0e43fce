//! Windowed aggregation driven by window instances.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use confluence_core::{Record, WindowSpec};
use confluence_runtime::{Downstream, OperatorMetrics, Processor, StreamContext, TaskContext};
use confluence_state::{encode_key_hex, StateValue, WindowKey, WindowState, WindowStore};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::config::AggregateWindowConfig;
use super::instance::{InstanceStore, WindowInstance};
use super::registry::WindowInstanceRegistry;

/// Folds values into a per-key, per-window accumulator and emits
/// `result_fn(acc)` for every key once the window's instance is due.
pub struct WindowAggregateProcessor<K, V, A, Out, AF, RF> {
    config: AggregateWindowConfig,
    spec: WindowSpec,
    accumulate_fn: AF,
    result_fn: RF,
    instance_store: Option<Arc<dyn InstanceStore>>,
    split_id: String,
    registry: Option<WindowInstanceRegistry>,
    store: Option<WindowStore<K, A>>,
    downstream: Downstream<K, Out>,
    metrics: OperatorMetrics,
    _value: std::marker::PhantomData<fn(V)>,
}

impl<K, V, A, Out, AF, RF> WindowAggregateProcessor<K, V, A, Out, AF, RF>
where
    K: StateValue,
    V: Send + Sync + 'static,
    A: StateValue + Default,
    Out: Clone + Send + 'static,
    AF: Fn(&mut A, &V) + Send + 'static,
    RF: Fn(&A) -> Out + Send + 'static,
{
    pub fn new(config: AggregateWindowConfig, accumulate_fn: AF, result_fn: RF) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            spec: config.window.spec(),
            config,
            accumulate_fn,
            result_fn,
            instance_store: None,
            split_id: String::new(),
            registry: None,
            store: None,
            downstream: Downstream::new(),
            metrics: OperatorMetrics::default(),
            _value: std::marker::PhantomData,
        })
    }

    pub fn with_downstream(mut self, downstream: Downstream<K, Out>) -> Self {
        self.downstream = downstream;
        self
    }

    /// Persist window instances to `store`, unless the operator is
    /// configured local-storage-only.
    pub fn with_instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.instance_store = Some(store);
        self
    }

    pub fn registry(&self) -> Option<&WindowInstanceRegistry> {
        self.registry.as_ref()
    }

    async fn accumulate(&mut self, ctx: &StreamContext<K>, value: &V) -> Result<()> {
        let key_hex = encode_key_hex(&ctx.key)?;
        let Self {
            config,
            accumulate_fn,
            split_id,
            registry,
            store,
            metrics,
            ..
        } = &mut *self;
        let (Some(registry), Some(store)) = (registry.as_mut(), store.as_mut()) else {
            bail!("aggregate {} used before open", config.name);
        };

        let instances = registry.get_or_create(ctx.event_time, split_id).await;
        metrics.stale_dropped = registry.stale_dropped();

        for instance in instances {
            let key = WindowKey::new(
                config.name.as_str(),
                key_hex.as_str(),
                instance.window.end,
                instance.window.start,
            );
            let mut acc = store.get(&key)?.map(|s| s.value.clone()).unwrap_or_default();
            accumulate_fn(&mut acc, value);
            store
                .put(key, WindowState::new(ctx.key.clone(), acc, ctx.event_time))
                .await?;
        }
        Ok(())
    }

    async fn fire(&mut self, ctx: &StreamContext<K>) -> Result<()> {
        let watermark = ctx.watermark;
        let prefix = WindowKey::prefix(self.config.name.as_str(), watermark);
        let (registry, store) = self.parts()?;
        let due = registry.take_due(watermark);
        if due.is_empty() {
            return Ok(());
        }
        let entries = store.search_less_than_or_equal_watermark(&prefix)?;
        debug!(
            operator = %self.config.name,
            watermark,
            windows = due.len(),
            entries = entries.len(),
            "aggregate windows due"
        );

        let emitted = self.emit_due(ctx, &due, &entries).await;
        let retired = self.retire(&due, &entries).await;
        if let (Err(_), Err(e)) = (&emitted, &retired) {
            error!(operator = %self.config.name, error = %e, "retiring aggregate windows failed");
        }
        emitted.and(retired)
    }

    async fn emit_due(
        &mut self,
        ctx: &StreamContext<K>,
        due: &[WindowInstance],
        entries: &[(WindowKey, WindowState<K, A>)],
    ) -> Result<()> {
        for instance in due {
            for (_, state) in entries.iter().filter(|(k, _)| k.window() == instance.window) {
                let mut headers = ctx.header_copy();
                headers.set_window(instance.window);
                let value = (self.result_fn)(&state.value);
                let record =
                    Record::new(state.key.clone(), value, ctx.event_time).with_headers(headers);
                self.downstream.forward(record, ctx.watermark).await?;
                self.metrics.records_out += 1;
            }
            self.metrics.windows_fired += 1;
        }
        Ok(())
    }

    async fn retire(
        &mut self,
        due: &[WindowInstance],
        entries: &[(WindowKey, WindowState<K, A>)],
    ) -> Result<()> {
        let (registry, store) = self.parts()?;
        let mut retired = 0;
        for (key, _) in entries
            .iter()
            .filter(|(k, _)| due.iter().any(|i| i.window == k.window()))
        {
            if store.delete_by_key(key).await? {
                retired += 1;
            }
        }
        registry.clear(due).await;
        self.metrics.windows_retired += retired;
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut WindowInstanceRegistry, &mut WindowStore<K, A>)> {
        match (self.registry.as_mut(), self.store.as_mut()) {
            (Some(registry), Some(store)) => Ok((registry, store)),
            _ => Err(anyhow!("aggregate {} used before open", self.config.name)),
        }
    }
}

#[async_trait]
impl<K, V, A, Out, AF, RF> Processor for WindowAggregateProcessor<K, V, A, Out, AF, RF>
where
    K: StateValue,
    V: Send + Sync + 'static,
    A: StateValue + Default,
    Out: Clone + Send + 'static,
    AF: Fn(&mut A, &V) + Send + 'static,
    RF: Fn(&A) -> Out + Send + 'static,
{
    type Key = K;
    type In = V;

    async fn open(&mut self, task: &TaskContext) -> Result<()> {
        let partition = task.state_partition();
        self.split_id = task.partition.to_string();

        let mut store = WindowStore::new(
            task.state_log.clone(),
            partition.clone(),
            self.config.name.as_str(),
        );
        let entries = store
            .wait_for_replay()
            .await
            .with_context(|| format!("replay state of {}", self.config.name))?;

        let window = &self.config.window;
        let mut registry = WindowInstanceRegistry::new(
            self.config.namespace.as_str(),
            self.config.name.as_str(),
            self.spec,
            window.grace_ms(),
            window.fire_mode,
            task.clock.clone(),
        );
        if !self.config.local_storage_only {
            if let Some(instances) = &self.instance_store {
                registry = registry.with_store(instances.clone());
            }
        }

        let split = [self.split_id.clone()];
        let recovered = registry.recover(&split).await;
        for w in store.windows(&self.config.name)? {
            registry.ensure_window(w, &self.split_id).await;
        }

        info!(
            operator = %self.config.name,
            %partition,
            entries,
            recovered,
            windows = registry.len(),
            "aggregate state restored"
        );
        self.store = Some(store);
        self.registry = Some(registry);
        self.downstream.open_all(task).await
    }

    async fn process(&mut self, ctx: &StreamContext<K>, value: V) -> Result<()> {
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

        self.accumulate(ctx, &value).await?;
        self.fire(ctx).await
    }

    async fn close(&mut self) -> Result<()> {
        self.downstream.close_all().await
    }

    fn metrics(&self) -> OperatorMetrics {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::assigner::FireMode;
    use crate::window::config::{TimeUnit, WindowConfig};
    use crate::window::instance::MemoryInstanceStore;
    use confluence_core::{PartitionId, TimeWindow, WINDOW_END_TIME, WINDOW_START_TIME};
    use confluence_runtime::{FnSink, ManualClock};
    use confluence_state::{MemoryStateLog, StateLog};
    use parking_lot::Mutex;

    type Output = Arc<Mutex<Vec<(String, u64, u64, u64)>>>;

    fn task(log: Arc<dyn StateLog>) -> TaskContext {
        TaskContext::new(PartitionId::new("clicks", "broker-a", 0), log)
            .with_clock(Arc::new(ManualClock::new(0)))
    }

    fn counter(
        config: AggregateWindowConfig,
    ) -> (
        WindowAggregateProcessor<
            String,
            u64,
            u64,
            u64,
            impl Fn(&mut u64, &u64) + Send + 'static,
            impl Fn(&u64) -> u64 + Send + 'static,
        >,
        Output,
    ) {
        let out: Output = Arc::new(Mutex::new(Vec::new()));
        let sink_out = out.clone();
        let sink = FnSink::new(move |ctx: &StreamContext<String>, count: u64| {
            sink_out.lock().push((
                ctx.key.clone(),
                count,
                ctx.headers.get_int(WINDOW_START_TIME).unwrap_or(u64::MAX),
                ctx.headers.get_int(WINDOW_END_TIME).unwrap_or(u64::MAX),
            ));
            Ok(())
        });
        let processor = WindowAggregateProcessor::new(
            config,
            |acc: &mut u64, v: &u64| *acc += *v,
            |acc: &u64| *acc,
        )
        .unwrap()
        .with_downstream(Downstream::new().with(sink));
        (processor, out)
    }

    fn ctx(key: &str, event_time: u64, watermark: u64) -> StreamContext<String> {
        StreamContext::new(key.to_string(), event_time, watermark)
    }

    #[tokio::test]
    async fn test_sliding_counts() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let config =
            AggregateWindowConfig::new("clicks", WindowConfig::sliding(10, 5, TimeUnit::Millis));
        let (mut p, out) = counter(config);
        p.open(&task(log)).await.unwrap();

        p.process(&ctx("a", 7, 0), 1).await.unwrap();
        p.process(&ctx("a", 8, 0), 1).await.unwrap();
        p.process(&ctx("b", 12, 0), 1).await.unwrap();
        assert!(out.lock().is_empty());

        p.process(&ctx("b", 16, 10), 1).await.unwrap();
        assert_eq!(out.lock().clone(), vec![("a".to_string(), 2, 0, 10)]);

        p.process(&ctx("c", 21, 15), 1).await.unwrap();
        let got = out.lock().clone();
        assert_eq!(
            got[1..].to_vec(),
            vec![("a".to_string(), 2, 5, 15), ("b".to_string(), 1, 5, 15)]
        );
        assert_eq!(p.metrics().windows_fired, 2);
    }

    #[tokio::test]
    async fn test_grace_delays_firing() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let config = AggregateWindowConfig::new(
            "clicks",
            WindowConfig::tumbling(10, TimeUnit::Millis).with_grace(5),
        );
        let (mut p, out) = counter(config);
        p.open(&task(log)).await.unwrap();

        p.process(&ctx("a", 3, 0), 1).await.unwrap();
        p.process(&ctx("b", 11, 10), 1).await.unwrap();
        assert!(out.lock().is_empty());

        p.process(&ctx("b", 16, 15), 1).await.unwrap();
        assert_eq!(out.lock().clone(), vec![("a".to_string(), 1, 0, 10)]);
    }

    #[tokio::test]
    async fn test_late_record_does_not_touch_state() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let config =
            AggregateWindowConfig::new("clicks", WindowConfig::tumbling(10, TimeUnit::Millis));
        let (mut p, _out) = counter(config);
        p.open(&task(log)).await.unwrap();

        p.process(&ctx("a", 3, 20), 1).await.unwrap();
        assert_eq!(p.metrics().late_dropped, 1);
        assert!(p.registry().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replayed_windows_fire_after_restart() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let config =
            AggregateWindowConfig::new("clicks", WindowConfig::tumbling(10, TimeUnit::Millis));
        {
            let (mut p, _out) = counter(config.clone());
            p.open(&task(log.clone())).await.unwrap();
            p.process(&ctx("a", 3, 0), 2).await.unwrap();
            p.process(&ctx("a", 4, 0), 3).await.unwrap();
        }

        let (mut p, out) = counter(config);
        p.open(&task(log)).await.unwrap();
        assert_eq!(p.registry().unwrap().len(), 1);

        p.process(&ctx("b", 12, 10), 1).await.unwrap();
        assert_eq!(out.lock().clone(), vec![("a".to_string(), 5, 0, 10)]);
    }

    #[tokio::test]
    async fn test_db_backed_instances_are_recovered() {
        let log: Arc<dyn StateLog> = Arc::new(MemoryStateLog::new());
        let instances = Arc::new(MemoryInstanceStore::new());
        let mut config = AggregateWindowConfig::new(
            "clicks",
            WindowConfig::tumbling(10, TimeUnit::Millis).with_fire_mode(FireMode::Normal),
        );
        config.local_storage_only = false;

        {
            let (p, _out) = counter(config.clone());
            let mut p = p.with_instance_store(instances.clone());
            p.open(&task(log.clone())).await.unwrap();
            p.process(&ctx("a", 3, 0), 1).await.unwrap();
        }
        assert_eq!(instances.len(), 1);

        let (p, out) = counter(config);
        let mut p = p.with_instance_store(instances.clone());
        p.open(&task(log)).await.unwrap();
        let registry = p.registry().unwrap();
        assert_eq!(registry.len(), 1);
        let recovered = WindowInstance::new(
            "broker-a@clicks@0",
            "",
            "clicks",
            "clicks",
            TimeWindow::new(0, 10),
            10,
        );
        assert_eq!(registry.get(&recovered.instance_id()).unwrap().version, 2);

        p.process(&ctx("b", 12, 10), 1).await.unwrap();
        assert_eq!(out.lock().clone(), vec![("a".to_string(), 1, 0, 10)]);
        assert_eq!(instances.len(), 1);
    }
}
