//! In-memory registry of the window instances of one operator.

use confluence_core::{TimeWindow, Timestamp, WindowSpec};
use confluence_runtime::Clock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::assigner::{assign_windows, FireMode, FireTimeCalculator};
use super::instance::{split_name, InstanceStatus, InstanceStore, PendingQuery, WindowInstance};

/// Tracks which windows exist, when each is due, and which have fired.
///
/// The registry is the authority for firing. An [`InstanceStore`], when
/// configured, mirrors it so pending windows survive a restart; store errors
/// are logged and otherwise ignored.
pub struct WindowInstanceRegistry {
    namespace: String,
    window_name: String,
    spec: WindowSpec,
    fire_times: FireTimeCalculator,
    clock: Arc<dyn Clock>,
    instances: HashMap<String, WindowInstance>,
    store: Option<Arc<dyn InstanceStore>>,
    stale_dropped: u64,
}

impl WindowInstanceRegistry {
    pub fn new(
        namespace: impl Into<String>,
        window_name: impl Into<String>,
        spec: WindowSpec,
        grace_ms: Timestamp,
        fire_mode: FireMode,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            window_name: window_name.into(),
            spec,
            fire_times: FireTimeCalculator::new(spec, grace_ms, fire_mode),
            clock,
            instances: HashMap::new(),
            store: None,
            stale_dropped: 0,
        }
    }

    /// Mirror instances into `store`.
    pub fn with_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn is_local_storage_only(&self) -> bool {
        self.store.is_none()
    }

    /// Instances of every window containing `event_time`, creating the
    /// missing ones.
    ///
    /// Fire times are recomputed on every call. Assignment stops at the first
    /// window the early-fire cutoff considers stale.
    pub async fn get_or_create(
        &mut self,
        event_time: Timestamp,
        split_id: &str,
    ) -> Vec<WindowInstance> {
        let now = self.clock.now_ms();
        let mut result = Vec::new();
        let mut created = Vec::new();

        for window in assign_windows(&self.spec, event_time) {
            let Some(fire_time) = self.fire_times.fire_time(&window, event_time, split_id, now)
            else {
                self.stale_dropped += 1;
                debug!(
                    namespace = %self.namespace,
                    window = %window,
                    event_time,
                    "stale window assignment dropped"
                );
                break;
            };

            let candidate = self.instance(split_id, window, fire_time);
            let id = candidate.instance_id();
            match self.instances.get_mut(&id) {
                Some(existing) => {
                    if existing.is_pending() {
                        existing.fire_time = fire_time;
                    }
                    existing.is_new = false;
                    result.push(existing.clone());
                }
                None => {
                    self.instances.insert(id, candidate.clone());
                    created.push(candidate.clone());
                    result.push(candidate);
                }
            }
        }

        if !created.is_empty() {
            self.persist(&created).await;
        }
        result
    }

    /// Register `window` for state that exists without an instance, e.g.
    /// after a replay. The instance is due at `window.end + grace`.
    pub async fn ensure_window(&mut self, window: TimeWindow, split_id: &str) -> WindowInstance {
        let fire_time = window.end.saturating_add(self.fire_times.grace_ms());
        let candidate = self.instance(split_id, window, fire_time);
        let id = candidate.instance_id();
        if let Some(existing) = self.instances.get(&id) {
            return existing.clone();
        }
        self.instances.insert(id, candidate.clone());
        self.persist(std::slice::from_ref(&candidate)).await;
        candidate
    }

    /// Pending instances of `split_ids` with `fire_time < last_time`, from the
    /// store.
    ///
    /// Empty for a local-storage-only registry, and when the store fails.
    pub async fn query_pending(&self, last_time: Timestamp, split_ids: &[String]) -> Vec<WindowInstance> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        let query = PendingQuery {
            split_names: split_ids
                .iter()
                .map(|s| split_name(&self.namespace, &self.window_name, s))
                .collect(),
            before: last_time,
        };
        match store.query_pending(&query).await {
            Ok(found) => found,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "querying pending window instances failed");
                Vec::new()
            }
        }
    }

    /// Load the stored pending instances of `split_ids` into the registry.
    ///
    /// Each recovered instance counts as a re-delivery. Returns how many were
    /// added.
    pub async fn recover(&mut self, split_ids: &[String]) -> usize {
        let mut added = 0;
        for mut instance in self.query_pending(Timestamp::MAX, split_ids).await {
            let id = instance.instance_id();
            if self.instances.contains_key(&id) {
                continue;
            }
            instance.version = instance.version.saturating_add(1);
            instance.is_new = false;
            self.instances.insert(id, instance);
            added += 1;
        }
        if added > 0 {
            info!(namespace = %self.namespace, recovered = added, "window instances recovered");
        }
        added
    }

    /// Mark every pending instance with `fire_time <= watermark` and
    /// `end <= watermark` fired and return them, ordered by window.
    pub fn take_due(&mut self, watermark: Timestamp) -> Vec<WindowInstance> {
        let mut due: Vec<WindowInstance> = self
            .instances
            .values_mut()
            .filter(|i| i.is_pending() && i.fire_time <= watermark && i.window.end <= watermark)
            .map(|i| {
                i.status = InstanceStatus::Fired;
                i.clone()
            })
            .collect();
        due.sort_by(|a, b| a.window.cmp(&b.window).then_with(|| a.split_id.cmp(&b.split_id)));
        due
    }

    /// Forget `instances`, deleting them from the store.
    pub async fn clear(&mut self, instances: &[WindowInstance]) {
        for instance in instances {
            self.instances.remove(&instance.instance_id());
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(instances).await {
                warn!(namespace = %self.namespace, error = %e, "deleting window instances failed");
            }
        }
    }

    /// Cancel a pending instance; it will never fire.
    pub async fn cancel(&mut self, instance_id: &str) -> Option<WindowInstance> {
        let instance = self.instances.get_mut(instance_id)?;
        if !instance.is_pending() {
            return None;
        }
        instance.status = InstanceStatus::Cancelled;
        let cancelled = instance.clone();
        self.clear(std::slice::from_ref(&cancelled)).await;
        Some(cancelled)
    }

    pub fn get(&self, instance_id: &str) -> Option<&WindowInstance> {
        self.instances.get(instance_id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    fn instance(&self, split_id: &str, window: TimeWindow, fire_time: Timestamp) -> WindowInstance {
        WindowInstance::new(
            split_id,
            self.namespace.as_str(),
            self.window_name.as_str(),
            self.window_name.as_str(),
            window,
            fire_time,
        )
    }

    async fn persist(&self, instances: &[WindowInstance]) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.insert_if_absent(instances).await {
            warn!(
                namespace = %self.namespace,
                count = instances.len(),
                error = %e,
                "persisting window instances failed"
            );
        }
    }
}
