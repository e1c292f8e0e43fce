//! Window instances and their optional durable metadata store.

use anyhow::{bail, Result};
use async_trait::async_trait;
use confluence_core::{TimeWindow, Timestamp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle state of a [`WindowInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    Pending,
    Fired,
    Cancelled,
}

impl InstanceStatus {
    /// Persisted status code.
    pub fn code(&self) -> i8 {
        match self {
            InstanceStatus::Pending => 0,
            InstanceStatus::Fired => 1,
            InstanceStatus::Cancelled => -1,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(InstanceStatus::Pending),
            1 => Some(InstanceStatus::Fired),
            -1 => Some(InstanceStatus::Cancelled),
            _ => None,
        }
    }
}

/// One concrete window of one operator on one split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInstance {
    pub split_id: String,
    pub namespace: String,
    pub window_name: String,
    pub instance_name: String,
    pub window: TimeWindow,
    /// Event time at which the window is due.
    pub fire_time: Timestamp,
    pub status: InstanceStatus,
    /// 1 on first consumption; bumped each time the instance is recovered.
    pub version: u32,
    #[serde(skip)]
    pub is_new: bool,
}

impl WindowInstance {
    pub fn new(
        split_id: impl Into<String>,
        namespace: impl Into<String>,
        window_name: impl Into<String>,
        instance_name: impl Into<String>,
        window: TimeWindow,
        fire_time: Timestamp,
    ) -> Self {
        Self {
            split_id: split_id.into(),
            namespace: namespace.into(),
            window_name: window_name.into(),
            instance_name: instance_name.into(),
            window,
            fire_time,
            status: InstanceStatus::Pending,
            version: 1,
            is_new: true,
        }
    }

    /// Stable identity; independent of fire time and status.
    pub fn instance_id(&self) -> String {
        format!(
            "{};{};{};{};{};{}",
            self.split_id,
            self.namespace,
            self.window_name,
            self.instance_name,
            self.window.start,
            self.window.end
        )
    }

    /// Identity of the split within this operator, used to query the store.
    pub fn split_name(&self) -> String {
        split_name(&self.namespace, &self.window_name, &self.split_id)
    }

    pub fn is_pending(&self) -> bool {
        self.status == InstanceStatus::Pending
    }
}

pub fn split_name(namespace: &str, window_name: &str, split_id: &str) -> String {
    format!("{namespace};{window_name};{split_id}")
}

/// Selects pending instances of some splits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    pub split_names: Vec<String>,
    /// Only instances with `fire_time` strictly before this are returned.
    pub before: Timestamp,
}

/// Durable store of window instance metadata.
///
/// Used by operators that recover their pending windows from a database
/// rather than from state replay alone. Callers treat failures as
/// best-effort: they are logged and the in-memory registry stays
/// authoritative.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    /// Insert every instance not already present; returns how many were new.
    async fn insert_if_absent(&self, instances: &[WindowInstance]) -> Result<usize>;

    async fn query_pending(&self, query: &PendingQuery) -> Result<Vec<WindowInstance>>;

    /// Remove by instance id; returns how many existed.
    async fn delete(&self, instances: &[WindowInstance]) -> Result<usize>;
}

/// In-process [`InstanceStore`].
#[derive(Debug)]
pub struct MemoryInstanceStore {
    instances: DashMap<String, WindowInstance>,
    available: AtomicBool,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Make every call fail while `available` is false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn check_available(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            bail!("instance store unavailable");
        }
        Ok(())
    }
}

impl Default for MemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn insert_if_absent(&self, instances: &[WindowInstance]) -> Result<usize> {
        self.check_available()?;
        let mut inserted = 0;
        for instance in instances {
            self.instances
                .entry(instance.instance_id())
                .or_insert_with(|| {
                    inserted += 1;
                    WindowInstance {
                        is_new: false,
                        ..instance.clone()
                    }
                });
        }
        Ok(inserted)
    }

    async fn query_pending(&self, query: &PendingQuery) -> Result<Vec<WindowInstance>> {
        self.check_available()?;
        let mut found: Vec<WindowInstance> = self
            .instances
            .iter()
            .filter(|e| {
                let instance = e.value();
                instance.is_pending()
                    && instance.fire_time < query.before
                    && query.split_names.contains(&instance.split_name())
            })
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|i| (i.window.end, i.window.start));
        Ok(found)
    }

    async fn delete(&self, instances: &[WindowInstance]) -> Result<usize> {
        self.check_available()?;
        Ok(instances
            .iter()
            .filter(|i| self.instances.remove(&i.instance_id()).is_some())
            .count())
    }
}
