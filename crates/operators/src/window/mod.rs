//! Window operators: stream-stream join and aggregation.

mod aggregate;
mod assigner;
mod config;
mod instance;
mod join;
mod registry;

pub use aggregate::WindowAggregateProcessor;
pub use assigner::{assign_windows, FireMode, FireTimeCalculator, MaxEventTimeTracker};
pub use config::{AggregateWindowConfig, JoinWindowConfig, TimeUnit, WindowConfig};
pub use instance::{
    split_name, InstanceStatus, InstanceStore, MemoryInstanceStore, PendingQuery, WindowInstance,
};
pub use join::{JoinInput, JoinWindowProcessor, ValueJoiner};
pub use registry::WindowInstanceRegistry;
