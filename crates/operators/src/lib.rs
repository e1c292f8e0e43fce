//! Windowed operators.
//!
//! ## Join
//! - [`JoinWindowProcessor`] - Inner, left and right joins of two keyed
//!   streams over tumbling or sliding windows
//!
//! ## Aggregation
//! - [`WindowAggregateProcessor`] - Per-key accumulation, fired through
//!   [`WindowInstanceRegistry`]
//!
//! ## Building blocks
//! - [`assign_windows`] - Windows containing a timestamp
//! - [`FireTimeCalculator`] - Normal and early fire deadlines
//! - [`InstanceStore`] - Durable window instance metadata

pub mod window;

pub use window::{
    assign_windows, split_name, AggregateWindowConfig, FireMode, FireTimeCalculator,
    InstanceStatus, InstanceStore, JoinInput, JoinWindowConfig, JoinWindowProcessor,
    MaxEventTimeTracker, MemoryInstanceStore, PendingQuery, TimeUnit, ValueJoiner,
    WindowAggregateProcessor, WindowConfig, WindowInstance, WindowInstanceRegistry,
};
