//! Durable, replayable window state.
//!
//! Window state lives in an in-memory index for reads and in an append-only
//! [`StateLog`] for recovery:
//! - [`WindowStore`]: keyed, range-queryable store of [`WindowState`] entries
//! - [`MemoryStateLog`]: in-process log (tests, single-process deployments)
//! - [`FileStateLog`]: one checksummed segment file per state partition
//!
//! A store must be replayed with [`WindowStore::wait_for_replay`] before it
//! accepts reads or writes.
//!
//! # Example
//!
//! ```ignore
//! use confluence_state::{MemoryStateLog, WindowKey, WindowState, WindowStore};
//!
//! let log = Arc::new(MemoryStateLog::new());
//! let mut store: WindowStore<String, i64> = WindowStore::new(log, partition, "sum");
//! store.wait_for_replay().await?;
//! store.put(WindowKey::new("sum", "6b", 60_000, 0), WindowState::new("k".into(), 1, 10)).await?;
//! let due = store.search_less_than_or_equal_watermark(&WindowKey::prefix("sum", 60_000))?;
//! ```

mod codec;
mod error;
pub mod file;
pub mod memory;
mod store;
mod traits;
mod window;

pub use codec::{BincodeCodec, JsonCodec};
pub use error::{StateError, StateResult};
pub use file::{FileStateLog, FileStateLogConfig};
pub use memory::MemoryStateLog;
pub use store::WindowStore;
pub use traits::{LogRecord, StateCodec, StateLog, StateValue};
pub use window::{encode_key_hex, WindowKey, WindowState};
