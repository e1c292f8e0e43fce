//! Window keys and per-window state.

use confluence_core::{TimeWindow, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Write;

use crate::error::StateResult;

/// Identity of one window entry in a [`crate::WindowStore`].
///
/// `operator_name` separates logical operators (e.g. the two sides of a join)
/// that share one state log partition. Keys sort by operator, then window end,
/// so a watermark sweep is a prefix range scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub operator_name: String,
    pub key_hex: String,
    pub window_end: Timestamp,
    pub window_start: Timestamp,
}

impl WindowKey {
    pub fn new(
        operator_name: impl Into<String>,
        key_hex: impl Into<String>,
        window_end: Timestamp,
        window_start: Timestamp,
    ) -> Self {
        Self {
            operator_name: operator_name.into(),
            key_hex: key_hex.into(),
            window_end,
            window_start,
        }
    }

    /// Search key for every entry of `operator_name` with `window_end <= watermark`.
    pub fn prefix(operator_name: impl Into<String>, watermark: Timestamp) -> Self {
        Self::new(operator_name, String::new(), watermark, 0)
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.window_start, self.window_end)
    }

    /// Key-and-window identity used to match entries across join sides.
    pub fn key_and_window(&self) -> (&str, Timestamp, Timestamp) {
        (&self.key_hex, self.window_start, self.window_end)
    }

    pub(crate) fn encode(&self) -> StateResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> StateResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Ord for WindowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.operator_name
            .cmp(&other.operator_name)
            .then(self.window_end.cmp(&other.window_end))
            .then(self.window_start.cmp(&other.window_start))
            .then_with(|| self.key_hex.cmp(&other.key_hex))
    }
}

impl PartialOrd for WindowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Accumulated state of one key in one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowState<K, V> {
    pub key: K,
    pub value: V,
    /// Event time of the record that last wrote this state.
    pub timestamp: Timestamp,
}

impl<K, V> WindowState<K, V> {
    pub fn new(key: K, value: V, timestamp: Timestamp) -> Self {
        Self {
            key,
            value,
            timestamp,
        }
    }
}

/// Lowercase hex of the binary encoding of `key`.
pub fn encode_key_hex<K: Serialize>(key: &K) -> StateResult<String> {
    let bytes = bincode::serialize(key)?;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    Ok(out)
}
