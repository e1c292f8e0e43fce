//! Core types shared across the engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Milliseconds since Unix epoch (or any monotonic-ish reference; up to the source).
pub type Timestamp = u64;

/// Header carrying the [`StreamSide`] of a join input.
pub const STREAM_TAG: &str = "stream_tag";
/// Header carrying the start of the window a result was fired for.
pub const WINDOW_START_TIME: &str = "window_start_time";
/// Header carrying the end of the window a result was fired for.
pub const WINDOW_END_TIME: &str = "window_end_time";

/// Suffix appended to a source topic to name its state topic.
pub const STATE_TOPIC_SUFFIX: &str = "-state";

/// Messages flowing into a partition worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamMessage<T> {
    Data(T),
    /// Event-time watermark.
    Watermark(Timestamp),
    /// End of stream (for bounded inputs / controlled shutdown).
    End,
}

/// Event-time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// End is exclusive for assignment.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Shape of the windows an event is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowSpec {
    /// Fixed-size, non-overlapping windows.
    Tumbling { size_ms: Timestamp },
    /// Fixed-size windows advancing by `slide_ms`.
    Sliding {
        size_ms: Timestamp,
        slide_ms: Timestamp,
    },
}

impl WindowSpec {
    pub fn tumbling(size_ms: Timestamp) -> Self {
        WindowSpec::Tumbling { size_ms }
    }

    pub fn sliding(size_ms: Timestamp, slide_ms: Timestamp) -> Self {
        WindowSpec::Sliding { size_ms, slide_ms }
    }

    pub fn size_ms(&self) -> Timestamp {
        match self {
            WindowSpec::Tumbling { size_ms } | WindowSpec::Sliding { size_ms, .. } => *size_ms,
        }
    }

    /// Tumbling windows slide by their own size.
    pub fn slide_ms(&self) -> Timestamp {
        match self {
            WindowSpec::Tumbling { size_ms } => *size_ms,
            WindowSpec::Sliding { slide_ms, .. } => *slide_ms,
        }
    }
}

/// Which input of a two-stream join an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamSide {
    Left,
    Right,
}

impl StreamSide {
    pub fn name(&self) -> &'static str {
        match self {
            StreamSide::Left => "LEFT_STREAM",
            StreamSide::Right => "RIGHT_STREAM",
        }
    }
}

impl fmt::Display for StreamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Firing policy of a windowed join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Emit only for key-and-window matches present on both sides.
    #[default]
    Inner,
    /// Every left entry fires, with the first right match or nothing.
    Left,
    /// Mirror of [`JoinType::Left`].
    Right,
}

/// A single header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderValue {
    Int(u64),
    Str(String),
    Side(StreamSide),
}

/// Per-record metadata map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: HeaderValue) -> Option<HeaderValue> {
        self.0.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<u64> {
        match self.0.get(name) {
            Some(HeaderValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn stream_side(&self) -> Option<StreamSide> {
        match self.0.get(STREAM_TAG) {
            Some(HeaderValue::Side(side)) => Some(*side),
            _ => None,
        }
    }

    pub fn with_side(mut self, side: StreamSide) -> Self {
        self.insert(STREAM_TAG, HeaderValue::Side(side));
        self
    }

    /// Stamp the bounds of the window a result was fired for.
    pub fn set_window(&mut self, window: TimeWindow) {
        self.insert(WINDOW_START_TIME, HeaderValue::Int(window.start));
        self.insert(WINDOW_END_TIME, HeaderValue::Int(window.end));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A keyed, timestamped record with its headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<K, V> {
    pub key: K,
    pub value: V,
    pub timestamp: Timestamp,
    pub headers: Headers,
}

impl<K, V> Record<K, V> {
    pub fn new(key: K, value: V, timestamp: Timestamp) -> Self {
        Self {
            key,
            value,
            timestamp,
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// A source partition: one queue of one topic on one broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub topic: String,
    pub broker: String,
    pub queue_id: u32,
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, broker: impl Into<String>, queue_id: u32) -> Self {
        Self {
            topic: topic.into(),
            broker: broker.into(),
            queue_id,
        }
    }

    /// The partition of the state topic that backs this source partition.
    pub fn state_partition(&self) -> PartitionId {
        PartitionId {
            topic: format!("{}{}", self.topic, STATE_TOPIC_SUFFIX),
            broker: self.broker.clone(),
            queue_id: self.queue_id,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}@{}", self.broker, self.topic, self.queue_id)
    }
}
