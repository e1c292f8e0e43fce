//! Window assignment and fire-time computation.

use confluence_core::{TimeWindow, Timestamp, WindowSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Every window of `spec` that contains `ts`, ordered by start.
///
/// Window starts are aligned to multiples of the slide since the epoch. A
/// tumbling spec yields exactly one window; a sliding spec yields one per
/// slide step overlapping `ts`, also when the size is not a multiple of the
/// slide.
pub fn assign_windows(spec: &WindowSpec, ts: Timestamp) -> Vec<TimeWindow> {
    let size = spec.size_ms();
    let slide = spec.slide_ms();
    if size == 0 || slide == 0 {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let mut start = ts - ts % slide;
    loop {
        let end = start.saturating_add(size);
        if end <= ts {
            break;
        }
        windows.push(TimeWindow::new(start, end));
        if start < slide {
            break;
        }
        start -= slide;
    }
    windows.reverse();
    windows
}

/// When windows fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireMode {
    /// At `window_end + grace`.
    #[default]
    Normal,
    /// As soon as the window closes, or at the boundary following the
    /// newest event time once processing time has passed the window.
    Early,
}

/// Highest event time seen per split.
#[derive(Debug, Clone, Default)]
pub struct MaxEventTimeTracker {
    by_split: HashMap<String, Timestamp>,
}

impl MaxEventTimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `ts` for `split_id` and return the split's maximum.
    pub fn update(&mut self, split_id: &str, ts: Timestamp) -> Timestamp {
        match self.by_split.get_mut(split_id) {
            Some(max) => {
                *max = (*max).max(ts);
                *max
            }
            None => {
                self.by_split.insert(split_id.to_string(), ts);
                ts
            }
        }
    }

    pub fn get(&self, split_id: &str) -> Option<Timestamp> {
        self.by_split.get(split_id).copied()
    }
}

/// Computes the deadline of each window instance.
#[derive(Debug, Clone)]
pub struct FireTimeCalculator {
    spec: WindowSpec,
    grace_ms: Timestamp,
    mode: FireMode,
    max_event_time: MaxEventTimeTracker,
}

impl FireTimeCalculator {
    pub fn new(spec: WindowSpec, grace_ms: Timestamp, mode: FireMode) -> Self {
        Self {
            spec,
            grace_ms,
            mode,
            max_event_time: MaxEventTimeTracker::new(),
        }
    }

    pub fn mode(&self) -> FireMode {
        self.mode
    }

    pub fn grace_ms(&self) -> Timestamp {
        self.grace_ms
    }

    /// Deadline of `window` for an event at `event_time` on `split_id`.
    ///
    /// Returns `None` when, in early mode, the projected deadline lies beyond
    /// `window.end + grace`: the assignment is too stale to matter.
    pub fn fire_time(
        &mut self,
        window: &TimeWindow,
        event_time: Timestamp,
        split_id: &str,
        now: Timestamp,
    ) -> Option<Timestamp> {
        match self.mode {
            FireMode::Normal => Some(window.end.saturating_add(self.grace_ms)),
            FireMode::Early => {
                if now < window.end {
                    return Some(window.end);
                }
                let max = self.max_event_time.update(split_id, event_time);
                let fire = assign_windows(&self.spec, max)
                    .last()
                    .map(|w| w.end)
                    .unwrap_or(window.end);
                if fire.saturating_sub(window.end) > self.grace_ms {
                    None
                } else {
                    Some(fire)
                }
            }
        }
    }
}
