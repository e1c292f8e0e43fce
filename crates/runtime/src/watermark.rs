//! Per-partition watermark tracking.

use confluence_core::Timestamp;
use serde::{Deserialize, Serialize};

/// How a partition's watermark advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatermarkPolicy {
    /// Only explicit watermark messages move it.
    #[default]
    External,
    /// `max(event_time) - allowed_lateness_ms`, updated before each record.
    BoundedLateness { allowed_lateness_ms: Timestamp },
}

/// Watermark of one partition: no record older than it is expected.
///
/// The value never decreases.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    policy: WatermarkPolicy,
    watermark: Timestamp,
    max_event_time: Option<Timestamp>,
}

impl WatermarkTracker {
    pub fn new(policy: WatermarkPolicy) -> Self {
        Self {
            policy,
            watermark: 0,
            max_event_time: None,
        }
    }

    pub fn current(&self) -> Timestamp {
        self.watermark
    }

    pub fn max_event_time(&self) -> Option<Timestamp> {
        self.max_event_time
    }

    /// Move the watermark forward. Returns false if `wm` is not ahead.
    pub fn advance_to(&mut self, wm: Timestamp) -> bool {
        if wm <= self.watermark {
            return false;
        }
        self.watermark = wm;
        true
    }

    /// Record an event time and apply the policy. Returns the watermark.
    pub fn observe(&mut self, event_time: Timestamp) -> Timestamp {
        let max = self.max_event_time.map_or(event_time, |m| m.max(event_time));
        self.max_event_time = Some(max);
        if let WatermarkPolicy::BoundedLateness {
            allowed_lateness_ms,
        } = self.policy
        {
            self.advance_to(max.saturating_sub(allowed_lateness_ms));
        }
        self.watermark
    }

    /// Events strictly older than the watermark are late.
    pub fn is_late(&self, event_time: Timestamp) -> bool {
        event_time < self.watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_policy_ignores_events() {
        let mut wm = WatermarkTracker::new(WatermarkPolicy::External);
        assert_eq!(wm.observe(10_000), 0);
        assert!(wm.advance_to(5_000));
        assert!(!wm.advance_to(4_000));
        assert_eq!(wm.current(), 5_000);
        assert_eq!(wm.max_event_time(), Some(10_000));
    }

    #[test]
    fn test_bounded_lateness_is_monotonic() {
        let mut wm = WatermarkTracker::new(WatermarkPolicy::BoundedLateness {
            allowed_lateness_ms: 2_000,
        });
        assert_eq!(wm.observe(10_000), 8_000);
        assert_eq!(wm.observe(3_000), 8_000);
        assert!(wm.is_late(7_999));
        assert!(!wm.is_late(8_000));
        assert_eq!(wm.observe(1_000), 8_000);
    }

    #[test]
    fn test_lateness_larger_than_time_saturates() {
        let mut wm = WatermarkTracker::new(WatermarkPolicy::BoundedLateness {
            allowed_lateness_ms: 60_000,
        });
        assert_eq!(wm.observe(1_000), 0);
    }
}
