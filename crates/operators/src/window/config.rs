// ============================================================================
// Window Operator Configuration Structs
// ============================================================================

use anyhow::{bail, Result};
use confluence_core::{JoinType, Timestamp, WindowSpec};
use serde::{Deserialize, Serialize};

use super::assigner::FireMode;

/// Unit the sizes of a [`WindowConfig`] are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Millis,
    #[default]
    Seconds,
    Minutes,
}

impl TimeUnit {
    pub fn as_millis(&self) -> Timestamp {
        match self {
            TimeUnit::Millis => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Window size, in `time_unit`.
    pub size: u64,
    /// Slide interval, in `time_unit`; 0 means tumbling.
    pub slide: u64,
    /// How long past its end a window still accepts data, in `time_unit`.
    pub grace: u64,
    pub time_unit: TimeUnit,
    pub fire_mode: FireMode,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size: 60,
            slide: 0,
            grace: 0,
            time_unit: TimeUnit::Seconds,
            fire_mode: FireMode::Normal,
        }
    }
}

impl WindowConfig {
    pub fn tumbling(size: u64, time_unit: TimeUnit) -> Self {
        Self {
            size,
            time_unit,
            ..Self::default()
        }
    }

    pub fn sliding(size: u64, slide: u64, time_unit: TimeUnit) -> Self {
        Self {
            size,
            slide,
            time_unit,
            ..Self::default()
        }
    }

    pub fn with_grace(mut self, grace: u64) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_fire_mode(mut self, fire_mode: FireMode) -> Self {
        self.fire_mode = fire_mode;
        self
    }

    pub fn spec(&self) -> WindowSpec {
        let unit = self.time_unit.as_millis();
        let size_ms = self.size.saturating_mul(unit);
        if self.slide == 0 || self.slide == self.size {
            WindowSpec::tumbling(size_ms)
        } else {
            WindowSpec::sliding(size_ms, self.slide.saturating_mul(unit))
        }
    }

    pub fn grace_ms(&self) -> Timestamp {
        self.grace.saturating_mul(self.time_unit.as_millis())
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            bail!("window size must be positive");
        }
        if self.slide > self.size {
            bail!(
                "window slide ({}) larger than size ({}) would leave gaps",
                self.slide,
                self.size
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinWindowConfig {
    /// Operator name; also prefixes the state keys of both sides.
    pub name: String,
    /// Size and slide only: joins fire once `window_end <= watermark`, so
    /// `grace` must stay 0 and `fire_mode` normal.
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub join_type: JoinType,
}

impl JoinWindowConfig {
    pub fn new(name: impl Into<String>, window: WindowConfig, join_type: JoinType) -> Self {
        Self {
            name: name.into(),
            window,
            join_type,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("join operator name must not be empty");
        }
        if self.window.grace != 0 {
            bail!("join {} does not support a grace period", self.name);
        }
        if self.window.fire_mode != FireMode::Normal {
            bail!("join {} only fires in normal mode", self.name);
        }
        self.window.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateWindowConfig {
    /// Operator name; prefixes the state keys.
    pub name: String,
    /// Namespace of the window instances.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub window: WindowConfig,
    /// Skip instance metadata persistence and rely on state replay alone.
    #[serde(default = "default_local_storage_only")]
    pub local_storage_only: bool,
}

fn default_local_storage_only() -> bool {
    true
}

impl AggregateWindowConfig {
    pub fn new(name: impl Into<String>, window: WindowConfig) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
            window,
            local_storage_only: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("aggregate operator name must not be empty");
        }
        self.window.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_are_scaled_to_millis() {
        let config = WindowConfig::sliding(60, 20, TimeUnit::Seconds).with_grace(5);
        assert_eq!(config.spec(), WindowSpec::sliding(60_000, 20_000));
        assert_eq!(config.grace_ms(), 5_000);
    }

    #[test]
    fn test_equal_slide_is_tumbling() {
        let config = WindowConfig::sliding(10, 10, TimeUnit::Millis);
        assert_eq!(config.spec(), WindowSpec::tumbling(10));
    }

    #[test]
    fn test_invalid_windows_are_rejected() {
        assert!(WindowConfig::tumbling(0, TimeUnit::Seconds).validate().is_err());
        assert!(WindowConfig::sliding(10, 20, TimeUnit::Seconds).validate().is_err());
        assert!(JoinWindowConfig::new("", WindowConfig::default(), JoinType::Inner)
            .validate()
            .is_err());
    }

    #[test]
    fn test_join_rejects_grace_and_early_fire() {
        let window = WindowConfig::tumbling(10, TimeUnit::Seconds);
        assert!(JoinWindowConfig::new("j", window.clone(), JoinType::Inner)
            .validate()
            .is_ok());
        assert!(JoinWindowConfig::new("j", window.clone().with_grace(5), JoinType::Inner)
            .validate()
            .is_err());
        assert!(
            JoinWindowConfig::new("j", window.with_fire_mode(FireMode::Early), JoinType::Left)
                .validate()
                .is_err()
        );

        let early: JoinWindowConfig = serde_json::from_str(
            r#"{"name": "j", "window": {"size": 30, "fire_mode": "early"}}"#,
        )
        .unwrap();
        assert!(early.validate().is_err());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config: JoinWindowConfig = serde_json::from_str(
            r#"{"name": "orders-payments", "join_type": "left", "window": {"size": 30}}"#,
        )
        .unwrap();
        assert_eq!(config.join_type, JoinType::Left);
        assert_eq!(config.window.time_unit, TimeUnit::Seconds);
        assert_eq!(config.window.spec(), WindowSpec::tumbling(30_000));

        let agg: AggregateWindowConfig = serde_json::from_str(r#"{"name": "clicks"}"#).unwrap();
        assert!(agg.local_storage_only);
    }
}
