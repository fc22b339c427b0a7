use std::time::Duration;

use serde::Deserialize;

use crate::params::{BaseParam, MAX_ZONES};
use crate::protocol::DEFAULT_BASE_URL;
use crate::types::{RequestGroup, UnitMode};
use crate::writes::DEFAULT_MAX_RETRIES;
use crate::{Error, Result};

/// Scheduler tick at a poll multiplier of 1.
pub const BASE_TICK: Duration = Duration::from_secs(30);
/// Extra wait after a set before it is retried or considered ignored.
pub const SET_WAIT: Duration = Duration::from_secs(30);

const MIN_POLL_MULTIPLIER: f64 = 1.0;
const MAX_POLL_MULTIPLIER: f64 = 10.0;

const LOW_PRIORITY: [RequestGroup; 6] = [
    RequestGroup::ChSchedule,
    RequestGroup::DhwSchedule,
    RequestGroup::Errors,
    RequestGroup::Usage,
    RequestGroup::Currency,
    RequestGroup::Version,
];

/// Engine settings, loadable from any serde format.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub username: String,
    pub password: String,
    /// Plant id the account must resolve to.
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_poll_multiplier")]
    pub poll_multiplier: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub units: UnitMode,
    /// Base parameter names to mirror. `None` mirrors all of them.
    #[serde(default)]
    pub enabled: Option<Vec<String>>,
    #[serde(default = "default_zones")]
    pub zones: u8,
    #[serde(default = "default_set_debounce_secs")]
    pub set_debounce_secs: f64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_owned()
}

fn default_poll_multiplier() -> f64 {
    1.0
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_zones() -> u8 {
    1
}

fn default_set_debounce_secs() -> f64 {
    2.0
}

impl EngineConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            gateway: None,
            base_url: default_base_url(),
            poll_multiplier: default_poll_multiplier(),
            max_retries: default_max_retries(),
            units: UnitMode::default(),
            enabled: None,
            zones: default_zones(),
            set_debounce_secs: default_set_debounce_secs(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() || self.password.is_empty() {
            return Err(Error::Config("username and password are required".into()));
        }
        if self.zones == 0 || self.zones > MAX_ZONES {
            return Err(Error::Config(format!(
                "zones must be between 1 and {MAX_ZONES}, got {}",
                self.zones
            )));
        }
        if !self.poll_multiplier.is_finite() {
            return Err(Error::Config("poll_multiplier must be a number".into()));
        }
        if !self.set_debounce_secs.is_finite() || self.set_debounce_secs < 0.0 {
            return Err(Error::Config(
                "set_debounce_secs must be a non-negative number".into(),
            ));
        }
        if let Some(names) = &self.enabled
            && let Some(bad) = names.iter().find(|n| BaseParam::from_name(n).is_none())
        {
            return Err(Error::Config(format!("unknown parameter {bad:?}")));
        }
        Ok(())
    }

    /// Enabled base parameters. `units` is always part of the set.
    pub fn enabled_params(&self) -> Vec<BaseParam> {
        let mut params: Vec<BaseParam> = match &self.enabled {
            None => BaseParam::ALL.to_vec(),
            Some(names) => names.iter().filter_map(|n| BaseParam::from_name(n)).collect(),
        };
        if !params.contains(&BaseParam::Units) {
            params.push(BaseParam::Units);
        }
        params.sort();
        params.dedup();
        params
    }

    pub fn poll_interval(&self) -> Duration {
        BASE_TICK.mul_f64(
            self.poll_multiplier
                .clamp(MIN_POLL_MULTIPLIER, MAX_POLL_MULTIPLIER),
        )
    }

    pub fn set_debounce(&self) -> Duration {
        Duration::from_secs_f64(self.set_debounce_secs.max(0.0))
    }

    /// Wait before a failed set is retried or an unconfirmed one resubmitted.
    pub fn set_retry_wait(&self) -> Duration {
        self.poll_interval() + SET_WAIT
    }

    /// High-priority groups: Main, OtherParams when any enabled key is read
    /// from it, Units in automatic unit mode.
    pub fn high_priority_groups(&self) -> Vec<RequestGroup> {
        let read_groups = self.read_groups();
        let mut groups = vec![RequestGroup::Main];
        if read_groups.contains(&RequestGroup::OtherParams) {
            groups.push(RequestGroup::OtherParams);
        }
        if self.units == UnitMode::Auto {
            groups.push(RequestGroup::Units);
        }
        groups
    }

    pub fn low_priority_groups(&self) -> Vec<RequestGroup> {
        let read_groups = self.read_groups();
        LOW_PRIORITY
            .into_iter()
            .filter(|g| read_groups.contains(g))
            .collect()
    }

    fn read_groups(&self) -> Vec<RequestGroup> {
        self.enabled_params()
            .iter()
            .map(|p| p.descriptor().read_group)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_minimal_json() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"username": "a@b.c", "password": "pw"}"#).unwrap();
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.zones, 1);
        assert_eq!(cfg.units, UnitMode::Metric);
        assert_eq!(cfg.set_debounce(), Duration::from_secs(2));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = EngineConfig::new("a", "");
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        cfg.password = "pw".into();
        cfg.zones = 4;
        assert!(matches!(cfg.validate(), Err(Error::Config(msg)) if msg.contains("zones")));

        cfg.zones = 2;
        cfg.enabled = Some(vec!["mode".into(), "warp_drive".into()]);
        assert!(matches!(cfg.validate(), Err(Error::Config(msg)) if msg.contains("warp_drive")));
    }

    #[test]
    fn poll_interval_is_clamped() {
        let mut cfg = EngineConfig::new("a", "b");
        cfg.poll_multiplier = 0.1;
        assert_eq!(cfg.poll_interval(), Duration::from_secs(30));
        cfg.poll_multiplier = 2.0;
        assert_eq!(cfg.poll_interval(), Duration::from_secs(60));
        assert_eq!(cfg.set_retry_wait(), Duration::from_secs(90));
        cfg.poll_multiplier = 50.0;
        assert_eq!(cfg.poll_interval(), Duration::from_secs(300));
    }

    #[test]
    fn groups_follow_enabled_keys() {
        let mut cfg = EngineConfig::new("a", "b");
        cfg.enabled = Some(vec!["mode".into(), "ch_comfort_temperature".into(), "errors".into()]);
        assert_eq!(cfg.high_priority_groups(), vec![RequestGroup::Main]);
        assert_eq!(cfg.low_priority_groups(), vec![RequestGroup::Errors]);

        cfg.enabled = Some(vec!["signal_strength".into()]);
        cfg.units = UnitMode::Auto;
        assert_eq!(
            cfg.high_priority_groups(),
            vec![RequestGroup::Main, RequestGroup::OtherParams, RequestGroup::Units]
        );
        assert!(cfg.low_priority_groups().is_empty());
    }

    #[test]
    fn units_always_enabled() {
        let mut cfg = EngineConfig::new("a", "b");
        cfg.enabled = Some(vec!["mode".into()]);
        assert_eq!(cfg.enabled_params(), vec![BaseParam::Mode, BaseParam::Units]);
        cfg.enabled = None;
        assert_eq!(cfg.enabled_params().len(), BaseParam::ALL.len());
    }
}
