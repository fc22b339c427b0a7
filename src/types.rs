use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::params::ParamKey;

/// Two numeric readings closer than this are the same value.
pub(crate) const VALUE_EPSILON: f64 = 0.01;

/// One upstream endpoint and the parameter keys it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RequestGroup {
    Main,
    ChSchedule,
    DhwSchedule,
    Errors,
    Usage,
    OtherParams,
    Units,
    Currency,
    Version,
}

impl RequestGroup {
    pub const ALL: [RequestGroup; 9] = [
        RequestGroup::Main,
        RequestGroup::ChSchedule,
        RequestGroup::DhwSchedule,
        RequestGroup::Errors,
        RequestGroup::Usage,
        RequestGroup::OtherParams,
        RequestGroup::Units,
        RequestGroup::Currency,
        RequestGroup::Version,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestGroup::Main => "main",
            RequestGroup::ChSchedule => "ch_schedule",
            RequestGroup::DhwSchedule => "dhw_schedule",
            RequestGroup::Errors => "errors",
            RequestGroup::Usage => "usage",
            RequestGroup::OtherParams => "other_params",
            RequestGroup::Units => "units",
            RequestGroup::Currency => "currency",
            RequestGroup::Version => "version",
        }
    }
}

impl fmt::Display for RequestGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parameter value as exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Struct(serde_json::Value),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Equality with float tolerance; the device rounds to its step.
    pub fn matches(&self, other: &ParamValue) -> bool {
        match (self, other) {
            (ParamValue::Number(a), ParamValue::Number(b)) => (a - b).abs() < VALUE_EPSILON,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Number(n) => write!(f, "{n}"),
            ParamValue::Text(s) => f.write_str(s),
            ParamValue::Struct(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Number(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorValue {
    pub value: Option<ParamValue>,
    pub unit: Option<String>,
}

impl SensorValue {
    pub fn new(value: Option<ParamValue>, unit: Option<&str>) -> Self {
        Self {
            value,
            unit: unit.map(str::to_string),
        }
    }
}

/// What a writable key currently accepts, as reported by the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AllowedValues {
    Range { min: f64, max: f64, step: f64 },
    Options(Vec<String>),
    Bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub available: bool,
    /// Indexed by zone number minus one.
    pub ch_available: Vec<bool>,
    pub dhw_available: bool,
    pub setting_in_progress: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitMode {
    #[default]
    Metric,
    Imperial,
    Auto,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
}

impl UnitSystem {
    /// Query parameter the web API uses to select units.
    pub fn umsys(&self) -> &'static str {
        match self {
            UnitSystem::Metric => "si",
            UnitSystem::Imperial => "us",
        }
    }

    pub fn temperature_unit(&self) -> &'static str {
        match self {
            UnitSystem::Metric => "\u{00b0}C",
            UnitSystem::Imperial => "\u{00b0}F",
        }
    }

    pub fn energy_unit(&self) -> &'static str {
        match self {
            UnitSystem::Metric => "kWh",
            UnitSystem::Imperial => "kBtu",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitSystem::Metric => "metric",
            UnitSystem::Imperial => "imperial",
        }
    }
}

/// Sensor entries whose exposed value changed since the last notification.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorsChanged {
    pub changes: BTreeMap<ParamKey, SensorValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusChanged {
    pub previous: Availability,
    pub current: Availability,
}
