//! Static parameter catalogue.
//!
//! Every key the engine knows is a [`BaseParam`] paired with a zone number.
//! Zoned parameters get a `_zone_N` suffix for zones 2 and up; zone 1 keeps the
//! bare name. The per-engine key table is built once by [`build_zone_key_map`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::types::{RequestGroup, UnitSystem};

pub const MAX_ZONES: u8 = 3;

const ZONE_SUFFIX: &str = "_zone_";

pub const MODE_OPTIONS: &[(i64, &str)] = &[
    (0, "summer"),
    (1, "winter"),
    (2, "heating_only"),
    (3, "cooling"),
    (5, "off"),
];

pub const CH_MODE_OPTIONS: &[(i64, &str)] = &[(0, "off"), (1, "manual"), (2, "program")];

pub const UNITS_OPTIONS: &[(i64, &str)] = &[(0, "metric"), (1, "imperial")];

pub fn option_label(table: &[(i64, &'static str)], code: i64) -> Option<&'static str> {
    table.iter().find(|(c, _)| *c == code).map(|(_, l)| *l)
}

pub fn option_code(table: &[(i64, &str)], label: &str) -> Option<i64> {
    table.iter().find(|(_, l)| *l == label).map(|(c, _)| *c)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BaseParam {
    Mode,
    HolidayMode,
    OutsideTemperature,
    Flame,
    HeatPump,
    DhwSetTemperature,
    DhwStorageTemperature,
    ChMode,
    ChSetTemperature,
    ChComfortTemperature,
    ChEconomyTemperature,
    ChDetectedTemperature,
    ChFlame,
    ChPilot,
    ChProgram,
    DhwProgram,
    Errors,
    ErrorsCount,
    ChEnergyToday,
    DhwEnergyToday,
    ChEnergyThisMonth,
    DhwEnergyThisMonth,
    ChAutoFunction,
    DhwComfortTemperature,
    DhwEconomyTemperature,
    DhwThermalCleanseFunction,
    FlowTemperature,
    SignalStrength,
    Units,
    Currency,
    GasType,
    FirmwareVersion,
}

/// Value shape of a parameter. Drives validation, wire encoding and
/// sanitizing from a single match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    /// `sanitized` keys go through the zero-reading filter.
    Temperature { sanitized: bool },
    Number,
    Bool,
    Options(&'static [(i64, &'static str)]),
    Text,
    Structured,
}

/// Where a write for this parameter is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRoute {
    ReadOnly,
    Direct(RequestGroup),
    /// Resolved per request against the zone's active schedule slot.
    ScheduleAliased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitClass {
    None,
    Temperature,
    Energy,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamDescriptor {
    pub name: &'static str,
    pub kind: ParamKind,
    pub read_group: RequestGroup,
    pub write: WriteRoute,
    pub zoned: bool,
    /// Survives an availability purge.
    pub persistent: bool,
    pub unit: UnitClass,
    /// Menu entry id in the OtherParams endpoints.
    pub menu_id: Option<&'static str>,
}

const fn desc(
    name: &'static str,
    kind: ParamKind,
    read_group: RequestGroup,
    write: WriteRoute,
    unit: UnitClass,
) -> ParamDescriptor {
    ParamDescriptor {
        name,
        kind,
        read_group,
        write,
        zoned: false,
        persistent: false,
        unit,
        menu_id: None,
    }
}

const fn zoned(d: ParamDescriptor) -> ParamDescriptor {
    ParamDescriptor { zoned: true, ..d }
}

const fn menu(d: ParamDescriptor, id: &'static str) -> ParamDescriptor {
    ParamDescriptor {
        menu_id: Some(id),
        ..d
    }
}

const TEMP: ParamKind = ParamKind::Temperature { sanitized: false };
const SANITIZED_TEMP: ParamKind = ParamKind::Temperature { sanitized: true };
const RO: WriteRoute = WriteRoute::ReadOnly;
const WRITE_MAIN: WriteRoute = WriteRoute::Direct(RequestGroup::Main);
const WRITE_PARAMS: WriteRoute = WriteRoute::Direct(RequestGroup::OtherParams);

impl BaseParam {
    pub const ALL: [BaseParam; 32] = [
        BaseParam::Mode,
        BaseParam::HolidayMode,
        BaseParam::OutsideTemperature,
        BaseParam::Flame,
        BaseParam::HeatPump,
        BaseParam::DhwSetTemperature,
        BaseParam::DhwStorageTemperature,
        BaseParam::ChMode,
        BaseParam::ChSetTemperature,
        BaseParam::ChComfortTemperature,
        BaseParam::ChEconomyTemperature,
        BaseParam::ChDetectedTemperature,
        BaseParam::ChFlame,
        BaseParam::ChPilot,
        BaseParam::ChProgram,
        BaseParam::DhwProgram,
        BaseParam::Errors,
        BaseParam::ErrorsCount,
        BaseParam::ChEnergyToday,
        BaseParam::DhwEnergyToday,
        BaseParam::ChEnergyThisMonth,
        BaseParam::DhwEnergyThisMonth,
        BaseParam::ChAutoFunction,
        BaseParam::DhwComfortTemperature,
        BaseParam::DhwEconomyTemperature,
        BaseParam::DhwThermalCleanseFunction,
        BaseParam::FlowTemperature,
        BaseParam::SignalStrength,
        BaseParam::Units,
        BaseParam::Currency,
        BaseParam::GasType,
        BaseParam::FirmwareVersion,
    ];

    pub fn descriptor(self) -> ParamDescriptor {
        use RequestGroup as G;
        use UnitClass as U;
        match self {
            BaseParam::Mode => desc(
                "mode",
                ParamKind::Options(MODE_OPTIONS),
                G::Main,
                WRITE_MAIN,
                U::None,
            ),
            BaseParam::HolidayMode => desc("holiday_mode", ParamKind::Bool, G::Main, RO, U::None),
            BaseParam::OutsideTemperature => desc(
                "outside_temperature",
                SANITIZED_TEMP,
                G::Main,
                RO,
                U::Temperature,
            ),
            BaseParam::Flame => desc("flame", ParamKind::Bool, G::Main, RO, U::None),
            BaseParam::HeatPump => desc("heat_pump", ParamKind::Bool, G::Main, RO, U::None),
            BaseParam::DhwSetTemperature => desc(
                "dhw_set_temperature",
                TEMP,
                G::Main,
                WRITE_MAIN,
                U::Temperature,
            ),
            BaseParam::DhwStorageTemperature => desc(
                "dhw_storage_temperature",
                SANITIZED_TEMP,
                G::Main,
                RO,
                U::Temperature,
            ),
            BaseParam::ChMode => zoned(desc(
                "ch_mode",
                ParamKind::Options(CH_MODE_OPTIONS),
                G::Main,
                WRITE_MAIN,
                U::None,
            )),
            BaseParam::ChSetTemperature => zoned(desc(
                "ch_set_temperature",
                TEMP,
                G::Main,
                WriteRoute::ScheduleAliased,
                U::Temperature,
            )),
            // Read from the zone block of Main, written through the menu.
            BaseParam::ChComfortTemperature => zoned(menu(
                desc(
                    "ch_comfort_temperature",
                    TEMP,
                    G::Main,
                    WRITE_PARAMS,
                    U::Temperature,
                ),
                "U6_9_0",
            )),
            BaseParam::ChEconomyTemperature => zoned(menu(
                desc(
                    "ch_economy_temperature",
                    TEMP,
                    G::Main,
                    WRITE_PARAMS,
                    U::Temperature,
                ),
                "U6_9_1",
            )),
            BaseParam::ChDetectedTemperature => zoned(desc(
                "ch_detected_temperature",
                SANITIZED_TEMP,
                G::Main,
                RO,
                U::Temperature,
            )),
            BaseParam::ChFlame => zoned(desc("ch_flame", ParamKind::Bool, G::Main, RO, U::None)),
            BaseParam::ChPilot => zoned(desc("ch_pilot", ParamKind::Bool, G::Main, RO, U::None)),
            BaseParam::ChProgram => zoned(desc(
                "ch_program",
                ParamKind::Structured,
                G::ChSchedule,
                RO,
                U::None,
            )),
            BaseParam::DhwProgram => desc(
                "dhw_program",
                ParamKind::Structured,
                G::DhwSchedule,
                RO,
                U::None,
            ),
            BaseParam::Errors => desc("errors", ParamKind::Structured, G::Errors, RO, U::None),
            BaseParam::ErrorsCount => {
                desc("errors_count", ParamKind::Number, G::Errors, RO, U::None)
            }
            BaseParam::ChEnergyToday => {
                desc("ch_energy_today", ParamKind::Number, G::Usage, RO, U::Energy)
            }
            BaseParam::DhwEnergyToday => {
                desc("dhw_energy_today", ParamKind::Number, G::Usage, RO, U::Energy)
            }
            BaseParam::ChEnergyThisMonth => desc(
                "ch_energy_this_month",
                ParamKind::Number,
                G::Usage,
                RO,
                U::Energy,
            ),
            BaseParam::DhwEnergyThisMonth => desc(
                "dhw_energy_this_month",
                ParamKind::Number,
                G::Usage,
                RO,
                U::Energy,
            ),
            BaseParam::ChAutoFunction => menu(
                desc(
                    "ch_auto_function",
                    ParamKind::Bool,
                    G::OtherParams,
                    WRITE_PARAMS,
                    U::None,
                ),
                "U6_16",
            ),
            BaseParam::DhwComfortTemperature => menu(
                desc(
                    "dhw_comfort_temperature",
                    TEMP,
                    G::OtherParams,
                    WRITE_PARAMS,
                    U::Temperature,
                ),
                "U6_3_1",
            ),
            BaseParam::DhwEconomyTemperature => menu(
                desc(
                    "dhw_economy_temperature",
                    TEMP,
                    G::OtherParams,
                    WRITE_PARAMS,
                    U::Temperature,
                ),
                "U6_3_2",
            ),
            BaseParam::DhwThermalCleanseFunction => menu(
                desc(
                    "dhw_thermal_cleanse_function",
                    ParamKind::Bool,
                    G::OtherParams,
                    WRITE_PARAMS,
                    U::None,
                ),
                "U6_3_5",
            ),
            BaseParam::FlowTemperature => menu(
                desc(
                    "flow_temperature",
                    SANITIZED_TEMP,
                    G::OtherParams,
                    RO,
                    U::Temperature,
                ),
                "U6_2_1",
            ),
            BaseParam::SignalStrength => menu(
                desc(
                    "signal_strength",
                    ParamKind::Number,
                    G::OtherParams,
                    RO,
                    U::Percent,
                ),
                "U6_0_1",
            ),
            BaseParam::Units => ParamDescriptor {
                persistent: true,
                ..desc(
                    "units",
                    ParamKind::Options(UNITS_OPTIONS),
                    G::Units,
                    RO,
                    U::None,
                )
            },
            BaseParam::Currency => desc("currency", ParamKind::Text, G::Currency, RO, U::None),
            BaseParam::GasType => desc("gas_type", ParamKind::Text, G::Currency, RO, U::None),
            BaseParam::FirmwareVersion => {
                desc("firmware_version", ParamKind::Text, G::Version, RO, U::None)
            }
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn from_name(name: &str) -> Option<BaseParam> {
        BaseParam::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// A concrete parameter key: base parameter plus zone (1 for unzoned ones).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamKey {
    pub param: BaseParam,
    pub zone: u8,
}

impl ParamKey {
    pub fn new(param: BaseParam, zone: u8) -> Self {
        let zone = if param.descriptor().zoned { zone } else { 1 };
        Self { param, zone }
    }

    pub fn descriptor(&self) -> ParamDescriptor {
        self.param.descriptor()
    }

    /// Menu id with the zone folded in for zones past the first.
    pub fn menu_id(&self) -> Option<String> {
        let base = self.descriptor().menu_id?;
        if self.zone > 1 {
            Some(format!("{base}_z{}", self.zone))
        } else {
            Some(base.to_string())
        }
    }

    pub fn unit(&self, system: UnitSystem) -> Option<&'static str> {
        match self.descriptor().unit {
            UnitClass::None => None,
            UnitClass::Temperature => Some(system.temperature_unit()),
            UnitClass::Energy => Some(system.energy_unit()),
            UnitClass::Percent => Some("%"),
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.zone > 1 {
            write!(f, "{}{ZONE_SUFFIX}{}", self.param.name(), self.zone)
        } else {
            f.write_str(self.param.name())
        }
    }
}

impl FromStr for ParamKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ValidationError::UnknownParameter(s.to_string());
        let (name, zone) = match s.rsplit_once(ZONE_SUFFIX) {
            Some((name, zone)) => {
                let zone: u8 = zone.parse().map_err(|_| unknown())?;
                if !(2..=MAX_ZONES).contains(&zone) {
                    return Err(unknown());
                }
                (name, zone)
            }
            None => (s, 1),
        };
        let param = BaseParam::from_name(name).ok_or_else(unknown)?;
        if zone > 1 && !param.descriptor().zoned {
            return Err(unknown());
        }
        Ok(ParamKey { param, zone })
    }
}

/// Builds the name -> key table for the enabled parameters and zone count.
///
/// Zoned parameters produce one key per zone; unzoned ones a single key.
pub fn build_zone_key_map(base: &[BaseParam], zone_count: u8) -> BTreeMap<String, ParamKey> {
    let zone_count = zone_count.clamp(1, MAX_ZONES);
    let mut map = BTreeMap::new();
    for &param in base {
        let zones = if param.descriptor().zoned { zone_count } else { 1 };
        for zone in 1..=zones {
            let key = ParamKey::new(param, zone);
            map.insert(key.to_string(), key);
        }
    }
    map
}
