use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::params::{
    option_code, option_label, BaseParam, ParamKey, ParamKind, CH_MODE_OPTIONS, MODE_OPTIONS,
    UNITS_OPTIONS,
};
use crate::types::{AllowedValues, ParamValue, RequestGroup, UnitSystem};
use crate::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://www.ariston-net.remotethermo.com";

pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const SET_TIMEOUT: Duration = Duration::from_secs(25);
const LONG_TIMEOUT: Duration = Duration::from_secs(18);
const SHORT_TIMEOUT: Duration = Duration::from_secs(7);

/// Comfort and economy closer than this cannot be told apart.
const SLOT_EPSILON: f64 = 0.05;

const PLANT_PATH_MARKERS: &[&str] = &["/R2/Plant/Index/", "/R2/PlantDashboard/Index/"];

pub fn login_url(base: &str) -> String {
    format!("{base}/R2/Account/Login?returnUrl=%2FR2%2FHome")
}

pub fn login_body(username: &str, password: &str) -> Value {
    json!({
        "email": username,
        "password": password,
        "rememberMe": false,
        "language": "English_Us"
    })
}

pub fn gateways_url(base: &str) -> String {
    format!("{base}/R2/PlantManagement/GetPlants")
}

pub fn fetch_timeout(group: RequestGroup) -> Duration {
    match group {
        RequestGroup::Main | RequestGroup::ChSchedule | RequestGroup::DhwSchedule => LONG_TIMEOUT,
        _ => SHORT_TIMEOUT,
    }
}

/// URLs for one group fetch, each tagged with the zone it belongs to.
pub fn fetch_urls(
    base: &str,
    group: RequestGroup,
    plant: &str,
    zones: u8,
    units: UnitSystem,
    menu_ids: &[String],
) -> Vec<(u8, String)> {
    let um = units.umsys();
    match group {
        RequestGroup::Main => (1..=zones)
            .map(|z| {
                (
                    z,
                    format!("{base}/R2/PlantHomeSlp/GetData/{plant}?zoneNum={z}&umsys={um}"),
                )
            })
            .collect(),
        RequestGroup::ChSchedule => (1..=zones)
            .map(|z| {
                (
                    z,
                    format!(
                        "{base}/R2/PlantZoneTimeProg/GetTimeProg/{plant}?zoneNum={z}&umsys={um}"
                    ),
                )
            })
            .collect(),
        RequestGroup::DhwSchedule => vec![(
            1,
            format!("{base}/R2/PlantDhwTimeProg/GetTimeProg/{plant}?umsys={um}"),
        )],
        RequestGroup::Errors => vec![(
            1,
            format!("{base}/R2/PlantDashboard/GetActiveAlarms/{plant}"),
        )],
        RequestGroup::Usage => vec![(
            1,
            format!("{base}/R2/PlantMetering/GetData/{plant}?umsys={um}"),
        )],
        RequestGroup::OtherParams => vec![(
            1,
            format!(
                "{base}/R2/PlantMenu/Refresh/{plant}?paramIds={}&umsys={um}",
                menu_ids.join(",")
            ),
        )],
        RequestGroup::Units => vec![(
            1,
            format!("{base}/R2/PlantPreference/GetMeasurementUnits/{plant}"),
        )],
        RequestGroup::Currency => vec![(
            1,
            format!("{base}/R2/PlantMetering/GetCurrencySettings/{plant}"),
        )],
        RequestGroup::Version => vec![(1, format!("{base}/R2/PlantData/GetVersion/{plant}"))],
    }
}

pub fn main_set_url(base: &str, plant: &str, zone: u8, units: UnitSystem) -> String {
    format!(
        "{base}/R2/PlantHomeSlp/SetData/{plant}?zoneNum={zone}&umsys={}",
        units.umsys()
    )
}

pub fn menu_set_url(base: &str, plant: &str, units: UnitSystem) -> String {
    format!("{base}/R2/PlantMenu/Submit/{plant}?umsys={}", units.umsys())
}

/// Plant id from the resource path the login handshake lands on.
pub fn plant_id_from_url(url: &str) -> Option<String> {
    PLANT_PATH_MARKERS.iter().find_map(|marker| {
        let start = url.find(marker)? + marker.len();
        let id: String = url[start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        (!id.is_empty()).then_some(id)
    })
}

/// Plant id from a JSON login body carrying `returnUrl`.
pub fn plant_id_from_body(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let path = parsed.get("returnUrl")?.as_str()?;
    plant_id_from_url(path)
}

// -- Response schemas --

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RangeField {
    pub value: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
}

impl RangeField {
    fn allowed(&self) -> Option<AllowedValues> {
        Some(AllowedValues::Range {
            min: self.min?,
            max: self.max?,
            step: self.step.unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsField {
    pub value: Option<i64>,
    #[serde(default)]
    pub allowed_options: Vec<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneResponse {
    pub num: Option<u8>,
    pub mode: Option<OptionsField>,
    pub desired_temp: Option<RangeField>,
    pub comfort_temp: Option<RangeField>,
    pub economy_temp: Option<RangeField>,
    pub room_temp: Option<f64>,
    pub flame_on: Option<bool>,
    pub pilot_on: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainResponse {
    pub mode: Option<i64>,
    #[serde(default)]
    pub allowed_modes: Vec<i64>,
    pub holiday_enabled: Option<bool>,
    pub outside_temp: Option<f64>,
    pub flame_sensor: Option<bool>,
    pub heat_pump_on: Option<bool>,
    pub dhw_temp: Option<RangeField>,
    pub dhw_storage_temp: Option<f64>,
    pub zone: Option<ZoneResponse>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorsResponse {
    #[serde(default)]
    pub alarms: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    pub ch_today: Option<f64>,
    pub dhw_today: Option<f64>,
    pub ch_month: Option<f64>,
    pub dhw_month: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MenuOption {
    pub value: i64,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MenuEntry {
    pub id: String,
    pub value: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub options: Option<Vec<MenuOption>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitsResponse {
    pub measurement_system: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyResponse {
    pub currency: Option<String>,
    pub gas_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionResponse {
    pub firmware: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEntry {
    pub gw: Option<String>,
}

/// Per-zone view of the zone block of a Main fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneState {
    pub desired: Option<f64>,
    pub comfort: Option<f64>,
    pub economy: Option<f64>,
    pub detected: Option<f64>,
    pub mode: Option<i64>,
    pub mode_options: Vec<i64>,
    pub flame: Option<bool>,
    pub pilot: Option<bool>,
}

impl From<&ZoneResponse> for ZoneState {
    fn from(z: &ZoneResponse) -> Self {
        Self {
            desired: z.desired_temp.as_ref().and_then(|r| r.value),
            comfort: z.comfort_temp.as_ref().and_then(|r| r.value),
            economy: z.economy_temp.as_ref().and_then(|r| r.value),
            detected: z.room_temp,
            mode: z.mode.as_ref().and_then(|m| m.value),
            mode_options: z
                .mode
                .as_ref()
                .map(|m| m.allowed_options.clone())
                .unwrap_or_default(),
            flame: z.flame_on,
            pilot: z.pilot_on,
        }
    }
}

/// A parsed group fetch. Zone numbers come from the request, not the body.
#[derive(Debug, Clone)]
pub enum GroupPayload {
    Main(Vec<(u8, MainResponse)>),
    ChSchedule(Vec<(u8, Value)>),
    DhwSchedule(Value),
    Errors(ErrorsResponse),
    Usage(UsageResponse),
    OtherParams(Vec<MenuEntry>),
    Units(UnitsResponse),
    Currency(CurrencyResponse),
    Version(VersionResponse),
}

fn single(bodies: Vec<(u8, Value)>) -> Result<Value> {
    bodies
        .into_iter()
        .next()
        .map(|(_, body)| body)
        .ok_or_else(|| Error::MalformedResponse("empty group response".to_string()))
}

pub fn parse_group(group: RequestGroup, bodies: Vec<(u8, Value)>) -> Result<GroupPayload> {
    Ok(match group {
        RequestGroup::Main => {
            let mut zones = Vec::with_capacity(bodies.len());
            for (zone, body) in bodies {
                let parsed: MainResponse = serde_json::from_value(body)?;
                if let Some(num) = parsed.zone.as_ref().and_then(|z| z.num)
                    && num != zone
                {
                    return Err(Error::MalformedResponse(format!(
                        "requested zone {zone}, device answered for zone {num}"
                    )));
                }
                zones.push((zone, parsed));
            }
            GroupPayload::Main(zones)
        }
        RequestGroup::ChSchedule => GroupPayload::ChSchedule(bodies),
        RequestGroup::DhwSchedule => GroupPayload::DhwSchedule(single(bodies)?),
        RequestGroup::Errors => GroupPayload::Errors(serde_json::from_value(single(bodies)?)?),
        RequestGroup::Usage => GroupPayload::Usage(serde_json::from_value(single(bodies)?)?),
        RequestGroup::OtherParams => {
            GroupPayload::OtherParams(serde_json::from_value(single(bodies)?)?)
        }
        RequestGroup::Units => GroupPayload::Units(serde_json::from_value(single(bodies)?)?),
        RequestGroup::Currency => {
            GroupPayload::Currency(serde_json::from_value(single(bodies)?)?)
        }
        RequestGroup::Version => GroupPayload::Version(serde_json::from_value(single(bodies)?)?),
    })
}

pub type Readings = BTreeMap<ParamKey, Option<ParamValue>>;

fn key(param: BaseParam, zone: u8) -> ParamKey {
    ParamKey::new(param, zone)
}

fn number(v: Option<f64>) -> Option<ParamValue> {
    v.map(ParamValue::Number)
}

fn boolean(v: Option<bool>) -> Option<ParamValue> {
    v.map(ParamValue::Bool)
}

fn text(v: &Option<String>) -> Option<ParamValue> {
    v.clone().map(ParamValue::Text)
}

fn label(table: &[(i64, &'static str)], code: Option<i64>) -> Option<ParamValue> {
    code.and_then(|c| option_label(table, c))
        .map(|l| ParamValue::Text(l.to_string()))
}

/// Decodes a wire value according to the parameter's kind.
pub fn decode_wire(kind: ParamKind, raw: &Value) -> Option<ParamValue> {
    match kind {
        ParamKind::Temperature { .. } | ParamKind::Number => raw.as_f64().map(ParamValue::Number),
        ParamKind::Bool => raw
            .as_bool()
            .or_else(|| raw.as_f64().map(|n| n != 0.0))
            .map(ParamValue::Bool),
        ParamKind::Options(table) => label(table, raw.as_i64()),
        ParamKind::Text => raw.as_str().map(|s| ParamValue::Text(s.to_string())),
        ParamKind::Structured => (!raw.is_null()).then(|| ParamValue::Struct(raw.clone())),
    }
}

/// Encodes a value for a write payload. `menu` selects the 0/1 bool form
/// the menu endpoint expects.
pub fn encode_wire(kind: ParamKind, value: &ParamValue, menu: bool) -> Option<Value> {
    match (kind, value) {
        (ParamKind::Temperature { .. } | ParamKind::Number, ParamValue::Number(n)) => {
            Some(json!(n))
        }
        (ParamKind::Bool, ParamValue::Bool(b)) if menu => Some(json!(i64::from(*b))),
        (ParamKind::Bool, ParamValue::Bool(b)) => Some(json!(b)),
        (ParamKind::Options(table), ParamValue::Text(l)) => option_code(table, l).map(|c| json!(c)),
        (ParamKind::Text, ParamValue::Text(s)) => Some(json!(s)),
        _ => None,
    }
}

impl GroupPayload {
    /// Every value this payload carries, keyed by parameter. Keys the payload
    /// covers but leaves empty map to `None`.
    pub fn readings(&self, menu_keys: &[ParamKey]) -> Readings {
        let mut out = Readings::new();
        match self {
            GroupPayload::Main(zones) => {
                if let Some((_, plant)) = zones.first() {
                    out.insert(key(BaseParam::Mode, 1), label(MODE_OPTIONS, plant.mode));
                    out.insert(key(BaseParam::HolidayMode, 1), boolean(plant.holiday_enabled));
                    out.insert(key(BaseParam::OutsideTemperature, 1), number(plant.outside_temp));
                    out.insert(key(BaseParam::Flame, 1), boolean(plant.flame_sensor));
                    out.insert(key(BaseParam::HeatPump, 1), boolean(plant.heat_pump_on));
                    out.insert(
                        key(BaseParam::DhwSetTemperature, 1),
                        number(plant.dhw_temp.as_ref().and_then(|t| t.value)),
                    );
                    out.insert(
                        key(BaseParam::DhwStorageTemperature, 1),
                        number(plant.dhw_storage_temp),
                    );
                }
                for (zone, resp) in zones {
                    let state = resp.zone.as_ref().map(ZoneState::from).unwrap_or_default();
                    let z = *zone;
                    out.insert(key(BaseParam::ChMode, z), label(CH_MODE_OPTIONS, state.mode));
                    out.insert(key(BaseParam::ChSetTemperature, z), number(state.desired));
                    out.insert(key(BaseParam::ChComfortTemperature, z), number(state.comfort));
                    out.insert(key(BaseParam::ChEconomyTemperature, z), number(state.economy));
                    out.insert(key(BaseParam::ChDetectedTemperature, z), number(state.detected));
                    out.insert(key(BaseParam::ChFlame, z), boolean(state.flame));
                    out.insert(key(BaseParam::ChPilot, z), boolean(state.pilot));
                }
            }
            GroupPayload::ChSchedule(zones) => {
                for (zone, body) in zones {
                    out.insert(
                        key(BaseParam::ChProgram, *zone),
                        decode_wire(ParamKind::Structured, body),
                    );
                }
            }
            GroupPayload::DhwSchedule(body) => {
                out.insert(
                    key(BaseParam::DhwProgram, 1),
                    decode_wire(ParamKind::Structured, body),
                );
            }
            GroupPayload::Errors(resp) => {
                out.insert(
                    key(BaseParam::Errors, 1),
                    Some(ParamValue::Struct(Value::Array(resp.alarms.clone()))),
                );
                out.insert(
                    key(BaseParam::ErrorsCount, 1),
                    Some(ParamValue::Number(resp.alarms.len() as f64)),
                );
            }
            GroupPayload::Usage(resp) => {
                out.insert(key(BaseParam::ChEnergyToday, 1), number(resp.ch_today));
                out.insert(key(BaseParam::DhwEnergyToday, 1), number(resp.dhw_today));
                out.insert(key(BaseParam::ChEnergyThisMonth, 1), number(resp.ch_month));
                out.insert(key(BaseParam::DhwEnergyThisMonth, 1), number(resp.dhw_month));
            }
            GroupPayload::OtherParams(entries) => {
                for k in menu_keys {
                    let Some(id) = k.menu_id() else { continue };
                    let value = entries
                        .iter()
                        .find(|e| e.id == id)
                        .and_then(|e| e.value.as_ref())
                        .and_then(|raw| decode_wire(k.descriptor().kind, raw));
                    out.insert(*k, value);
                }
            }
            GroupPayload::Units(resp) => {
                out.insert(
                    key(BaseParam::Units, 1),
                    label(UNITS_OPTIONS, resp.measurement_system),
                );
            }
            GroupPayload::Currency(resp) => {
                out.insert(key(BaseParam::Currency, 1), text(&resp.currency));
                out.insert(key(BaseParam::GasType, 1), text(&resp.gas_type));
            }
            GroupPayload::Version(resp) => {
                out.insert(key(BaseParam::FirmwareVersion, 1), text(&resp.firmware));
            }
        }
        out
    }

    /// Allowed values the device reports alongside the readings.
    pub fn capabilities(&self, menu_keys: &[ParamKey]) -> BTreeMap<ParamKey, AllowedValues> {
        let mut out = BTreeMap::new();
        match self {
            GroupPayload::Main(zones) => {
                if let Some((_, plant)) = zones.first() {
                    let modes: Vec<String> = plant
                        .allowed_modes
                        .iter()
                        .filter_map(|c| option_label(MODE_OPTIONS, *c))
                        .map(str::to_string)
                        .collect();
                    if !modes.is_empty() {
                        out.insert(key(BaseParam::Mode, 1), AllowedValues::Options(modes));
                    }
                    if let Some(range) = plant.dhw_temp.as_ref().and_then(RangeField::allowed) {
                        out.insert(key(BaseParam::DhwSetTemperature, 1), range);
                    }
                }
                for (zone, resp) in zones {
                    let Some(z) = resp.zone.as_ref() else { continue };
                    let modes: Vec<String> = z
                        .mode
                        .iter()
                        .flat_map(|m| m.allowed_options.iter())
                        .filter_map(|c| option_label(CH_MODE_OPTIONS, *c))
                        .map(str::to_string)
                        .collect();
                    if !modes.is_empty() {
                        out.insert(key(BaseParam::ChMode, *zone), AllowedValues::Options(modes));
                    }
                    let ranges = [
                        (BaseParam::ChSetTemperature, &z.desired_temp),
                        (BaseParam::ChComfortTemperature, &z.comfort_temp),
                        (BaseParam::ChEconomyTemperature, &z.economy_temp),
                    ];
                    for (param, field) in ranges {
                        if let Some(range) = field.as_ref().and_then(RangeField::allowed) {
                            out.insert(key(param, *zone), range);
                        }
                    }
                }
            }
            GroupPayload::OtherParams(entries) => {
                for k in menu_keys {
                    let Some(id) = k.menu_id() else { continue };
                    let Some(entry) = entries.iter().find(|e| e.id == id) else {
                        continue;
                    };
                    if let (Some(min), Some(max)) = (entry.min, entry.max) {
                        out.insert(
                            *k,
                            AllowedValues::Range {
                                min,
                                max,
                                step: entry.step.unwrap_or(0.0),
                            },
                        );
                    } else if let Some(options) = &entry.options {
                        out.insert(
                            *k,
                            AllowedValues::Options(options.iter().map(|o| o.text.clone()).collect()),
                        );
                    }
                }
            }
            _ => {}
        }
        out
    }

    /// Zone snapshots carried by a Main fetch.
    pub fn zone_states(&self) -> Vec<(u8, ZoneState)> {
        match self {
            GroupPayload::Main(zones) => zones
                .iter()
                .map(|(z, resp)| (*z, resp.zone.as_ref().map(ZoneState::from).unwrap_or_default()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

// -- Write payloads --

/// Which comfort/economy slot a plain temperature write lands on while the
/// zone runs its time program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleSlot {
    Comfort,
    Economy,
    /// Comfort and economy coincide; the active slot cannot be determined.
    Ambiguous,
}

pub fn resolve_schedule_slot(desired: f64, comfort: f64, economy: f64) -> ScheduleSlot {
    if (comfort - economy).abs() < SLOT_EPSILON {
        return ScheduleSlot::Ambiguous;
    }
    if (desired - comfort).abs() <= (desired - economy).abs() {
        ScheduleSlot::Comfort
    } else {
        ScheduleSlot::Economy
    }
}

/// Where a pending value goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteTarget {
    /// A field of the Main set payload.
    MainField,
    /// An entry of the menu submit payload.
    Menu(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteEntry {
    pub key: ParamKey,
    pub target: WriteTarget,
    pub old: Value,
    pub new: Value,
}

fn main_field(param: BaseParam) -> Option<(bool, &'static str)> {
    match param {
        BaseParam::Mode => Some((false, "mode")),
        BaseParam::DhwSetTemperature => Some((false, "dhwTemp")),
        BaseParam::ChMode => Some((true, "mode")),
        BaseParam::ChSetTemperature => Some((true, "desiredTemp")),
        _ => None,
    }
}

/// One `{NewValue, OldValue}` body per zone touched. Plant-wide fields ride
/// along with the first body.
pub fn main_set_bodies(entries: &[WriteEntry]) -> Vec<(u8, Value)> {
    let mut zones: BTreeMap<u8, (Map<String, Value>, Map<String, Value>)> = BTreeMap::new();
    let mut plant_new = Map::new();
    let mut plant_old = Map::new();

    for entry in entries.iter().filter(|e| e.target == WriteTarget::MainField) {
        let Some((zoned, field)) = main_field(entry.key.param) else {
            continue;
        };
        let (new, old) = if zoned {
            let slot = zones.entry(entry.key.zone).or_default();
            (&mut slot.0, &mut slot.1)
        } else {
            (&mut plant_new, &mut plant_old)
        };
        new.insert(field.to_string(), entry.new.clone());
        old.insert(field.to_string(), entry.old.clone());
    }

    if zones.is_empty() {
        if plant_new.is_empty() {
            return Vec::new();
        }
        zones.insert(1, (Map::new(), Map::new()));
    }

    let mut bodies = Vec::with_capacity(zones.len());
    for (idx, (zone, (zone_new, zone_old))) in zones.into_iter().enumerate() {
        let (mut new, mut old) = if idx == 0 {
            (plant_new.clone(), plant_old.clone())
        } else {
            (Map::new(), Map::new())
        };
        if !zone_new.is_empty() {
            new.insert("zone".to_string(), with_zone_num(zone_new, zone));
            old.insert("zone".to_string(), with_zone_num(zone_old, zone));
        }
        bodies.push((zone, json!({ "NewValue": new, "OldValue": old })));
    }
    bodies
}

fn with_zone_num(mut fields: Map<String, Value>, zone: u8) -> Value {
    fields.insert("num".to_string(), json!(zone));
    Value::Object(fields)
}

pub fn menu_set_body(entries: &[WriteEntry]) -> Value {
    let items: Vec<Value> = entries
        .iter()
        .filter_map(|e| match &e.target {
            WriteTarget::Menu(id) => Some(json!({
                "id": id,
                "newValue": e.new,
                "oldValue": e.old,
            })),
            WriteTarget::MainField => None,
        })
        .collect();
    Value::Array(items)
}
