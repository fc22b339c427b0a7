//! Pending-write bookkeeping.
//!
//! A write stays pending until a fetch of its read group that started after
//! the write was submitted reports the desired value. Equality alone is not
//! enough: an older read may already hold the value by coincidence.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::params::{option_code, BaseParam, ParamKey, ParamKind, WriteRoute, CH_MODE_OPTIONS};
use crate::protocol::{resolve_schedule_slot, Readings, ScheduleSlot, WriteTarget, ZoneState};
use crate::types::{AllowedValues, ParamValue, RequestGroup};

pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub key: ParamKey,
    pub desired: ParamValue,
    pub write_group: RequestGroup,
    pub read_group: RequestGroup,
    pub target: WriteTarget,
    pub retry_count: u32,
    pub first_requested_at: DateTime<Utc>,
    /// Set once a POST carrying this value succeeded.
    pub submitted_at: Option<DateTime<Utc>>,
}

impl PendingWrite {
    pub fn is_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }
}

/// Checks a requested value against the key's kind and the bounds the device
/// last reported.
pub fn validate(
    key: ParamKey,
    value: &ParamValue,
    allowed: Option<&AllowedValues>,
) -> Result<ParamValue, ValidationError> {
    let descriptor = key.descriptor();
    if descriptor.write == WriteRoute::ReadOnly {
        return Err(ValidationError::ReadOnly(key));
    }
    match descriptor.kind {
        ParamKind::Temperature { .. } | ParamKind::Number => {
            let v = value.as_f64().ok_or(ValidationError::WrongType {
                key,
                expected: "number",
            })?;
            let Some(AllowedValues::Range { min, max, step }) = allowed else {
                return Err(ValidationError::CapabilitiesUnknown(key));
            };
            if v < *min || v > *max {
                return Err(ValidationError::OutOfRange {
                    key,
                    value: v,
                    min: *min,
                    max: *max,
                });
            }
            if *step > 0.0 {
                let steps = ((v - min) / step).round();
                let reconstructed = min + steps * step;
                if (reconstructed - v).abs() > 1e-9 {
                    return Err(ValidationError::NotAStep {
                        key,
                        value: v,
                        step: *step,
                    });
                }
            }
            Ok(ParamValue::Number(v))
        }
        ParamKind::Bool => value
            .as_bool()
            .map(ParamValue::Bool)
            .ok_or(ValidationError::WrongType {
                key,
                expected: "boolean",
            }),
        ParamKind::Options(table) => {
            let label = value.as_str().ok_or(ValidationError::WrongType {
                key,
                expected: "option",
            })?;
            let Some(AllowedValues::Options(options)) = allowed else {
                return Err(ValidationError::CapabilitiesUnknown(key));
            };
            if option_code(table, label).is_none() || !options.iter().any(|o| o == label) {
                return Err(ValidationError::NotAnOption {
                    key,
                    value: label.to_string(),
                    options: options.clone(),
                });
            }
            Ok(ParamValue::Text(label.to_string()))
        }
        ParamKind::Text | ParamKind::Structured => Err(ValidationError::ReadOnly(key)),
    }
}

/// Picks the endpoint a write is sent to. `zone` is the zone's last Main
/// snapshot, used for the set-temperature schedule aliasing.
pub fn route_write(
    key: ParamKey,
    zone: Option<&ZoneState>,
) -> Option<(RequestGroup, WriteTarget)> {
    let descriptor = key.descriptor();
    match descriptor.write {
        WriteRoute::ReadOnly => None,
        WriteRoute::Direct(RequestGroup::OtherParams) => {
            Some((RequestGroup::OtherParams, WriteTarget::Menu(key.menu_id()?)))
        }
        WriteRoute::Direct(group) => Some((group, WriteTarget::MainField)),
        WriteRoute::ScheduleAliased => {
            let program = option_code(CH_MODE_OPTIONS, "program");
            let aliased = zone.and_then(|z| {
                if z.mode != program {
                    return None;
                }
                Some(resolve_schedule_slot(z.desired?, z.comfort?, z.economy?))
            });
            let slot_param = match aliased {
                Some(ScheduleSlot::Comfort) => BaseParam::ChComfortTemperature,
                Some(ScheduleSlot::Economy) => BaseParam::ChEconomyTemperature,
                Some(ScheduleSlot::Ambiguous) => {
                    warn!(
                        key = %key,
                        ambiguous_slot = true,
                        "comfort and economy coincide, writing plain desired temperature"
                    );
                    return Some((RequestGroup::Main, WriteTarget::MainField));
                }
                None => return Some((RequestGroup::Main, WriteTarget::MainField)),
            };
            let slot_key = ParamKey::new(slot_param, key.zone);
            debug!(key = %key, slot = %slot_key, "set temperature follows active schedule slot");
            Some((RequestGroup::OtherParams, WriteTarget::Menu(slot_key.menu_id()?)))
        }
    }
}

#[derive(Debug)]
pub(crate) struct WriteCoordinator {
    pending: BTreeMap<ParamKey, PendingWrite>,
    max_retries: u32,
    unresolved: Vec<ParamKey>,
}

impl WriteCoordinator {
    pub fn new(max_retries: u32) -> Self {
        Self {
            pending: BTreeMap::new(),
            max_retries,
            unresolved: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn get(&self, key: &ParamKey) -> Option<&PendingWrite> {
        self.pending.get(key)
    }

    pub fn snapshot(&self) -> Vec<PendingWrite> {
        self.pending.values().cloned().collect()
    }

    /// Adds or replaces the pending value for a key. A replaced write keeps
    /// its original request time but starts over on retries. A write to a
    /// menu entry supersedes any other key's write to the same entry.
    pub fn insert(&mut self, mut write: PendingWrite) {
        if let Some(existing) = self.pending.get(&write.key) {
            write.first_requested_at = existing.first_requested_at;
        }
        if let WriteTarget::Menu(id) = &write.target {
            self.pending.retain(|key, other| {
                let clash = *key != write.key && other.target == write.target;
                if clash {
                    debug!(key = %key, by = %write.key, menu_id = %id, "pending write superseded");
                }
                !clash
            });
        }
        self.unresolved.retain(|k| *k != write.key);
        self.pending.insert(write.key, write);
    }

    /// Queued keys of the write group holding the oldest queued request.
    pub fn next_batch(&self) -> Option<(RequestGroup, Vec<ParamKey>)> {
        let oldest = self
            .pending
            .values()
            .filter(|w| !w.is_submitted())
            .min_by_key(|w| w.first_requested_at)?;
        let group = oldest.write_group;
        let keys = self
            .pending
            .values()
            .filter(|w| !w.is_submitted() && w.write_group == group)
            .map(|w| w.key)
            .collect();
        Some((group, keys))
    }

    pub fn mark_submitted(&mut self, keys: &[ParamKey], at: DateTime<Utc>) {
        for key in keys {
            if let Some(w) = self.pending.get_mut(key) {
                w.submitted_at = Some(at);
            }
        }
    }

    /// Counts a failed attempt. Returns the keys that ran out of retries and
    /// were dropped.
    pub fn record_failure(&mut self, keys: &[ParamKey]) -> Vec<ParamKey> {
        let mut exhausted = Vec::new();
        for key in keys {
            let Some(w) = self.pending.get_mut(key) else {
                continue;
            };
            if w.retry_count < self.max_retries {
                w.retry_count += 1;
                w.submitted_at = None;
            } else {
                exhausted.push(*key);
            }
        }
        self.abandon(&exhausted);
        exhausted
    }

    /// Submitted writes still unconfirmed after `window` count as ignored by
    /// the device and are queued again, or dropped when out of retries.
    pub fn expire_unconfirmed(&mut self, now: DateTime<Utc>, window: Duration) -> Vec<ParamKey> {
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        let stale: Vec<ParamKey> = self
            .pending
            .values()
            .filter(|w| w.submitted_at.is_some_and(|at| at + window <= now))
            .map(|w| w.key)
            .collect();
        if !stale.is_empty() {
            debug!(count = stale.len(), "writes not confirmed in time, resubmitting");
        }
        self.record_failure(&stale)
    }

    /// Clears writes confirmed by a fetch of `group` that started at
    /// `fetched_at`. Returns the cleared keys.
    pub fn confirm(
        &mut self,
        group: RequestGroup,
        readings: &Readings,
        fetched_at: DateTime<Utc>,
    ) -> Vec<ParamKey> {
        let confirmed: Vec<ParamKey> = self
            .pending
            .values()
            .filter(|w| w.read_group == group)
            .filter(|w| w.submitted_at.is_some_and(|at| fetched_at > at))
            .filter(|w| {
                readings
                    .get(&w.key)
                    .and_then(|v| v.as_ref())
                    .is_some_and(|v| v.matches(&w.desired))
            })
            .map(|w| w.key)
            .collect();
        for key in &confirmed {
            self.pending.remove(key);
        }
        confirmed
    }

    /// Read groups that would confirm a submitted write.
    pub fn awaiting_reads(&self) -> Vec<RequestGroup> {
        let mut groups: Vec<RequestGroup> = self
            .pending
            .values()
            .filter(|w| w.is_submitted())
            .map(|w| w.read_group)
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    /// How long the write loop sleeps after a pass. `None` means idle until
    /// the next request.
    pub fn next_delay(
        &self,
        last_failed: bool,
        debounce: Duration,
        retry_wait: Duration,
    ) -> Option<Duration> {
        if self.pending.is_empty() {
            return None;
        }
        if last_failed {
            return Some(retry_wait);
        }
        if self.pending.values().any(|w| !w.is_submitted()) {
            Some(debounce)
        } else {
            Some(retry_wait)
        }
    }

    /// Drops everything, reporting it as unresolved.
    pub fn drain(&mut self) -> Vec<ParamKey> {
        let keys: Vec<ParamKey> = self.pending.keys().copied().collect();
        self.abandon(&keys);
        keys
    }

    pub fn take_unresolved(&mut self) -> Vec<ParamKey> {
        std::mem::take(&mut self.unresolved)
    }

    /// Drops writes that will not be tried again and reports them as
    /// unresolved.
    pub fn abandon(&mut self, keys: &[ParamKey]) {
        for key in keys {
            if let Some(w) = self.pending.remove(key) {
                warn!(
                    key = %key,
                    retries = w.retry_count,
                    desired = %w.desired,
                    "write unresolved, giving up"
                );
                if !self.unresolved.contains(key) {
                    self.unresolved.push(*key);
                }
            }
        }
    }
}
