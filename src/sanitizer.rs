//! Zero-reading filter for temperature-like keys.
//!
//! The device sometimes reports 0 for a probe that was reading fine a moment
//! ago. A short run of zeros is papered over with the last good reading; a run
//! of `tolerance` zeros is accepted as the probe genuinely having no value.

use std::collections::HashMap;

use tracing::debug;

use crate::params::{ParamKey, ParamKind};
use crate::protocol::Readings;
use crate::types::ParamValue;

pub const ZERO_TOLERANCE: u32 = 10;

const SENTINEL: f64 = 0.0;

fn is_sentinel(value: &ParamValue) -> bool {
    matches!(value, ParamValue::Number(n) if *n == SENTINEL)
}

fn is_sanitized(key: &ParamKey) -> bool {
    matches!(
        key.descriptor().kind,
        ParamKind::Temperature { sanitized: true }
    )
}

#[derive(Debug)]
pub(crate) struct Sanitizer {
    tolerance: u32,
    streaks: HashMap<ParamKey, u32>,
}

impl Sanitizer {
    pub fn new(tolerance: u32) -> Self {
        Self {
            tolerance,
            streaks: HashMap::new(),
        }
    }

    /// Rewrites `readings` in place. `last_accepted` yields the value the
    /// table currently holds for a key.
    pub fn sanitize<'a>(
        &mut self,
        readings: &mut Readings,
        last_accepted: impl Fn(&ParamKey) -> Option<&'a ParamValue>,
    ) {
        for (key, value) in readings.iter_mut() {
            if !is_sanitized(key) {
                continue;
            }
            if !value.as_ref().is_some_and(is_sentinel) {
                self.streaks.remove(key);
                continue;
            }
            let Some(previous) = last_accepted(key).filter(|p| !is_sentinel(p)) else {
                // Nothing better to show than the sentinel itself.
                self.streaks.remove(key);
                continue;
            };
            let streak = self.streaks.entry(*key).or_insert(0);
            *streak += 1;
            if *streak < self.tolerance {
                debug!(key = %key, streak = *streak, "holding last reading over zero");
                *value = Some(previous.clone());
            } else {
                debug!(key = %key, "zero reading accepted after {} samples", *streak);
                self.streaks.remove(key);
            }
        }
    }

    #[cfg(test)]
    pub fn streak(&self, key: &ParamKey) -> u32 {
        self.streaks.get(key).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.streaks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::BaseParam;

    fn detected(zone: u8) -> ParamKey {
        ParamKey::new(BaseParam::ChDetectedTemperature, zone)
    }

    fn run(s: &mut Sanitizer, key: ParamKey, reading: f64, last: &mut Option<ParamValue>) {
        let mut readings = Readings::new();
        readings.insert(key, Some(ParamValue::Number(reading)));
        let held = last.clone();
        s.sanitize(&mut readings, |_| held.as_ref());
        *last = readings.remove(&key).flatten();
    }

    #[test]
    fn zero_below_tolerance_keeps_previous_value() {
        let mut s = Sanitizer::new(ZERO_TOLERANCE);
        let key = detected(1);
        let mut last = None;
        run(&mut s, key, 20.5, &mut last);
        for i in 1..ZERO_TOLERANCE {
            run(&mut s, key, 0.0, &mut last);
            assert_eq!(last, Some(ParamValue::Number(20.5)), "sample {i}");
            assert_eq!(s.streak(&key), i);
        }
    }

    #[test]
    fn zero_at_tolerance_becomes_visible() {
        let mut s = Sanitizer::new(3);
        let key = detected(1);
        let mut last = None;
        run(&mut s, key, 20.5, &mut last);
        run(&mut s, key, 0.0, &mut last);
        run(&mut s, key, 0.0, &mut last);
        assert_eq!(last, Some(ParamValue::Number(20.5)));
        run(&mut s, key, 0.0, &mut last);
        assert_eq!(last, Some(ParamValue::Number(0.0)));
        // Further zeros stay zero with nothing to hold.
        run(&mut s, key, 0.0, &mut last);
        assert_eq!(last, Some(ParamValue::Number(0.0)));
    }

    #[test]
    fn real_reading_resets_streak() {
        let mut s = Sanitizer::new(3);
        let key = detected(1);
        let mut last = None;
        run(&mut s, key, 20.5, &mut last);
        run(&mut s, key, 0.0, &mut last);
        run(&mut s, key, 0.0, &mut last);
        run(&mut s, key, 21.0, &mut last);
        assert_eq!(s.streak(&key), 0);
        run(&mut s, key, 0.0, &mut last);
        assert_eq!(last, Some(ParamValue::Number(21.0)));
        assert_eq!(s.streak(&key), 1);
    }

    #[test]
    fn streaks_are_per_zone() {
        let mut s = Sanitizer::new(3);
        let mut zone1 = Some(ParamValue::Number(20.0));
        let mut zone2 = Some(ParamValue::Number(18.0));
        run(&mut s, detected(1), 0.0, &mut zone1);
        run(&mut s, detected(1), 0.0, &mut zone1);
        run(&mut s, detected(2), 0.0, &mut zone2);
        assert_eq!(s.streak(&detected(1)), 2);
        assert_eq!(s.streak(&detected(2)), 1);
    }

    #[test]
    fn unsanitized_keys_pass_through() {
        let mut s = Sanitizer::new(3);
        let key = ParamKey::new(BaseParam::ChSetTemperature, 1);
        let mut last = Some(ParamValue::Number(21.0));
        run(&mut s, key, 0.0, &mut last);
        assert_eq!(last, Some(ParamValue::Number(0.0)));
    }

    #[test]
    fn first_ever_zero_is_accepted() {
        let mut s = Sanitizer::new(3);
        let key = ParamKey::new(BaseParam::OutsideTemperature, 1);
        let mut last = None;
        run(&mut s, key, 0.0, &mut last);
        assert_eq!(last, Some(ParamValue::Number(0.0)));
        assert_eq!(s.streak(&key), 0);
    }
}
