//! Health flags derived from the error counter and the presence of data.
//!
//! Only `available` has transitions of its own. The per-zone and DHW flags are
//! recomputed from the inputs every time they are read.

use tracing::{debug, warn};

use crate::types::{Availability, RequestGroup};

/// More consecutive failures than this make the engine unavailable and purge
/// its cached device state.
pub const MAX_ERRORS: u32 = 10;

#[derive(Debug)]
pub(crate) struct AvailabilityTracker {
    error_counter: u32,
    logged_in: bool,
    plant_resolved: bool,
    main_present: bool,
    units_known: bool,
    dhw_range_known: bool,
    zone_modes: Vec<bool>,
}

impl AvailabilityTracker {
    pub fn new(zones: u8, units_known: bool) -> Self {
        Self {
            error_counter: 0,
            logged_in: false,
            plant_resolved: false,
            main_present: false,
            units_known,
            dhw_range_known: false,
            zone_modes: vec![false; usize::from(zones)],
        }
    }

    pub fn error_counter(&self) -> u32 {
        self.error_counter
    }

    pub fn is_available(&self) -> bool {
        self.error_counter <= MAX_ERRORS && self.logged_in && self.plant_resolved && self.main_present
    }

    pub fn set_session(&mut self, logged_in: bool, plant_resolved: bool) {
        self.logged_in = logged_in;
        self.plant_resolved = plant_resolved;
    }

    pub fn set_units_known(&mut self, known: bool) {
        self.units_known = known;
    }

    pub fn set_dhw_range_known(&mut self, known: bool) {
        self.dhw_range_known = known;
    }

    /// `zone` is 1-based; out-of-range zones are ignored.
    pub fn set_zone_modes_known(&mut self, zone: u8, known: bool) {
        if let Some(slot) = usize::from(zone)
            .checked_sub(1)
            .and_then(|i| self.zone_modes.get_mut(i))
        {
            *slot = known;
        }
    }

    /// A successful fetch of `group`. Only Main resets the counter.
    pub fn record_fetch_success(&mut self, group: RequestGroup) {
        if group == RequestGroup::Main {
            if self.error_counter > 0 {
                debug!(errors = self.error_counter, "main fetch succeeded, clearing error counter");
            }
            self.error_counter = 0;
            self.main_present = true;
        }
    }

    /// A successful set POST of `group`. Only a Main set resets the counter.
    pub fn record_set_success(&mut self, group: RequestGroup) {
        if group == RequestGroup::Main {
            self.error_counter = 0;
        }
    }

    /// Counts one failed fetch or set. Returns true exactly when this failure
    /// pushed the counter past [`MAX_ERRORS`]; the caller purges then.
    pub fn record_failure(&mut self) -> bool {
        self.error_counter = self.error_counter.saturating_add(1);
        if self.error_counter == MAX_ERRORS + 1 {
            warn!(errors = self.error_counter, "too many consecutive failures, purging device state");
            true
        } else {
            false
        }
    }

    /// Forgets everything learned from the device. Units stay known since
    /// the units sensor survives a purge.
    pub fn purge(&mut self) {
        self.logged_in = false;
        self.plant_resolved = false;
        self.main_present = false;
        self.dhw_range_known = false;
        self.zone_modes.iter_mut().for_each(|z| *z = false);
    }

    pub fn snapshot(&self, setting_in_progress: bool) -> Availability {
        let available = self.is_available();
        let base = available && self.units_known;
        Availability {
            available,
            ch_available: self.zone_modes.iter().map(|known| base && *known).collect(),
            dhw_available: base && self.dhw_range_known,
            setting_in_progress,
        }
    }
}
