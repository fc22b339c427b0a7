//! Decides which request group the next tick fetches and how long to wait
//! before the tick after it. Pure state; the engine owns the timer.

use std::time::Duration;

use crate::types::RequestGroup;

/// At or above this many consecutive errors the cadence slows down and
/// low-priority groups are skipped.
pub const ERROR_BACKOFF_THRESHOLD: u32 = 5;
pub const BACKOFF_FACTOR: u32 = 5;

/// Engine facts a decision depends on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TickInput<'a> {
    pub available: bool,
    pub error_counter: u32,
    /// Read groups that would confirm a submitted write.
    pub awaiting_reads: &'a [RequestGroup],
}

#[derive(Debug)]
pub(crate) struct FetchScheduler {
    high: Vec<RequestGroup>,
    low: Vec<RequestGroup>,
    high_cursor: usize,
    low_cursor: usize,
    confirm_cursor: usize,
    ticks: u64,
    base_delay: Duration,
}

impl FetchScheduler {
    /// `Main` is always part of the high-priority list.
    pub fn new(high: Vec<RequestGroup>, low: Vec<RequestGroup>, base_delay: Duration) -> Self {
        let mut high_list = vec![RequestGroup::Main];
        for g in high {
            if !high_list.contains(&g) {
                high_list.push(g);
            }
        }
        let mut low_list: Vec<RequestGroup> = Vec::new();
        for g in low {
            if !high_list.contains(&g) && !low_list.contains(&g) {
                low_list.push(g);
            }
        }
        Self {
            high: high_list,
            low: low_list,
            high_cursor: 0,
            low_cursor: 0,
            confirm_cursor: 0,
            ticks: 0,
            base_delay,
        }
    }

    pub fn high_priority(&self) -> &[RequestGroup] {
        &self.high
    }

    pub fn low_priority(&self) -> &[RequestGroup] {
        &self.low
    }

    pub fn next_group(&mut self, input: TickInput<'_>) -> RequestGroup {
        if !input.available || input.error_counter > 0 {
            return RequestGroup::Main;
        }

        if !input.awaiting_reads.is_empty() {
            let idx = self.confirm_cursor % input.awaiting_reads.len();
            self.confirm_cursor = self.confirm_cursor.wrapping_add(1);
            return input.awaiting_reads[idx];
        }

        self.ticks += 1;
        let backoff = input.error_counter >= ERROR_BACKOFF_THRESHOLD;
        let period = self.high.len() as u64 + 1;
        if !backoff && !self.low.is_empty() && self.ticks % period == 0 {
            let group = self.low[self.low_cursor % self.low.len()];
            self.low_cursor = (self.low_cursor + 1) % self.low.len();
            return group;
        }

        let group = self.high[self.high_cursor % self.high.len()];
        self.high_cursor = (self.high_cursor + 1) % self.high.len();
        group
    }

    /// Delay before the next tick given the error counter after this one.
    pub fn delay(&self, error_counter: u32) -> Duration {
        if error_counter >= ERROR_BACKOFF_THRESHOLD {
            self.base_delay * BACKOFF_FACTOR
        } else {
            self.base_delay
        }
    }

    pub fn reset(&mut self) {
        self.high_cursor = 0;
        self.low_cursor = 0;
        self.confirm_cursor = 0;
        self.ticks = 0;
    }
}
