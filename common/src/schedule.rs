use std::time::Duration;

use chrono::{NaiveTime, Timelike};

use crate::config::ControlConfig;

pub const MIN_SLEEP_SECS: u64 = 60;

/// Whether `now` falls inside the configured active window.
///
/// `None` means the wall clock has not been synchronized yet; the window is
/// then treated as open so the device cannot get stuck in a permanent
/// inactive state at boot.
pub fn is_active_period(config: &ControlConfig, now: Option<NaiveTime>) -> bool {
    let Some(now) = now else {
        return true;
    };

    let hour = now.hour();
    let start = config.start_hour();
    let end = config.end_hour();

    if start < end {
        (start..end).contains(&hour)
    } else {
        // Window wraps past midnight.
        hour >= start || hour < end
    }
}

/// Time until the window next opens, never shorter than [`MIN_SLEEP_SECS`].
pub fn time_to_next_activation(config: &ControlConfig, now: NaiveTime) -> Duration {
    let hour = i64::from(now.hour());
    let start = i64::from(config.start_hour());
    let end = i64::from(config.end_hour());

    // Work in a 0..48 hour space, then fold back into the next 24 hours.
    let next_wake_hour = if hour < end { start } else { start + 24 };
    let mut hours_to_wake = next_wake_hour - hour;
    if hours_to_wake > 24 {
        hours_to_wake -= 24;
    }

    let elapsed_in_hour = i64::from(now.minute()) * 60 + i64::from(now.second());
    let seconds = hours_to_wake * 3600 - elapsed_in_hour;

    Duration::from_secs(u64::try_from(seconds).unwrap_or(0).max(MIN_SLEEP_SECS))
}

/// Time-boxed exception to the schedule entered through the physical wake
/// trigger. It never affects the safety interlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManualOverrideWindow {
    active_until_ms: u64,
}

impl ManualOverrideWindow {
    pub fn starting_at(now_ms: u64, duration_ms: u64) -> Self {
        Self {
            active_until_ms: now_ms.saturating_add(duration_ms),
        }
    }

    pub fn active_until_ms(&self) -> u64 {
        self.active_until_ms
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms < self.active_until_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.active_until_ms.saturating_sub(now_ms)
    }
}
