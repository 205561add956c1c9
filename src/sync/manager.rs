use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::{Error, Result, TimeSyncConfig};
use crate::time::{GpsFix, SharedClock};
use super::epoch::gps_time_to_absolute;

/// What a reconciliation does to the wall clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Overwrite the clock with GPS time (visible discontinuity)
    HardSet,
    /// Steer the clock gradually toward GPS time
    Slew,
    /// Clock already agrees with GPS time
    NoOp,
}

/// Chooses the correction for an offset of `offset_us` (local - GPS)
pub fn classify_offset(offset_us: i64, force: bool, threshold_us: i64) -> SyncAction {
    if force || offset_us.unsigned_abs() > threshold_us.unsigned_abs() {
        SyncAction::HardSet
    } else if offset_us != 0 {
        SyncAction::Slew
    } else {
        SyncAction::NoOp
    }
}

/// Result of the most recent successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockOffset {
    /// Local wall clock minus GPS absolute time, microseconds
    pub last_offset_us: Option<i64>,
    /// When that offset was measured
    pub last_sync: Option<Instant>,
}

/// Outcome of one reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Correction applied
    pub action: SyncAction,
    /// Offset measured before the correction
    pub offset_us: i64,
    /// GPS time the clock was compared against
    pub gps_time_us: i64,
}

/// Keeps the wall clock aligned with GPS time
///
/// Both ends of the link run one of these against their own receiver, which
/// is what lets the receiver subtract a timestamp taken on another node.
pub struct TimeSync {
    clock: SharedClock,
    config: TimeSyncConfig,
    state: ClockOffset,
    next_due: Duration,
}

impl TimeSync {
    /// Creates a synchroniser; the first periodic run is one period away
    pub fn new(clock: SharedClock, config: TimeSyncConfig) -> Self {
        let next_due = config.period;
        TimeSync {
            clock,
            config,
            state: ClockOffset::default(),
            next_due,
        }
    }

    /// The disciplined clock
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// State of the last successful reconciliation
    pub fn offset(&self) -> ClockOffset {
        self.state
    }

    /// Converts GPS week time with the configured leap second count
    pub fn gps_time_to_absolute(&self, week: u16, ms_into_week: u32) -> i64 {
        gps_time_to_absolute(week, ms_into_week, self.config.leap_seconds)
    }

    /// Compares the wall clock with GPS time and corrects it
    ///
    /// The fix's time of week is advanced by its age, so a sentence parsed
    /// earlier in the second still yields the current GPS time. On any
    /// failure the previous offset and sync time are kept.
    pub fn reconcile(&mut self, fix: &GpsFix, force: bool) -> Result<SyncOutcome> {
        if !fix.is_valid() {
            return Err(Error::gps("no valid fix to synchronise against"));
        }
        if fix.week == 0 {
            return Err(Error::gps("receiver has not resolved the GPS week"));
        }

        let local_us = self.clock.now_us()?;
        let age_us = i64::try_from(fix.age().as_micros()).unwrap_or(i64::MAX);
        let gps_time_us = self
            .gps_time_to_absolute(fix.week, fix.ms_into_week)
            .saturating_add(age_us);
        let offset_us = local_us - gps_time_us;

        let action = classify_offset(offset_us, force, self.config.step_threshold_us);
        match action {
            SyncAction::HardSet => {
                self.clock.set_us(gps_time_us)?;
                info!(
                    "Clock hard-set to GPS time (offset was {} us{})",
                    offset_us,
                    if force { ", forced" } else { "" }
                );
            }
            SyncAction::Slew => {
                self.clock.slew_us(-offset_us)?;
                debug!("Slewing clock by {} us toward GPS time", -offset_us);
            }
            SyncAction::NoOp => debug!("Clock agrees with GPS time"),
        }

        self.state = ClockOffset {
            last_offset_us: Some(offset_us),
            last_sync: Some(Instant::now()),
        };
        Ok(SyncOutcome {
            action,
            offset_us,
            gps_time_us,
        })
    }

    /// Runs a non-forced reconciliation when the period has elapsed
    ///
    /// `now` is monotonic time since the control loop started. Failures are
    /// logged and retried on the next period.
    pub fn maybe_reconcile(&mut self, now: Duration, fix: &GpsFix) -> Option<SyncOutcome> {
        if now < self.next_due {
            return None;
        }
        self.next_due = now + self.config.period;

        match self.reconcile(fix, false) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Periodic clock sync skipped: {}", e);
                None
            }
        }
    }
}
