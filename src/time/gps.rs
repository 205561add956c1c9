use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::{Error, Result};
use crate::protocol::GpsSnapshot;
use crate::sync::epoch::absolute_to_gps_time;
use super::clock::SharedClock;

/// Interval between GPS polls while waiting for a fix
pub const FIX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Quality of the current GPS solution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FixType {
    NoFix,
    Fix2D,
    Fix3D,
}

/// Latest solution reported by a GPS receiver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    /// Solution quality
    pub fix_type: FixType,
    /// GPS week number; zero until the receiver knows the time
    pub week: u16,
    /// Milliseconds into the GPS week
    pub ms_into_week: u32,
    /// Position and accuracy
    pub position: GpsSnapshot,
    /// Monotonic instant at which `ms_into_week` was current. `None` when
    /// the source reads the time on demand, so it is current when queried.
    pub time_captured: Option<Instant>,
}

impl GpsFix {
    /// A receiver state with nothing known yet
    pub fn none() -> Self {
        GpsFix {
            fix_type: FixType::NoFix,
            week: 0,
            ms_into_week: 0,
            position: GpsSnapshot::default(),
            time_captured: None,
        }
    }

    /// Fix usable for positioning and timing (3-D)
    pub fn is_valid(&self) -> bool {
        self.fix_type >= FixType::Fix3D
    }

    /// Time elapsed since `ms_into_week` was current
    pub fn age(&self) -> Duration {
        self.time_captured.map(|at| at.elapsed()).unwrap_or(Duration::ZERO)
    }
}

impl Default for GpsFix {
    fn default() -> Self {
        Self::none()
    }
}

/// Source of GPS time and position
pub trait GpsSource: Send {
    /// Consumes whatever the receiver produced since the last call
    fn update(&mut self) -> Result<()>;

    /// Most recent solution
    fn latest(&self) -> GpsFix;

    /// Whether the most recent solution is a 3-D fix
    fn has_fix(&self) -> bool {
        self.latest().is_valid()
    }
}

/// How long initialization may wait for the first fix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixWait {
    /// Block until a fix arrives; a node without sky view never starts
    Forever,
    /// Fail with [`Error::Timeout`] after the given time
    Within(Duration),
}

impl From<Option<Duration>> for FixWait {
    fn from(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(limit) => FixWait::Within(limit),
            None => FixWait::Forever,
        }
    }
}

/// Polls the receiver until it reports a 3-D fix
pub async fn wait_for_fix(gps: &mut dyn GpsSource, policy: FixWait) -> Result<GpsFix> {
    let started = Instant::now();
    info!("Waiting for GPS fix...");

    loop {
        if let Err(e) = gps.update() {
            debug!("GPS update failed while waiting for fix: {}", e);
        }

        let fix = gps.latest();
        if fix.is_valid() {
            info!(
                "GPS fix acquired after {:.1}s ({} satellites)",
                started.elapsed().as_secs_f64(),
                fix.position.satellites
            );
            return Ok(fix);
        }

        if let FixWait::Within(limit) = policy {
            if started.elapsed() >= limit {
                return Err(Error::timeout(format!("no GPS fix within {:?}", limit)));
            }
        }

        tokio::time::sleep(FIX_POLL_INTERVAL).await;
    }
}

/// GPS stand-in with a fixed position and time taken from a reference clock
///
/// Used for bench runs without a receiver attached and for tests.
pub struct SimulatedGps {
    reference: SharedClock,
    position: GpsSnapshot,
    leap_seconds: i64,
    updates_until_fix: u32,
    fix: GpsFix,
}

impl SimulatedGps {
    /// Creates a receiver that reports a fix on its first update
    pub fn new(reference: SharedClock, position: GpsSnapshot, leap_seconds: i64) -> Self {
        SimulatedGps {
            reference,
            position,
            leap_seconds,
            updates_until_fix: 0,
            fix: GpsFix::none(),
        }
    }

    /// Delays the first fix by `updates` calls to [`update`](GpsSource::update)
    pub fn acquire_after(mut self, updates: u32) -> Self {
        self.updates_until_fix = updates;
        self
    }

}

impl GpsSource for SimulatedGps {
    fn update(&mut self) -> Result<()> {
        if self.updates_until_fix > 0 {
            self.updates_until_fix -= 1;
            return Ok(());
        }

        let now = self.reference.now_us()?;
        let (week, ms_into_week) = absolute_to_gps_time(now, self.leap_seconds)
            .ok_or_else(|| Error::gps("reference clock outside GPS time range"))?;

        if !self.fix.is_valid() {
            warn!("Simulated GPS in use; latency figures reflect host clocks only");
        }
        self.fix = GpsFix {
            fix_type: FixType::Fix3D,
            week,
            ms_into_week,
            position: self.position,
            time_captured: None,
        };
        Ok(())
    }

    fn latest(&self) -> GpsFix {
        self.fix
    }
}
