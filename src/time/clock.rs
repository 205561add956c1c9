use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::core::{Error, Result};

/// Node-wide absolute clock
///
/// Only the time synchroniser writes it; everything else reads it. All
/// values are microseconds since the Unix epoch.
pub trait WallClock: Send + Sync {
    /// Reads the clock
    fn now_us(&self) -> Result<i64>;

    /// Overwrites the clock, causing a visible discontinuity
    fn set_us(&self, unix_us: i64) -> Result<()>;

    /// Starts a gradual correction by `delta_us` without a discontinuity
    fn slew_us(&self, delta_us: i64) -> Result<()>;

    /// Short name for diagnostics
    fn name(&self) -> &'static str;
}

/// Clock handle shared by the time synchroniser and the roles
pub type SharedClock = Arc<dyn WallClock>;

fn host_now_us() -> Result<i64> {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::clock(format!("system time before Unix epoch: {}", e)))?;
    Ok(since.as_micros() as i64)
}

/// The operating system realtime clock
///
/// Writing requires CAP_SYS_TIME (root on most systems).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        SystemClock
    }
}

#[cfg(unix)]
impl WallClock for SystemClock {
    fn now_us(&self) -> Result<i64> {
        use nix::time::{clock_gettime, ClockId};

        let ts = clock_gettime(ClockId::CLOCK_REALTIME)
            .map_err(|e| Error::clock(format!("clock_gettime failed: {}", e)))?;
        Ok(ts.tv_sec() as i64 * 1_000_000 + ts.tv_nsec() as i64 / 1_000)
    }

    fn set_us(&self, unix_us: i64) -> Result<()> {
        use nix::sys::time::TimeSpec;
        use nix::time::{clock_settime, ClockId};

        let secs = unix_us.div_euclid(1_000_000);
        let nanos = unix_us.rem_euclid(1_000_000) * 1_000;
        let ts = TimeSpec::new(secs as libc::time_t, nanos as libc::c_long);
        clock_settime(ClockId::CLOCK_REALTIME, ts).map_err(|e| match e {
            nix::errno::Errno::EPERM => Error::clock("setting the clock requires root"),
            other => Error::clock(format!("clock_settime failed: {}", other)),
        })
    }

    #[allow(unsafe_code)]
    fn slew_us(&self, delta_us: i64) -> Result<()> {
        let delta = libc::timeval {
            tv_sec: delta_us.div_euclid(1_000_000) as libc::time_t,
            tv_usec: delta_us.rem_euclid(1_000_000) as libc::suseconds_t,
        };

        let ret = unsafe { libc::adjtime(&delta, std::ptr::null_mut()) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::EPERM) {
                Error::clock("slewing the clock requires root")
            } else {
                Error::clock(format!("adjtime failed: {}", err))
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

#[cfg(not(unix))]
impl WallClock for SystemClock {
    fn now_us(&self) -> Result<i64> {
        host_now_us()
    }

    fn set_us(&self, _unix_us: i64) -> Result<()> {
        Err(Error::clock("setting the system clock is not supported on this platform"))
    }

    fn slew_us(&self, _delta_us: i64) -> Result<()> {
        Err(Error::clock("slewing the system clock is not supported on this platform"))
    }

    fn name(&self) -> &'static str {
        "system"
    }
}

/// Maximum slew rate of [`SoftClock`], matching adjtime(3)
const SOFT_SLEW_PPM: i64 = 500;

#[derive(Debug)]
struct SoftState {
    /// Offset from the host clock already in effect
    offset_us: i64,
    /// Correction being slewed in
    slew_total_us: i64,
    /// When the current slew began
    slew_started: Instant,
}

impl SoftState {
    fn slewed_so_far(&self) -> i64 {
        let elapsed_us = self.slew_started.elapsed().as_micros() as i64;
        let budget = elapsed_us.saturating_mul(SOFT_SLEW_PPM) / 1_000_000;
        if self.slew_total_us.abs() <= budget {
            self.slew_total_us
        } else {
            self.slew_total_us.signum() * budget
        }
    }
}

/// Process-local clock kept as an offset over the host clock
///
/// Lets an unprivileged node discipline its own notion of time without
/// touching the operating system clock.
#[derive(Debug)]
pub struct SoftClock {
    state: Mutex<SoftState>,
}

impl SoftClock {
    pub fn new() -> Self {
        SoftClock {
            state: Mutex::new(SoftState {
                offset_us: 0,
                slew_total_us: 0,
                slew_started: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Correction still waiting to be slewed in
    pub fn pending_slew_us(&self) -> i64 {
        let state = self.lock();
        state.slew_total_us - state.slewed_so_far()
    }
}

impl Default for SoftClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for SoftClock {
    fn now_us(&self) -> Result<i64> {
        let state = self.lock();
        Ok(host_now_us()? + state.offset_us + state.slewed_so_far())
    }

    fn set_us(&self, unix_us: i64) -> Result<()> {
        let mut state = self.lock();
        state.offset_us = unix_us - host_now_us()?;
        state.slew_total_us = 0;
        state.slew_started = Instant::now();
        Ok(())
    }

    fn slew_us(&self, delta_us: i64) -> Result<()> {
        // A new slew replaces whatever is still pending, like adjtime(3)
        let mut state = self.lock();
        let done = state.slewed_so_far();
        state.offset_us += done;
        state.slew_total_us = delta_us;
        state.slew_started = Instant::now();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "soft"
    }
}

/// Write applied to a [`ManualClock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockWrite {
    Set(i64),
    Slew(i64),
}

#[derive(Debug)]
struct ManualState {
    now_us: i64,
    failing: bool,
    writes: Vec<ClockWrite>,
}

/// Deterministic clock for simulations and tests
///
/// Time moves only through [`advance`](Self::advance) and writes; slews
/// take effect immediately and are recorded.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new(now_us: i64) -> Self {
        ManualClock {
            state: Mutex::new(ManualState {
                now_us,
                failing: false,
                writes: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves time forward
    pub fn advance(&self, by: Duration) {
        self.lock().now_us += by.as_micros() as i64;
    }

    /// Makes every read and write fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Writes applied so far, oldest first
    pub fn writes(&self) -> Vec<ClockWrite> {
        self.lock().writes.clone()
    }
}

impl WallClock for ManualClock {
    fn now_us(&self) -> Result<i64> {
        let state = self.lock();
        if state.failing {
            return Err(Error::clock("manual clock read failure"));
        }
        Ok(state.now_us)
    }

    fn set_us(&self, unix_us: i64) -> Result<()> {
        let mut state = self.lock();
        if state.failing {
            return Err(Error::clock("manual clock write failure"));
        }
        state.now_us = unix_us;
        state.writes.push(ClockWrite::Set(unix_us));
        Ok(())
    }

    fn slew_us(&self, delta_us: i64) -> Result<()> {
        let mut state = self.lock();
        if state.failing {
            return Err(Error::clock("manual clock write failure"));
        }
        state.now_us += delta_us;
        state.writes.push(ClockWrite::Slew(delta_us));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}
