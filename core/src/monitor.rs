//! Resource monitors: active elapsed time and peak memory.
//!
//! Both monitors share the same switch semantics:
//! - `enable`/`disable` start and stop accounting; doing either twice is an error
//!   (`*_anyway` variants skip the check).
//! - `suspend`/`unsuspend` pause accounting without touching the totals and must
//!   be balanced.
//! - `add` folds another monitor's totals into this one (time sums, peak maxes).

use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// Snapshot of resources consumed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub elapsed: Duration,
    pub peak_bytes: u64,
}

impl ResourceUsage {
    #[must_use]
    pub fn new(elapsed: Duration, peak_bytes: u64) -> Self {
        Self {
            elapsed,
            peak_bytes,
        }
    }

    /// Sum elapsed time, keep the larger peak.
    pub fn merge(&mut self, other: &ResourceUsage) {
        self.elapsed += other.elapsed;
        self.peak_bytes = self.peak_bytes.max(other.peak_bytes);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Switch {
    enabled: bool,
    suspended: bool,
}

impl Switch {
    fn running(self) -> bool {
        self.enabled && !self.suspended
    }

    fn enable(&mut self) -> Result<(), MonitorError> {
        if self.enabled {
            return Err(MonitorError::AlreadyEnabled);
        }
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), MonitorError> {
        if !self.enabled {
            return Err(MonitorError::NotEnabled);
        }
        self.enabled = false;
        Ok(())
    }

    fn suspend(&mut self) -> Result<(), MonitorError> {
        if self.suspended {
            return Err(MonitorError::AlreadySuspended);
        }
        self.suspended = true;
        Ok(())
    }

    fn unsuspend(&mut self) -> Result<(), MonitorError> {
        if !self.suspended {
            return Err(MonitorError::NotSuspended);
        }
        self.suspended = false;
        Ok(())
    }

    fn check_enabled(self) -> Result<(), MonitorError> {
        if self.enabled {
            Ok(())
        } else {
            Err(MonitorError::ExpectedEnabled)
        }
    }

    fn check_disabled(self) -> Result<(), MonitorError> {
        if self.enabled {
            Err(MonitorError::ExpectedDisabled)
        } else {
            Ok(())
        }
    }
}

/// Accumulates wall-clock time while enabled and not suspended.
#[derive(Debug, Clone, Default)]
pub struct ElapsedTimer {
    switch: Switch,
    lap_start: Option<Instant>,
    total: Duration,
}

impl ElapsedTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A timer that is already running.
    #[must_use]
    pub fn started() -> Self {
        let mut timer = Self::new();
        timer.enable_anyway();
        timer
    }

    fn open_lap(&mut self) {
        if self.switch.running() && self.lap_start.is_none() {
            self.lap_start = Some(Instant::now());
        }
    }

    fn close_lap(&mut self) {
        if let Some(start) = self.lap_start.take() {
            self.total += start.elapsed();
        }
    }

    pub fn enable(&mut self) -> Result<(), MonitorError> {
        self.switch.enable()?;
        self.open_lap();
        Ok(())
    }

    pub fn enable_anyway(&mut self) {
        if !self.switch.enabled {
            self.switch.enabled = true;
            self.open_lap();
        }
    }

    pub fn disable(&mut self) -> Result<(), MonitorError> {
        self.close_lap();
        self.switch.disable()
    }

    pub fn disable_anyway(&mut self) {
        self.close_lap();
        self.switch.enabled = false;
    }

    pub fn suspend(&mut self) -> Result<(), MonitorError> {
        self.switch.suspend()?;
        self.close_lap();
        Ok(())
    }

    pub fn unsuspend(&mut self) -> Result<(), MonitorError> {
        self.switch.unsuspend()?;
        self.open_lap();
        Ok(())
    }

    /// Zero the total. A running timer keeps running from now.
    pub fn reset(&mut self) {
        self.total = Duration::ZERO;
        self.lap_start = None;
        self.open_lap();
    }

    /// Fold another timer's total into this one.
    pub fn add(&mut self, other: &ElapsedTimer) {
        self.total += other.elapsed();
    }

    pub fn add_elapsed(&mut self, elapsed: Duration) {
        self.total += elapsed;
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.total + self.lap_start.map_or(Duration::ZERO, |start| start.elapsed())
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.switch.enabled
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.switch.suspended
    }

    pub fn check_enabled(&self) -> Result<(), MonitorError> {
        self.switch.check_enabled()
    }

    pub fn check_disabled(&self) -> Result<(), MonitorError> {
        self.switch.check_disabled()
    }
}

/// Tracks the peak resident memory observed at sample points.
///
/// Samples are taken on enable, disable, suspend and every explicit `sample`
/// call, so the peak is the largest resident set seen at those points.
#[derive(Debug, Clone, Default)]
pub struct MemoryTracker {
    switch: Switch,
    peak: u64,
}

impl MemoryTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current resident set if accounting is active.
    pub fn sample(&mut self) {
        if self.switch.running() {
            self.peak = self.peak.max(current_rss_bytes());
        }
    }

    pub fn enable(&mut self) -> Result<(), MonitorError> {
        self.switch.enable()?;
        self.sample();
        Ok(())
    }

    pub fn enable_anyway(&mut self) {
        self.switch.enabled = true;
        self.sample();
    }

    pub fn disable(&mut self) -> Result<(), MonitorError> {
        self.sample();
        self.switch.disable()
    }

    pub fn disable_anyway(&mut self) {
        self.sample();
        self.switch.enabled = false;
    }

    pub fn suspend(&mut self) -> Result<(), MonitorError> {
        self.sample();
        self.switch.suspend()
    }

    pub fn unsuspend(&mut self) -> Result<(), MonitorError> {
        self.switch.unsuspend()?;
        self.sample();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.peak = 0;
        self.sample();
    }

    pub fn add(&mut self, other: &MemoryTracker) {
        self.add_peak(other.peak_bytes());
    }

    pub fn add_peak(&mut self, bytes: u64) {
        self.peak = self.peak.max(bytes);
    }

    #[must_use]
    pub fn peak_bytes(&self) -> u64 {
        self.peak
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.switch.enabled
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.switch.suspended
    }

    pub fn check_enabled(&self) -> Result<(), MonitorError> {
        self.switch.check_enabled()
    }

    pub fn check_disabled(&self) -> Result<(), MonitorError> {
        self.switch.check_disabled()
    }
}

/// Samples the resident set on a background thread until stopped.
///
/// `MemoryTracker` only sees the boundaries of a region; the watch also sees
/// allocations that are freed again before the region ends.
#[derive(Debug)]
pub struct MemoryWatch {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<u64>>,
}

impl MemoryWatch {
    #[must_use]
    pub fn start(interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("memory-watch".to_string())
            .spawn(move || {
                let mut peak = current_rss_bytes();
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    peak = peak.max(current_rss_bytes());
                }
                peak.max(current_rss_bytes())
            })
            .inspect_err(|e| tracing::warn!("memory watch unavailable: {e}"))
            .ok();
        Self {
            stop: Some(stop),
            handle,
        }
    }

    /// Stop sampling and return the largest resident set seen.
    #[must_use]
    pub fn stop(mut self) -> u64 {
        self.finish().unwrap_or_else(current_rss_bytes)
    }

    fn finish(&mut self) -> Option<u64> {
        // disconnecting wakes the sampler immediately
        drop(self.stop.take());
        self.handle.take()?.join().ok()
    }
}

impl Drop for MemoryWatch {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Timer and memory tracker driven together.
#[derive(Debug, Clone, Default)]
pub struct ResourceMonitors {
    pub timer: ElapsedTimer,
    pub memory: MemoryTracker,
}

impl ResourceMonitors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self) -> Result<(), MonitorError> {
        self.timer.enable()?;
        self.memory.enable()
    }

    pub fn enable_anyway(&mut self) {
        self.timer.enable_anyway();
        self.memory.enable_anyway();
    }

    pub fn disable_anyway(&mut self) {
        self.timer.disable_anyway();
        self.memory.disable_anyway();
    }

    pub fn suspend(&mut self) -> Result<(), MonitorError> {
        self.timer.suspend()?;
        self.memory.suspend()
    }

    pub fn unsuspend(&mut self) -> Result<(), MonitorError> {
        self.timer.unsuspend()?;
        self.memory.unsuspend()
    }

    pub fn reset(&mut self) {
        self.timer.reset();
        self.memory.reset();
    }

    pub fn add(&mut self, other: &ResourceMonitors) {
        self.timer.add(&other.timer);
        self.memory.add(&other.memory);
    }

    pub fn add_usage(&mut self, usage: &ResourceUsage) {
        self.timer.add_elapsed(usage.elapsed);
        self.memory.add_peak(usage.peak_bytes);
    }

    #[must_use]
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage::new(self.timer.elapsed(), self.memory.peak_bytes())
    }
}

/// Current resident set size of this process in bytes.
#[must_use]
pub fn current_rss_bytes() -> u64 {
    statm_rss_bytes().unwrap_or_else(peak_rss_bytes)
}

#[cfg(unix)]
fn statm_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(page_size).ok().map(|size| pages * size)
}

#[cfg(not(unix))]
fn statm_rss_bytes() -> Option<u64> {
    None
}

#[cfg(unix)]
fn peak_rss_bytes() -> u64 {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the struct we hand it
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) } != 0 {
        return 0;
    }
    // SAFETY: getrusage returned 0 so the struct is initialised
    let usage = unsafe { usage.assume_init() };
    let max_rss = u64::try_from(usage.ru_maxrss).unwrap_or(0);
    // ru_maxrss is kilobytes on Linux, bytes on macOS
    if cfg!(target_os = "macos") {
        max_rss
    } else {
        max_rss * 1024
    }
}

#[cfg(not(unix))]
fn peak_rss_bytes() -> u64 {
    0
}

/// Misuse of a monitor's enable/suspend protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("monitor already enabled")]
    AlreadyEnabled,
    #[error("monitor not enabled")]
    NotEnabled,
    #[error("monitor already suspended")]
    AlreadySuspended,
    #[error("monitor not suspended")]
    NotSuspended,
    #[error("monitor expected to be enabled")]
    ExpectedEnabled,
    #[error("monitor expected to be disabled")]
    ExpectedDisabled,
}
