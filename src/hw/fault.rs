//! Catastrophic-error detection.
//!
//! The device exposes a fault register that "hardware" latches when it
//! hits an unrecoverable failure. The [`FatalMonitor`] watchdog
//! periodically inspects the register; on a latched fault it logs the
//! fault class, puts the device into the catastrophic error state, and
//! the context fans an error transition out to every live queue pair,
//! flushing their outstanding work.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::verbs::context::Context;
use crate::verbs::error::{Result, VerbsError};

/// Class of a catastrophic device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Internal device error.
    Internal,
    /// Uplink (bus) error.
    Uplink,
    /// Device memory error.
    Memory,
    /// Parity error.
    Parity,
    /// Unclassified failure.
    Unknown,
}

impl FaultClass {
    fn code(self) -> u32 {
        match self {
            FaultClass::Internal => 1,
            FaultClass::Uplink => 2,
            FaultClass::Memory => 3,
            FaultClass::Parity => 4,
            FaultClass::Unknown => 5,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => FaultClass::Internal,
            2 => FaultClass::Uplink,
            3 => FaultClass::Memory,
            4 => FaultClass::Parity,
            5 => FaultClass::Unknown,
            _ => return None,
        })
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultClass::Internal => "internal",
            FaultClass::Uplink => "uplink",
            FaultClass::Memory => "memory",
            FaultClass::Parity => "parity",
            FaultClass::Unknown => "unknown",
        })
    }
}

/// The device fault register. Zero when healthy; the first latched
/// fault class sticks.
pub(crate) struct FaultRegister(AtomicU32);

impl FaultRegister {
    pub(crate) fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub(crate) fn latch(&self, class: FaultClass) {
        let _ = self
            .0
            .compare_exchange(0, class.code(), Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn read(&self) -> Option<FaultClass> {
        FaultClass::from_code(self.0.load(Ordering::Acquire))
    }
}

struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Sleep for the interval. Returns true if a stop was requested.
    fn wait_for(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        let mut stopped = self.stopped.lock().unwrap();
        loop {
            if *stopped {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(stopped, deadline - now).unwrap();
            stopped = guard;
        }
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap() = true;
        self.cv.notify_all();
    }
}

struct Worker {
    stop: Arc<StopSignal>,
    thread: thread::JoinHandle<()>,
}

/// The catastrophic-error watchdog.
///
/// Periodically inspects the device fault register and takes the device
/// down when a fault is latched. Restartable: `stop` then `start` arms
/// a fresh periodic trigger; starting an already-armed monitor fails
/// instead of double-arming.
pub struct FatalMonitor {
    ctx: Context,
    interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl FatalMonitor {
    /// Create a monitor with the interval from the device config.
    pub fn new(ctx: &Context) -> Self {
        Self::with_interval(ctx, ctx.config().watchdog_interval())
    }

    /// Create a monitor with an explicit inspection interval.
    pub fn with_interval(ctx: &Context, interval: Duration) -> Self {
        Self {
            ctx: ctx.clone(),
            interval,
            worker: Mutex::new(None),
        }
    }

    /// Arm the periodic trigger. Fails with `ResourceBusy` if the
    /// monitor is already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return Err(VerbsError::ResourceBusy("watchdog already armed"));
        }

        let stop = Arc::new(StopSignal::new());
        let thread_stop = stop.clone();
        let ctx = self.ctx.clone();
        let interval = self.interval;
        let clock = self.ctx.clock().clone();
        let thread = thread::Builder::new()
            .name("softib-watchdog".to_string())
            .spawn(move || {
                let armed_at = clock.now();
                loop {
                    if thread_stop.wait_for(interval) {
                        break;
                    }
                    scan_once(&ctx, &clock, armed_at);
                }
            })
            .map_err(|_| VerbsError::InsufficientResources("failed to spawn watchdog thread"))?;

        *worker = Some(Worker { stop, thread });
        Ok(())
    }

    /// Disarm the periodic trigger and wait for the worker to exit.
    /// Idempotent.
    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            worker.stop.stop();
            let _ = worker.thread.join();
        }
    }

    /// Check whether the periodic trigger is armed.
    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    /// Run one inspection of the fault register immediately, without
    /// waiting for the periodic trigger. Returns true if a fault is
    /// latched.
    pub fn scan(&self) -> bool {
        let clock = self.ctx.clock();
        scan_once(&self.ctx, clock, clock.now())
    }
}

fn scan_once(ctx: &Context, clock: &quanta::Clock, armed_at: quanta::Instant) -> bool {
    let Some(class) = ctx.fault_register().read() else {
        return false;
    };
    if !ctx.is_fatal() {
        let armed_for = clock.now().duration_since(armed_at);
        log::error!(
            "{}: {} fault latched (watchdog armed for {} ms)",
            ctx.config().name,
            class,
            armed_for.as_millis()
        );
        ctx.raise_fatal(class);
    }
    true
}

impl Drop for FatalMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
