//! Completion queue and work completion.

mod wc;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub use self::wc::*;

use crate::verbs::context::Context;
use crate::verbs::error::{Result, VerbsError};

struct CqState {
    entries: VecDeque<Wc>,

    /// Set when an append was rejected for lack of space. Permanent.
    overrun: bool,

    /// Whether the overrun has been reported to a poller yet.
    overrun_reported: bool,

    /// Completions rejected since the overrun.
    lost: u64,

    /// Pending-entry threshold of the armed notification, if any.
    armed: Option<u32>,

    /// A notification fired and has not been consumed by a waiter.
    fired: bool,
}

/// Ownership holder of completion queue.
struct CqInner {
    ctx: Context,
    capacity: u32,
    state: Mutex<CqState>,

    /// Signalled on every append and on notification firing.
    avail: Condvar,
}

/// Completion queue.
///
/// An ordered buffer of work completions, shared by one or more work
/// queues. Completions from one work queue are observed in the order
/// the work was posted; the interleaving between different work queues
/// sharing the CQ is unspecified.
///
/// If completions arrive while the queue is at capacity they are
/// rejected and the CQ enters a permanent overrun state, reported as
/// [`VerbsError::CqOverrun`] on the next poll.
pub struct Cq {
    inner: Arc<CqInner>,
}

impl Cq {
    /// Make a clone of the `Arc` pointer.
    pub fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for Cq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cq").field("capacity", &self.capacity()).finish()
    }
}

impl Cq {
    /// The default CQ depth.
    pub const DEFAULT_CQ_DEPTH: u32 = 128;

    /// Create a new completion queue.
    pub fn new(ctx: &Context, capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(VerbsError::InvalidParameter("CQ capacity cannot be zero"));
        }
        let max_capacity = ctx.attr().max_cqe;
        if capacity > max_capacity {
            return Err(VerbsError::CapabilityNotEnough("max_cqe", max_capacity, capacity));
        }
        Ok(Self {
            inner: Arc::new(CqInner {
                ctx: ctx.clone(),
                capacity,
                state: Mutex::new(CqState {
                    entries: VecDeque::with_capacity(capacity as usize),
                    overrun: false,
                    overrun_reported: false,
                    lost: 0,
                    armed: None,
                    fired: false,
                }),
                avail: Condvar::new(),
            }),
        })
    }

    /// Get the underlying [`Context`].
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Get the capacity of the completion queue.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Get the number of pending (unconsumed) completions.
    pub fn len(&self) -> u32 {
        self.inner.state.lock().unwrap().entries.len() as u32
    }

    /// Check whether no completions are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether the CQ has overrun. Once set, this never clears.
    pub fn is_overrun(&self) -> bool {
        self.inner.state.lock().unwrap().overrun
    }

    /// Get the number of completions rejected since the overrun.
    pub fn lost(&self) -> u64 {
        self.inner.state.lock().unwrap().lost
    }

    /// Non-blockingly poll as many completions as are pending.
    ///
    /// It is the caller's responsibility to check the status codes of
    /// the returned work completion entries.
    #[inline]
    pub fn poll(&self) -> Result<Vec<Wc>> {
        self.poll_some(self.capacity())
    }

    /// Non-blockingly poll with a limited number of expected work
    /// completions, in the order the engine appended them.
    ///
    /// Polling an empty queue returns an empty vector, not an error.
    /// The first poll after an overrun returns
    /// [`VerbsError::CqOverrun`] instead; subsequent polls drain
    /// whatever was buffered before the overrun.
    pub fn poll_some(&self, num: u32) -> Result<Vec<Wc>> {
        let mut state = self.inner.state.lock().unwrap();
        if state.overrun && !state.overrun_reported {
            state.overrun_reported = true;
            return Err(VerbsError::CqOverrun);
        }
        let n = (num as usize).min(state.entries.len());
        Ok(state.entries.drain(..n).collect())
    }

    /// Non-blockingly poll one work completion.
    #[inline]
    pub fn poll_one(&self) -> Result<Option<Wc>> {
        Ok(self.poll_some(1)?.pop())
    }

    /// Blockingly poll one work completion, suspending the calling
    /// thread until one is available or the timeout elapses.
    pub fn poll_one_blocking(&self, timeout: Duration) -> Result<Option<Wc>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.overrun && !state.overrun_reported {
                state.overrun_reported = true;
                return Err(VerbsError::CqOverrun);
            }
            if let Some(wc) = state.entries.pop_front() {
                return Ok(Some(wc));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .inner
                .avail
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    /// Arm a one-shot notification that fires when the number of
    /// pending completions reaches `threshold`.
    ///
    /// The notification fires exactly once per arm and must then be
    /// re-armed. Arming fires immediately if the threshold is already
    /// met. A threshold of zero is rejected.
    pub fn arm_notification(&self, threshold: u32) -> Result<()> {
        if threshold == 0 {
            return Err(VerbsError::InvalidParameter("notification threshold cannot be zero"));
        }
        let mut state = self.inner.state.lock().unwrap();
        if state.entries.len() >= threshold as usize {
            state.armed = None;
            state.fired = true;
            self.inner.avail.notify_all();
        } else {
            state.armed = Some(threshold);
        }
        Ok(())
    }

    /// Block until an armed notification fires or the timeout elapses.
    ///
    /// Consumes the fired notification; a subsequent wait needs a new
    /// arm. Returns [`VerbsError::TimedOut`] if nothing fired in time.
    pub fn wait_notification(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.fired {
                state.fired = false;
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(VerbsError::TimedOut);
            }
            let (guard, _) = self
                .inner
                .avail
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    /// Append a completion. Called by the device completion path; the
    /// ring lock of the completed work queue is never held here.
    pub(crate) fn append(&self, wc: Wc) {
        let mut state = self.inner.state.lock().unwrap();
        if state.entries.len() >= self.inner.capacity as usize {
            if !state.overrun {
                log::warn!("completion queue overrun, rejecting completions");
                state.overrun = true;
            }
            state.lost += 1;
            return;
        }
        state.entries.push_back(wc);
        if let Some(threshold) = state.armed {
            if state.entries.len() >= threshold as usize {
                state.armed = None;
                state.fired = true;
            }
        }
        self.inner.avail.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::device::DeviceConfig;

    fn setup() -> Context {
        Context::open(DeviceConfig::default()).unwrap()
    }

    fn wc(seq: u64) -> Wc {
        Wc {
            qp_num: 1,
            wr_id: seq * 10,
            seq,
            opcode: WcOpcode::Send,
            status: WcStatus::Success,
            byte_len: 0,
        }
    }

    #[test]
    fn test_fifo_order() {
        let ctx = setup();
        let cq = Cq::new(&ctx, 8).unwrap();
        for i in 0..5 {
            cq.append(wc(i));
        }
        let polled = cq.poll_some(3).unwrap();
        assert_eq!(polled.iter().map(Wc::seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        let polled = cq.poll().unwrap();
        assert_eq!(polled.iter().map(Wc::seq).collect::<Vec<_>>(), vec![3, 4]);
        assert!(cq.poll().unwrap().is_empty());
    }

    #[test]
    fn test_overrun_reject_new() {
        let ctx = setup();
        let cq = Cq::new(&ctx, 4).unwrap();
        for i in 0..5 {
            cq.append(wc(i));
        }
        assert!(cq.is_overrun());

        // The overrun is reported once, then the buffered entries are
        // still drainable in order. The fifth entry was rejected.
        assert!(matches!(cq.poll(), Err(VerbsError::CqOverrun)));
        let polled = cq.poll().unwrap();
        assert_eq!(polled.iter().map(Wc::seq).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(cq.is_overrun());
        assert_eq!(cq.lost(), 1);
    }

    #[test]
    fn test_empty_poll_is_not_an_error() {
        let ctx = setup();
        let cq = Cq::new(&ctx, 4).unwrap();
        assert!(cq.poll().unwrap().is_empty());
        assert!(cq.poll_one().unwrap().is_none());
    }

    #[test]
    fn test_notification_threshold() {
        let ctx = setup();
        let cq = Cq::new(&ctx, 16).unwrap();
        cq.arm_notification(3).unwrap();
        cq.append(wc(0));
        cq.append(wc(1));
        assert!(matches!(
            cq.wait_notification(Duration::from_millis(10)),
            Err(VerbsError::TimedOut)
        ));
        cq.append(wc(2));
        cq.wait_notification(Duration::from_millis(100)).unwrap();

        // One-shot: a second wait requires a re-arm.
        assert!(matches!(
            cq.wait_notification(Duration::from_millis(10)),
            Err(VerbsError::TimedOut)
        ));
    }

    #[test]
    fn test_arm_fires_immediately_when_met() {
        let ctx = setup();
        let cq = Cq::new(&ctx, 16).unwrap();
        cq.append(wc(0));
        cq.arm_notification(1).unwrap();
        cq.wait_notification(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_blocking_poll() {
        let ctx = setup();
        let cq = Cq::new(&ctx, 16).unwrap();
        assert!(cq.poll_one_blocking(Duration::from_millis(10)).unwrap().is_none());

        let cq2 = cq.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cq2.append(wc(7));
        });
        let polled = cq.poll_one_blocking(Duration::from_secs(2)).unwrap();
        assert_eq!(polled.map(|w| w.seq()), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn test_capacity_checks() {
        let ctx = setup();
        assert!(matches!(Cq::new(&ctx, 0), Err(VerbsError::InvalidParameter(_))));
        let too_big = ctx.attr().max_cqe + 1;
        assert!(matches!(
            Cq::new(&ctx, too_big),
            Err(VerbsError::CapabilityNotEnough("max_cqe", _, _))
        ));
    }

    #[test]
    fn test_poll_eq() {
        // Wc is Copy + comparable through accessors.
        let w = wc(3);
        assert_eq!(w.ok().unwrap(), 0);
        assert_eq!(w.wr_id(), 30);
    }
}
