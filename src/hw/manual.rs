//! A transport that parks submissions for a test harness.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::verbs::cq::WcStatus;

use super::{Submission, Transport};

/// A transport that holds every submission until the harness completes
/// it, in whatever order and with whatever status the scenario needs.
/// Useful for exercising out-of-order completion, forced failures and
/// flush races without a real device.
pub struct ManualTransport {
    pending: Mutex<VecDeque<Submission>>,
}

impl ManualTransport {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Get the number of parked submissions.
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Take the oldest parked submission.
    pub fn pop(&self) -> Option<Submission> {
        self.pending.lock().unwrap().pop_front()
    }

    /// Take every parked submission, in submission order.
    pub fn drain(&self) -> Vec<Submission> {
        self.pending.lock().unwrap().drain(..).collect()
    }

    /// Complete every parked submission with the given status, in
    /// submission order, reporting the full payload length on success.
    pub fn complete_all(&self, status: WcStatus) {
        for sub in self.drain() {
            let bytes = if status.is_success() { sub.total_len() } else { 0 };
            sub.complete(status, bytes);
        }
    }
}

impl Default for ManualTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ManualTransport {
    fn submit(&self, submission: Submission) {
        self.pending.lock().unwrap().push_back(submission);
    }
}
