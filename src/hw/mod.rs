//! The device model.
//!
//! The verbs core treats the device as two opaque collaborators: a
//! [`Transport`] that work requests are submitted to, and a completion
//! path the device drives when work finishes. This module provides the
//! seam plus two implementations: the default [`LoopbackTransport`]
//! that executes everything against local registered memory, and a
//! [`ManualTransport`] that parks submissions for a test harness to
//! complete in any order.
//!
//! It also hosts the catastrophic-error machinery: the fault register,
//! fault classes, and the periodic [`FatalMonitor`] watchdog.

mod fault;
mod loopback;
mod manual;

pub use self::fault::{FatalMonitor, FaultClass};
pub(crate) use self::fault::FaultRegister;
pub use self::loopback::LoopbackTransport;
pub use self::manual::ManualTransport;

use std::sync::{Arc, Weak};

use crate::verbs::cq::WcStatus;
use crate::verbs::mr::MrRemote;
use crate::verbs::qp::{QpEndpoint, QpShared};
use crate::verbs::type_alias::*;
use crate::verbs::wr::{ResolvedSge, WrOpcode};

/// Which half of a queue pair a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Send,
    Recv,
}

/// The submit half of the device contract.
///
/// Submission is asynchronous: the call must not fail and must not
/// report a result. Every accepted submission is eventually answered by
/// delivering a completion through [`Submission::complete`] (or by the
/// owning QP being flushed first). Transports may complete out of
/// order; the work queue re-sequences.
pub trait Transport: Send + Sync {
    /// Accept one work request for execution.
    fn submit(&self, submission: Submission);
}

/// A snapshot of one validated send-side work request, as handed to the
/// device. The scatter/gather list is already resolved against the key
/// table, and the referenced regions are held in flight by the owning
/// work queue entry until the completion is delivered.
pub struct Submission {
    pub(crate) qp: Weak<QpShared>,
    pub(crate) seq: Seq,
    pub(crate) wr_id: WrId,
    pub(crate) opcode: WrOpcode,
    pub(crate) sgl: Vec<ResolvedSge>,
    pub(crate) total_len: u32,
    pub(crate) remote: Option<MrRemote>,
    pub(crate) compare_add: u64,
    pub(crate) swap: u64,
    pub(crate) invalidate_key: Option<LKey>,
    pub(crate) dest: Option<QpEndpoint>,
}

impl Submission {
    /// Get the work queue sequence number of the submitted request.
    #[inline]
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// Get the user context of the submitted request.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the opcode of the submitted request.
    #[inline]
    pub fn opcode(&self) -> WrOpcode {
        self.opcode
    }

    /// Get the total payload length of the submitted request.
    #[inline]
    pub fn total_len(&self) -> u32 {
        self.total_len
    }

    /// Deliver the completion for this work request.
    ///
    /// This is the "device raises completion" half of the contract. The
    /// work queue stages the result and releases CQEs in posted order;
    /// late completions for work that was already flushed are dropped.
    pub fn complete(&self, status: WcStatus, byte_len: u32) {
        if let Some(qp) = self.qp.upgrade() {
            qp.deliver_completion(Side::Send, self.seq, status, byte_len);
        }
    }

    /// Upgrade to the owning queue pair, if it is still alive.
    pub(crate) fn qp(&self) -> Option<Arc<QpShared>> {
        self.qp.upgrade()
    }
}
