use crate::verbs::cq::Cq;
use crate::verbs::error::Result;
use crate::verbs::pd::Pd;

use super::{Qp, QpType};

/// Queue pair capability attributes.
#[derive(Clone, Copy, Debug)]
pub struct QpCaps {
    /// The maximum number of outstanding work requests that can be
    /// posted to the send queue. Rounded up to a power of two at
    /// creation. Value can be [1..`attr.max_qp_wr`].
    pub max_send_wr: u32,

    /// The maximum number of outstanding work requests that can be
    /// posted to the receive queue. Rounded up to a power of two at
    /// creation. Value can be [1..`attr.max_qp_wr`].
    pub max_recv_wr: u32,

    /// The maximum number of scatter/gather elements in any work
    /// request posted to the send queue. Value can be
    /// [0..`attr.max_sge`].
    pub max_send_sge: u32,

    /// The maximum number of scatter/gather elements in any work
    /// request posted to the receive queue. Value can be
    /// [0..`attr.max_sge`].
    pub max_recv_sge: u32,
}

impl Default for QpCaps {
    /// Generate a default queue pair capabilities setting:
    /// 128 outstanding send/recv work requests and 16 SGEs per work
    /// request.
    fn default() -> Self {
        QpCaps {
            max_send_wr: 128,
            max_recv_wr: 128,
            max_send_sge: 16,
            max_recv_sge: 16,
        }
    }
}

/// Queue pair builder.
#[derive(Clone)]
pub struct QpBuilder<'a> {
    /// Send completion queue for this QP.
    pub(super) send_cq: Option<&'a Cq>,

    /// Receive completion queue for this QP. Can be the same as the
    /// send CQ.
    pub(super) recv_cq: Option<&'a Cq>,

    /// Capabilities of this QP.
    pub(super) caps: QpCaps,

    /// Queue pair type.
    pub(super) qp_type: Option<QpType>,

    /// Whether to signal for all send work requests.
    pub(super) sq_sig_all: Option<bool>,
}

impl<'a> QpBuilder<'a> {
    /// Create a new queue pair builder.
    pub fn new() -> Self {
        Self {
            send_cq: None,
            recv_cq: None,
            caps: QpCaps::default(),
            qp_type: None,
            sq_sig_all: None,
        }
    }

    /// Set the send completion queue for this QP.
    pub fn send_cq(mut self, send_cq: &'a Cq) -> Self {
        self.send_cq = Some(send_cq);
        self
    }

    /// Set the receive completion queue for this QP.
    pub fn recv_cq(mut self, recv_cq: &'a Cq) -> Self {
        self.recv_cq = Some(recv_cq);
        self
    }

    /// Set the capabilities of this QP.
    pub fn caps(mut self, caps: QpCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Set the type of this QP.
    pub fn qp_type(mut self, qp_type: QpType) -> Self {
        self.qp_type = Some(qp_type);
        self
    }

    /// Set whether to signal for all send work requests.
    pub fn sq_sig_all(mut self, sq_sig_all: bool) -> Self {
        self.sq_sig_all = Some(sq_sig_all);
        self
    }

    /// Build the queue pair on the given protection domain.
    ///
    /// # Panics
    ///
    /// Panic if any mandatory field (except QP capabilities) is not set.
    pub fn build(self, pd: &Pd) -> Result<Qp> {
        Qp::new(pd, self)
    }
}

impl<'a> QpBuilder<'a> {
    /// Unwrap the builder and return the set attributes.
    #[inline]
    pub(super) fn unwrap(self) -> QpInitAttr {
        QpInitAttr {
            send_cq: self.send_cq.expect("send CQ must be set").clone(),
            recv_cq: self.recv_cq.expect("recv CQ must be set").clone(),
            caps: self.caps,
            qp_type: self.qp_type.expect("QP type must be set"),
            sq_sig_all: self.sq_sig_all.expect("sq_sig_all must be explicitly set"),
        }
    }
}

impl Default for QpBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialization attributes of a queue pair.
pub(super) struct QpInitAttr {
    pub send_cq: Cq,
    pub recv_cq: Cq,
    pub caps: QpCaps,
    pub qp_type: QpType,
    pub sq_sig_all: bool,
}
