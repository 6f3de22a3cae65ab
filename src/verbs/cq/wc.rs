use std::fmt;

use thiserror::Error;

use crate::verbs::type_alias::*;

/// Opcode of a completion queue entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    Send,
    /// RDMA write request.
    RdmaWrite,
    /// RDMA read request.
    RdmaRead,
    /// RDMA compare-and-swap request.
    CompSwap,
    /// RDMA fetch-and-add request.
    FetchAdd,
    /// Memory window bind request.
    BindMw,
    /// No-op request.
    Noop,
    /// Local key invalidate request.
    LocalInv,
    /// Fast memory registration request.
    FastReg,
    /// Receive request.
    Recv,
}

/// Status of a completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    /// **Operation completed successfully:** the corresponding work
    /// request ended and the memory buffers it refers to are ready to
    /// be (re)used.
    #[error("success")]
    Success,

    /// **Local Length Error:** a posted receive was not big enough to
    /// hold the incoming message, or a send exceeded the supported
    /// message size.
    #[error("local length error")]
    LocLenErr,

    /// **Local Protection Error:** the locally posted work request's
    /// scatter/gather list does not reference a memory region that is
    /// valid for the requested operation.
    #[error("local protection error")]
    LocProtErr,

    /// **Work Request Flushed Error:** the work request was outstanding
    /// when the QP transitioned into the Error state, and was discarded
    /// rather than executed.
    #[error("WR flush error")]
    WrFlushErr,

    /// **Memory Window Binding Error:** a failure happened when trying
    /// to bind a memory window.
    #[error("memory window bind error")]
    MwBindErr,

    /// **Bad Response Error:** an unexpected transport-layer response
    /// was returned by the responder.
    #[error("bad response error")]
    BadRespErr,

    /// **Remote Access Error:** a protection error occurred on the
    /// remote data buffer targeted by an RDMA read, RDMA write or
    /// atomic operation.
    #[error("remote access error")]
    RemAccessErr,

    /// **Remote Operation Error:** the responder could not complete the
    /// operation, for example due to a malformed receive queue entry.
    #[error("remote operation error")]
    RemOpErr,

    /// **Transport Retry Counter Exceeded:** the remote side did not
    /// respond within the transport retry budget. Usually means the
    /// remote QP is gone or not in a responsive state.
    #[error("transport retry counter exceeded")]
    RetryExcErr,

    /// **RNR Retry Counter Exceeded:** the receiver was not ready for
    /// longer than the RNR retry budget, usually because it did not
    /// post any receive work request.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr,

    /// **General Error:** an error not covered by the other statuses.
    #[error("general error")]
    GeneralErr,
}

impl WcStatus {
    /// Whether the status reports success.
    #[inline]
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }

    /// Whether the work request was flushed rather than executed.
    #[inline]
    pub fn is_flush(self) -> bool {
        self == WcStatus::WrFlushErr
    }
}

/// Work completion entry.
///
/// The result record for one finished work queue entry. Immutable once
/// created; consumed by polling its completion queue.
#[derive(Clone, Copy)]
pub struct Wc {
    pub(crate) qp_num: Qpn,
    pub(crate) wr_id: WrId,
    pub(crate) seq: Seq,
    pub(crate) opcode: WcOpcode,
    pub(crate) status: WcStatus,
    pub(crate) byte_len: u32,
}

impl Wc {
    /// Get the work request ID (the opaque user context of the WQE).
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the work queue sequence number of the completed WQE.
    #[inline]
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// Get the number of the queue pair the WQE was posted on.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qp_num
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Get the completion status as a `Result`.
    ///
    /// - On success, return the number of bytes processed or transferred.
    /// - Otherwise, return the error status.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.bytes()),
            status => Err(status),
        }
    }

    /// Get the opcode echoed from the work request.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Get the number of bytes processed or transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len as usize
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("seq", &self.seq)
            .field("status", &self.status)
            .finish()
    }
}
