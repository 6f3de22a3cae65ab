//! Work request descriptors.

use crate::verbs::cq::WcOpcode;
use crate::verbs::mr::MrRemote;
use crate::verbs::qp::QpEndpoint;
use crate::verbs::type_alias::*;

/// A scatter/gather element: one contiguous piece of registered local
/// memory addressed by its local key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
    pub lkey: LKey,
}

/// A validated scatter/gather element, with the key already resolved.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedSge {
    pub addr: u64,
    pub len: u32,
}

/// Opcode of a send-side work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    /// Two-sided send, consuming a receive at the destination.
    Send,
    /// One-sided RDMA write into remote memory.
    RdmaWrite,
    /// One-sided RDMA read from remote memory.
    RdmaRead,
    /// 8-byte remote compare-and-swap.
    CompSwap,
    /// 8-byte remote fetch-and-add.
    FetchAdd,
    /// Memory window bind.
    BindMw,
    /// No-op; completes without touching memory.
    Noop,
    /// Invalidate a local memory key.
    LocalInv,
    /// Fast memory registration.
    FastReg,
}

impl WrOpcode {
    /// The completion opcode echoed for this work request.
    pub(crate) fn wc_opcode(self) -> WcOpcode {
        match self {
            WrOpcode::Send => WcOpcode::Send,
            WrOpcode::RdmaWrite => WcOpcode::RdmaWrite,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
            WrOpcode::CompSwap => WcOpcode::CompSwap,
            WrOpcode::FetchAdd => WcOpcode::FetchAdd,
            WrOpcode::BindMw => WcOpcode::BindMw,
            WrOpcode::Noop => WcOpcode::Noop,
            WrOpcode::LocalInv => WcOpcode::LocalInv,
            WrOpcode::FastReg => WcOpcode::FastReg,
        }
    }

    /// Whether the operation targets remote memory and requires an
    /// rkey descriptor.
    pub(crate) fn needs_remote(self) -> bool {
        matches!(
            self,
            WrOpcode::RdmaWrite | WrOpcode::RdmaRead | WrOpcode::CompSwap | WrOpcode::FetchAdd
        )
    }

    /// Whether the operation is an 8-byte atomic.
    pub(crate) fn is_atomic(self) -> bool {
        matches!(self, WrOpcode::CompSwap | WrOpcode::FetchAdd)
    }
}

/// A send-side work request descriptor.
///
/// Built with the constructors below, or literally; [`Qp`] exposes
/// convenience verbs (`send`, `read`, `write`, ...) that build the
/// descriptor for the common cases.
///
/// [`Qp`]: crate::verbs::qp::Qp
#[derive(Debug, Clone, Default)]
pub struct SendWr {
    /// Opaque user context, echoed in the work completion.
    pub wr_id: WrId,

    /// Operation to perform.
    pub opcode: WrOpcode,

    /// Local scatter/gather list.
    pub sgl: Vec<Sge>,

    /// Whether a successful completion generates a CQE. Failures and
    /// flushes always do.
    pub signaled: bool,

    /// Remote memory descriptor for RDMA and atomic operations.
    pub remote: Option<MrRemote>,

    /// Destination for datagram transports. Connected transports use
    /// the peer bound at connection time and ignore this field.
    pub peer: Option<QpEndpoint>,

    /// Compare value for compare-and-swap; add value for fetch-and-add.
    pub compare_add: u64,

    /// Swap value for compare-and-swap.
    pub swap: u64,

    /// Key to retire for local-invalidate requests.
    pub invalidate_key: Option<LKey>,
}

impl Default for WrOpcode {
    fn default() -> Self {
        WrOpcode::Noop
    }
}

impl SendWr {
    /// Create a two-sided send of the given local memory.
    pub fn send(sgl: Vec<Sge>) -> Self {
        Self {
            opcode: WrOpcode::Send,
            sgl,
            ..Default::default()
        }
    }

    /// Create an RDMA write of local memory into `remote`.
    pub fn write(sgl: Vec<Sge>, remote: MrRemote) -> Self {
        Self {
            opcode: WrOpcode::RdmaWrite,
            sgl,
            remote: Some(remote),
            ..Default::default()
        }
    }

    /// Create an RDMA read of `remote` into local memory.
    pub fn read(sgl: Vec<Sge>, remote: MrRemote) -> Self {
        Self {
            opcode: WrOpcode::RdmaRead,
            sgl,
            remote: Some(remote),
            ..Default::default()
        }
    }

    /// Create an 8-byte compare-and-swap on `remote`. The old value is
    /// written into `local`.
    pub fn compare_swap(local: Sge, remote: MrRemote, current: u64, new: u64) -> Self {
        Self {
            opcode: WrOpcode::CompSwap,
            sgl: vec![local],
            remote: Some(remote),
            compare_add: current,
            swap: new,
            ..Default::default()
        }
    }

    /// Create an 8-byte fetch-and-add on `remote`. The old value is
    /// written into `local`.
    pub fn fetch_add(local: Sge, remote: MrRemote, add: u64) -> Self {
        Self {
            opcode: WrOpcode::FetchAdd,
            sgl: vec![local],
            remote: Some(remote),
            compare_add: add,
            ..Default::default()
        }
    }

    /// Create a no-op request.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Create a local-invalidate request retiring the given key.
    pub fn local_inv(key: LKey) -> Self {
        Self {
            opcode: WrOpcode::LocalInv,
            invalidate_key: Some(key),
            ..Default::default()
        }
    }

    /// Set the user context echoed in the completion.
    pub fn wr_id(mut self, wr_id: WrId) -> Self {
        self.wr_id = wr_id;
        self
    }

    /// Request a CQE for successful completion.
    pub fn signaled(mut self, signaled: bool) -> Self {
        self.signaled = signaled;
        self
    }

    /// Set the destination endpoint (datagram transports).
    pub fn peer(mut self, peer: QpEndpoint) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// A receive-side work request descriptor: buffers for one incoming
/// message. Receive completions are always signaled.
#[derive(Debug, Clone, Default)]
pub struct RecvWr {
    /// Opaque user context, echoed in the work completion.
    pub wr_id: WrId,

    /// Local scatter/gather list the incoming message lands in.
    pub sgl: Vec<Sge>,
}

impl RecvWr {
    /// Create a receive into the given local memory.
    pub fn new(sgl: Vec<Sge>) -> Self {
        Self { wr_id: 0, sgl }
    }

    /// Set the user context echoed in the completion.
    pub fn wr_id(mut self, wr_id: WrId) -> Self {
        self.wr_id = wr_id;
        self
    }
}
