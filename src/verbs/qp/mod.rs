//! Queue pair and related types.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::hw::{Side, Submission};
use crate::verbs::context::Context;
use crate::verbs::cq::{Cq, Wc, WcOpcode, WcStatus};
use crate::verbs::error::{Result, VerbsError};
use crate::verbs::mr::{MrRemote, MrSlice, Permission};
use crate::verbs::pd::Pd;
use crate::verbs::type_alias::*;
use crate::verbs::wr::{RecvWr, SendWr, Sge, WrOpcode};

pub use self::builder::*;
pub use self::peer::*;
pub use self::state::*;
pub use self::ty::*;

mod builder;
mod peer;
pub(crate) mod ring;
mod state;
mod ty;

use self::ring::{PostedWqe, Retired, WorkQueue};

/// Send-side path parameters, required for the RTR→RTS transition.
///
/// The fields use the verbs encodings: `timeout` is the exponent of the
/// ACK timeout (0..=31), the retry counters count transport and
/// receiver-not-ready retries (0..=7 each).
#[derive(Debug, Clone, Copy)]
pub struct SendParams {
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
}

impl Default for SendParams {
    fn default() -> Self {
        Self {
            timeout: 14,
            retry_cnt: 6,
            rnr_retry: 6,
        }
    }
}

impl SendParams {
    fn validate(&self) -> Result<()> {
        if self.timeout > 31 {
            return Err(VerbsError::InvalidParameter("timeout exponent out of range"));
        }
        if self.retry_cnt > 7 || self.rnr_retry > 7 {
            return Err(VerbsError::InvalidParameter("retry counter out of range"));
        }
        Ok(())
    }
}

/// Connection-lifecycle state, guarded by one lock so that posting and
/// transitions serialize against each other.
struct QpCtrl {
    state: QpState,
    port: Option<PortNum>,
    access: Permission,
    peer: Option<QpPeer>,
    send_params: Option<SendParams>,
}

/// Ownership holder of queue pair.
///
/// Shared between the user-facing [`Qp`] handle, the device registry
/// (weakly) and in-flight submissions (weakly): the device delivers
/// completions through this type after the user handle may already be
/// gone.
pub(crate) struct QpShared {
    ctx: Context,
    pd: Pd,
    qpn: Qpn,
    ty: QpType,
    sq_sig_all: bool,
    caps: QpCaps,
    send_cq: Cq,
    recv_cq: Cq,

    ctrl: Mutex<QpCtrl>,
    sq: Mutex<WorkQueue>,
    rq: Mutex<WorkQueue>,
}

impl QpShared {
    pub(crate) fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn pd(&self) -> &Pd {
        &self.pd
    }

    pub(crate) fn qp_type(&self) -> QpType {
        self.ty
    }

    pub(crate) fn qp_num(&self) -> Qpn {
        self.qpn
    }

    fn state(&self) -> QpState {
        self.ctrl.lock().unwrap().state
    }

    /// Whether the QP can be the target of incoming work right now.
    pub(crate) fn can_receive(&self) -> bool {
        self.state().can_receive()
    }

    /// Hand out the next posted receive for an incoming message.
    pub(crate) fn take_recv_match(&self) -> Option<(Seq, Vec<crate::verbs::wr::ResolvedSge>, u32)> {
        self.rq.lock().unwrap().take_next_match()
    }

    /// Stage a device-reported result and retire whatever became
    /// releasable, appending CQEs in posted order.
    ///
    /// No ring lock is held while appending to the CQ.
    pub(crate) fn deliver_completion(&self, side: Side, seq: Seq, status: WcStatus, byte_len: u32) {
        let retired = {
            let mut ring = self.ring(side).lock().unwrap();
            ring.complete(seq, status, byte_len)
        };
        self.retire(side, retired);
    }

    fn ring(&self, side: Side) -> &Mutex<WorkQueue> {
        match side {
            Side::Send => &self.sq,
            Side::Recv => &self.rq,
        }
    }

    /// Turn retired ring entries into CQEs. A successful unsignaled
    /// send retires silently; failures, flushes and receives always
    /// generate a completion.
    fn retire(&self, side: Side, retired: Vec<Retired>) {
        if retired.is_empty() {
            return;
        }
        let cq = match side {
            Side::Send => &self.send_cq,
            Side::Recv => &self.recv_cq,
        };
        for r in retired {
            let signal = !r.status.is_success() || side == Side::Recv || r.wqe.signaled;
            if signal {
                cq.append(Wc {
                    qp_num: self.qpn,
                    wr_id: r.wqe.wr_id,
                    seq: r.wqe.seq,
                    opcode: r.wqe.opcode,
                    status: r.status,
                    byte_len: r.byte_len,
                });
            }
            // Dropping the entry releases its region in-flight guards.
        }
    }

    /// Transition to the Error state and flush all outstanding work,
    /// preserving post order within each ring. Idempotent. Used by the
    /// application-triggered transition, QP destruction and the
    /// catastrophic-error fan-out alike.
    pub(crate) fn force_error(&self, reason: &str) {
        {
            let mut ctrl = self.ctrl.lock().unwrap();
            if ctrl.state == QpState::Error {
                return;
            }
            ctrl.state = QpState::Error;
            log::warn!("QP {}: entering error state ({})", self.qpn, reason);
        }
        let flushed = self.sq.lock().unwrap().flush();
        self.retire(Side::Send, flushed);
        let flushed = self.rq.lock().unwrap().flush();
        self.retire(Side::Recv, flushed);
    }
}

/// Queue pair.
///
/// The send/receive work-queue unit bound to one transport connection.
/// Work requests are accepted only in the states the connection
/// lifecycle permits; once accepted, their outcome is always reported
/// through the associated completion queues.
pub struct Qp {
    inner: Arc<QpShared>,
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Qp<{}>", self.inner.qpn))
    }
}

impl Qp {
    /// Create a new QP builder.
    pub fn builder<'a>() -> QpBuilder<'a> {
        Default::default()
    }

    /// Check whether the given capabilities are supported by the device.
    fn check_caps(ctx: &Context, caps: &QpCaps) -> Result<()> {
        let attr = ctx.attr();
        if caps.max_send_wr > attr.max_qp_wr {
            return Err(VerbsError::CapabilityNotEnough(
                "max_send_wr",
                attr.max_qp_wr,
                caps.max_send_wr,
            ));
        }
        if caps.max_recv_wr > attr.max_qp_wr {
            return Err(VerbsError::CapabilityNotEnough(
                "max_recv_wr",
                attr.max_qp_wr,
                caps.max_recv_wr,
            ));
        }
        if caps.max_send_sge > attr.max_sge {
            return Err(VerbsError::CapabilityNotEnough(
                "max_send_sge",
                attr.max_sge,
                caps.max_send_sge,
            ));
        }
        if caps.max_recv_sge > attr.max_sge {
            return Err(VerbsError::CapabilityNotEnough(
                "max_recv_sge",
                attr.max_sge,
                caps.max_recv_sge,
            ));
        }
        Ok(())
    }

    /// Create a new queue pair with the given builder.
    pub(crate) fn new(pd: &Pd, builder: QpBuilder) -> Result<Self> {
        let init_attr = builder.unwrap();
        let ctx = pd.context();
        if let Some(class) = ctx.fatal_class() {
            return Err(VerbsError::DeviceFatal(class));
        }
        Self::check_caps(ctx, &init_attr.caps)?;
        if ctx.live_qps() >= ctx.attr().max_qp as usize {
            return Err(VerbsError::InsufficientResources("queue pair limit reached"));
        }

        let qpn = ctx.alloc_qpn();
        let inner = Arc::new(QpShared {
            ctx: ctx.clone(),
            pd: pd.clone(),
            qpn,
            ty: init_attr.qp_type,
            sq_sig_all: init_attr.sq_sig_all,
            caps: init_attr.caps,
            send_cq: init_attr.send_cq,
            recv_cq: init_attr.recv_cq,
            ctrl: Mutex::new(QpCtrl {
                state: QpState::Reset,
                port: None,
                access: Permission::EMPTY,
                peer: None,
                send_params: None,
            }),
            sq: Mutex::new(WorkQueue::new(init_attr.caps.max_send_wr)),
            rq: Mutex::new(WorkQueue::new(init_attr.caps.max_recv_wr)),
        });
        ctx.register_qp(qpn, Arc::downgrade(&inner));
        Ok(Qp { inner })
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.inner.qpn
    }

    /// Get the type of the queue pair.
    #[inline]
    pub fn qp_type(&self) -> QpType {
        self.inner.ty
    }

    /// Get the current state of the queue pair.
    #[inline]
    pub fn state(&self) -> QpState {
        self.inner.state()
    }

    /// Get the protection domain of the queue pair.
    pub fn pd(&self) -> &Pd {
        &self.inner.pd
    }

    /// Get the context of the queue pair.
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Get the capabilities of this QP.
    pub fn caps(&self) -> &QpCaps {
        &self.inner.caps
    }

    /// Get the associated send completion queue.
    #[inline]
    pub fn scq(&self) -> &Cq {
        &self.inner.send_cq
    }

    /// Get the associated receive completion queue.
    #[inline]
    pub fn rcq(&self) -> &Cq {
        &self.inner.recv_cq
    }

    /// Get the port this QP is bound to, if it has left Reset.
    pub fn port(&self) -> Option<PortNum> {
        self.inner.ctrl.lock().unwrap().port
    }

    /// Get the access mask set at INIT time.
    pub fn access(&self) -> Permission {
        self.inner.ctrl.lock().unwrap().access
    }

    /// Get the send-side parameters set at RTS time.
    pub fn send_params(&self) -> Option<SendParams> {
        self.inner.ctrl.lock().unwrap().send_params
    }

    /// Get the endpoint of the remote peer this QP is connected to.
    pub fn peer(&self) -> Option<QpEndpoint> {
        self.inner
            .ctrl
            .lock()
            .unwrap()
            .peer
            .as_ref()
            .map(|p| *p.endpoint())
    }

    /// Get the endpoint information of this QP.
    /// Return `None` if the QP is not yet bound to a port.
    #[inline]
    pub fn endpoint(&self) -> Option<QpEndpoint> {
        QpEndpoint::of_qp(self)
    }

    fn fatal_check(&self) -> Result<()> {
        match self.inner.ctx.fatal_class() {
            Some(class) => Err(VerbsError::DeviceFatal(class)),
            None => Ok(()),
        }
    }
}

// Connection lifecycle.
impl Qp {
    /// Modify the queue pair from RESET to INIT.
    ///
    /// Requires a valid, active port and the access mask granted to
    /// incoming work.
    pub fn init(&self, port: PortNum, access: Permission) -> Result<()> {
        self.fatal_check()?;
        let mut ctrl = self.inner.ctrl.lock().unwrap();
        if ctrl.state != QpState::Reset {
            return Err(VerbsError::InvalidState(ctrl.state));
        }
        if !self.inner.ctx.port_active(port) {
            return Err(VerbsError::InvalidParameter("invalid or inactive port"));
        }
        ctrl.port = Some(port);
        ctrl.access = access;
        ctrl.state = QpState::Init;
        log::debug!("QP {}: RESET -> INIT on port {}", self.inner.qpn, port);
        Ok(())
    }

    /// Modify the queue pair from INIT to RTR (Ready To Receive).
    ///
    /// Connected transports require a resolved peer path; datagram
    /// transports skip straight through with a null path.
    pub fn ready_to_receive(&self, peer: Option<&QpPeer>) -> Result<()> {
        self.fatal_check()?;
        let mut ctrl = self.inner.ctrl.lock().unwrap();
        if ctrl.state != QpState::Init {
            return Err(VerbsError::InvalidState(ctrl.state));
        }
        if self.inner.ty.is_connected() {
            let peer = peer.ok_or(VerbsError::InvalidParameter(
                "connected transport requires a resolved peer path",
            ))?;
            ctrl.peer = Some(peer.clone());
        }
        ctrl.state = QpState::Rtr;
        log::debug!("QP {}: INIT -> RTR", self.inner.qpn);
        Ok(())
    }

    /// Modify the queue pair from RTR to RTS (Ready To Send).
    ///
    /// Requires send-side path timeout and retry parameters.
    pub fn ready_to_send(&self, params: SendParams) -> Result<()> {
        self.fatal_check()?;
        params.validate()?;
        let mut ctrl = self.inner.ctrl.lock().unwrap();
        if ctrl.state != QpState::Rtr {
            return Err(VerbsError::InvalidState(ctrl.state));
        }
        ctrl.send_params = Some(params);
        ctrl.state = QpState::Rts;
        log::debug!("QP {}: RTR -> RTS", self.inner.qpn);
        Ok(())
    }

    /// Bring a connected QP up to RTS against the given peer endpoint,
    /// with default access and send parameters.
    pub fn connect(&self, port: PortNum, ep: &QpEndpoint) -> Result<()> {
        let peer = QpPeer::resolve(self.context(), *ep)?;
        self.init(port, Permission::default())?;
        self.ready_to_receive(Some(&peer))?;
        self.ready_to_send(SendParams::default())
    }

    /// Bring a datagram QP up to RTS on the given port.
    pub fn activate(&self, port: PortNum) -> Result<()> {
        if self.inner.ty.is_connected() {
            return Err(VerbsError::InvalidParameter(
                "connected transport must be brought up with a peer",
            ));
        }
        self.init(port, Permission::default())?;
        self.ready_to_receive(None)?;
        self.ready_to_send(SendParams::default())
    }

    /// Modify the queue pair from RTS to SQD (Send Queue Drain): new
    /// sends are refused while outstanding ones run to completion.
    pub fn drain(&self) -> Result<()> {
        self.fatal_check()?;
        let mut ctrl = self.inner.ctrl.lock().unwrap();
        if ctrl.state != QpState::Rts {
            return Err(VerbsError::InvalidState(ctrl.state));
        }
        ctrl.state = QpState::Sqd;
        log::debug!("QP {}: RTS -> SQD", self.inner.qpn);
        Ok(())
    }

    /// Transition the queue pair to the Error state, flushing every
    /// outstanding work request into its completion queue with flush
    /// status, in original post order.
    pub fn set_error(&self) {
        self.inner.force_error("application request");
    }

    /// Reset the queue pair.
    ///
    /// Legal from Error, from a drained SQD, and (as a no-op) from
    /// Reset itself. Clears the port, peer and parameter bindings;
    /// sequence numbering restarts from zero.
    pub fn reset(&self) -> Result<()> {
        let mut ctrl = self.inner.ctrl.lock().unwrap();
        match ctrl.state {
            QpState::Reset => return Ok(()),
            QpState::Error => {}
            QpState::Sqd => {
                if self.inner.sq.lock().unwrap().outstanding() > 0 {
                    return Err(VerbsError::ResourceBusy("send queue not yet drained"));
                }
            }
            state => return Err(VerbsError::InvalidState(state)),
        }
        ctrl.state = QpState::Reset;
        ctrl.port = None;
        ctrl.access = Permission::EMPTY;
        ctrl.peer = None;
        ctrl.send_params = None;
        drop(ctrl);

        // Receives still posted when leaving SQD are flushed here; an
        // Error-state ring was already flushed at the transition.
        let flushed = self.inner.rq.lock().unwrap().flush();
        self.inner.retire(Side::Recv, flushed);

        self.inner.sq.lock().unwrap().reset();
        self.inner.rq.lock().unwrap().reset();
        log::debug!("QP {}: reset", self.inner.qpn);
        Ok(())
    }

    /// Destroy the queue pair.
    ///
    /// Outstanding work is flushed (through a forced Error transition)
    /// before the QP detaches from the device; the flush-generated
    /// completions are appended before this call returns, and the
    /// completion queues outlive the QP.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        let outstanding = self.inner.sq.lock().unwrap().outstanding() > 0
            || self.inner.rq.lock().unwrap().outstanding() > 0;
        if outstanding {
            self.inner.force_error("destroy");
        }
        self.inner.ctx.unregister_qp(self.inner.qpn);
    }
}

// Work request posting.
impl Qp {
    /// Post a send-side work request.
    ///
    /// Validates the QP state and the scatter/gather list against live
    /// memory regions, reserves a send-queue slot (stamping the
    /// returned sequence number), and submits the request to the
    /// device. A full send queue yields `ResourceExhausted`; treat it
    /// as backpressure and retry after polling completions.
    pub fn post_send(&self, wr: &SendWr) -> Result<Seq> {
        let inner = &self.inner;
        self.fatal_check()?;

        if wr.sgl.len() > inner.caps.max_send_sge as usize {
            return Err(VerbsError::InvalidParameter("scatter/gather list exceeds max_send_sge"));
        }
        if wr.opcode.needs_remote() {
            if wr.remote.is_none() {
                return Err(VerbsError::InvalidParameter(
                    "operation requires a remote memory descriptor",
                ));
            }
            let reliable_only = matches!(
                wr.opcode,
                WrOpcode::RdmaRead | WrOpcode::CompSwap | WrOpcode::FetchAdd
            );
            if reliable_only && !inner.ty.is_reliable() {
                return Err(VerbsError::InvalidParameter(
                    "operation requires a reliable transport",
                ));
            }
            if !inner.ty.is_connected() {
                return Err(VerbsError::InvalidParameter(
                    "RDMA requires a connected transport",
                ));
            }
        }
        if wr.opcode.is_atomic() {
            Self::check_atomic_mem(wr)?;
        }
        if wr.opcode == WrOpcode::LocalInv && wr.invalidate_key.is_none() {
            return Err(VerbsError::InvalidParameter("local invalidate requires a key"));
        }

        // Local buffers an RDMA read or atomic scatters into must be
        // writable.
        let need = if matches!(wr.opcode, WrOpcode::RdmaRead) || wr.opcode.is_atomic() {
            Permission::LOCAL_WRITE
        } else {
            Permission::EMPTY
        };
        let (sgl, guards, total_len) = inner.pd.resolve_sgl(&wr.sgl, need)?;

        let ctrl = inner.ctrl.lock().unwrap();
        if !ctrl.state.can_post_send() {
            return Err(VerbsError::InvalidState(ctrl.state));
        }

        // Destination: connected transports send to the peer bound at
        // RTR time, datagram sends carry their own.
        let dest = if inner.ty.is_connected() {
            Some(*ctrl.peer.as_ref().expect("connected QP in RTS has a peer").endpoint())
        } else if wr.opcode == WrOpcode::Send {
            Some(wr.peer.ok_or(VerbsError::InvalidParameter(
                "no peer specified for datagram send",
            ))?)
        } else {
            None
        };

        let wqe = PostedWqe {
            seq: 0,
            wr_id: wr.wr_id,
            opcode: wr.opcode.wc_opcode(),
            signaled: wr.signaled || inner.sq_sig_all,
            total_len,
            sgl: sgl.clone(),
            guards,
        };
        let mut sq = inner.sq.lock().unwrap();
        let seq = match sq.try_enqueue(wqe) {
            Ok(seq) => seq,
            Err(_) => return Err(VerbsError::ResourceExhausted("send queue")),
        };
        drop(sq);
        drop(ctrl);

        inner.ctx.transport().submit(Submission {
            qp: Arc::downgrade(inner),
            seq,
            wr_id: wr.wr_id,
            opcode: wr.opcode,
            sgl,
            total_len,
            remote: wr.remote,
            compare_add: wr.compare_add,
            swap: wr.swap,
            invalidate_key: wr.invalidate_key,
            dest,
        });
        Ok(seq)
    }

    /// Post a receive work request: buffers for one incoming message.
    ///
    /// Legal in RTR and RTS. A full receive queue yields
    /// `ResourceExhausted`.
    pub fn post_recv(&self, wr: &RecvWr) -> Result<Seq> {
        let inner = &self.inner;
        self.fatal_check()?;

        if wr.sgl.len() > inner.caps.max_recv_sge as usize {
            return Err(VerbsError::InvalidParameter("scatter/gather list exceeds max_recv_sge"));
        }
        // Incoming data is written into the buffers.
        let (sgl, guards, total_len) = inner.pd.resolve_sgl(&wr.sgl, Permission::LOCAL_WRITE)?;

        let ctrl = inner.ctrl.lock().unwrap();
        if !ctrl.state.can_post_recv() {
            return Err(VerbsError::InvalidState(ctrl.state));
        }
        let wqe = PostedWqe {
            seq: 0,
            wr_id: wr.wr_id,
            opcode: WcOpcode::Recv,
            signaled: true,
            total_len,
            sgl,
            guards,
        };
        let mut rq = inner.rq.lock().unwrap();
        match rq.try_enqueue(wqe) {
            Ok(seq) => Ok(seq),
            Err(_) => Err(VerbsError::ResourceExhausted("receive queue")),
        }
    }

    fn check_atomic_mem(wr: &SendWr) -> Result<()> {
        if wr.sgl.len() != 1 {
            return Err(VerbsError::InvalidParameter(
                "atomic operations take exactly one SGE",
            ));
        }
        let local = &wr.sgl[0];
        let remote = wr.remote.as_ref().expect("checked by caller");
        if local.len != 8 || remote.len != 8 {
            return Err(VerbsError::InvalidParameter("atomic buffer sizes are not 8B"));
        }
        if local.addr % 8 != 0 || remote.addr % 8 != 0 {
            return Err(VerbsError::InvalidParameter("atomic buffers are not 8B-aligned"));
        }
        Ok(())
    }
}

// Convenience verbs over `post_send`/`post_recv`.
impl Qp {
    /// Post a receive request.
    ///
    /// **NOTE:** This method has no mutable borrows to its parameters,
    /// but will cause the content of the buffers to be modified when a
    /// message arrives!
    pub fn recv(&self, local: &[MrSlice], wr_id: WrId) -> Result<Seq> {
        self.post_recv(&RecvWr::new(build_sgl(local)).wr_id(wr_id))
    }

    /// Post a send request to the connected peer.
    pub fn send(&self, local: &[MrSlice], wr_id: WrId, signal: bool) -> Result<Seq> {
        self.post_send(&SendWr::send(build_sgl(local)).wr_id(wr_id).signaled(signal))
    }

    /// Post a send request to the specified peer. For datagram QPs.
    pub fn send_to(
        &self,
        peer: &QpPeer,
        local: &[MrSlice],
        wr_id: WrId,
        signal: bool,
    ) -> Result<Seq> {
        self.post_send(
            &SendWr::send(build_sgl(local))
                .wr_id(wr_id)
                .signaled(signal)
                .peer(*peer.endpoint()),
        )
    }

    /// Post an RDMA read request. Only valid for reliable QPs.
    ///
    /// **NOTE:** this method has no mutable borrows to its parameters,
    /// but can cause the content of the buffers to be modified!
    pub fn read(
        &self,
        local: &[MrSlice],
        remote: &MrRemote,
        wr_id: WrId,
        signal: bool,
    ) -> Result<Seq> {
        self.post_send(&SendWr::read(build_sgl(local), *remote).wr_id(wr_id).signaled(signal))
    }

    /// Post an RDMA write request. Only valid for connected QPs.
    pub fn write(
        &self,
        local: &[MrSlice],
        remote: &MrRemote,
        wr_id: WrId,
        signal: bool,
    ) -> Result<Seq> {
        self.post_send(&SendWr::write(build_sgl(local), *remote).wr_id(wr_id).signaled(signal))
    }

    /// Post an atomic compare-and-swap request on an 8-byte remote
    /// target. The old value lands in `local`. Only valid for reliable
    /// QPs.
    pub fn compare_swap(
        &self,
        local: &MrSlice,
        remote: &MrRemote,
        current: u64,
        new: u64,
        wr_id: WrId,
        signal: bool,
    ) -> Result<Seq> {
        self.post_send(
            &SendWr::compare_swap(Sge::from(local.clone()), *remote, current, new)
                .wr_id(wr_id)
                .signaled(signal),
        )
    }

    /// Post an atomic fetch-and-add request on an 8-byte remote target.
    /// The old value lands in `local`. Only valid for reliable QPs.
    pub fn fetch_add(
        &self,
        local: &MrSlice,
        remote: &MrRemote,
        add: u64,
        wr_id: WrId,
        signal: bool,
    ) -> Result<Seq> {
        self.post_send(
            &SendWr::fetch_add(Sge::from(local.clone()), *remote, add)
                .wr_id(wr_id)
                .signaled(signal),
        )
    }

    /// Post a no-op request. Completes without touching memory; useful
    /// for fencing and queue probing.
    pub fn noop(&self, wr_id: WrId, signal: bool) -> Result<Seq> {
        self.post_send(&SendWr::noop().wr_id(wr_id).signaled(signal))
    }

    /// Post a local-invalidate request retiring the given local key.
    pub fn local_inv(&self, key: LKey, wr_id: WrId, signal: bool) -> Result<Seq> {
        self.post_send(&SendWr::local_inv(key).wr_id(wr_id).signaled(signal))
    }
}

#[inline]
pub(crate) fn build_sgl(slices: &[MrSlice]) -> Vec<Sge> {
    slices.iter().map(|slice| Sge::from(slice.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::hw::{FatalMonitor, FaultClass, LoopbackTransport, ManualTransport};
    use crate::verbs::device::DeviceConfig;
    use crate::verbs::mr::Mr;

    fn manual_ctx() -> (Context, Arc<ManualTransport>) {
        let transport = Arc::new(ManualTransport::new());
        let ctx = Context::with_transport(DeviceConfig::default(), transport.clone()).unwrap();
        (ctx, transport)
    }

    fn loopback_ctx() -> Context {
        Context::with_transport(DeviceConfig::default(), Arc::new(LoopbackTransport::new()))
            .unwrap()
    }

    fn make_qp(pd: &Pd, cq: &Cq, send_depth: u32) -> Qp {
        Qp::builder()
            .send_cq(cq)
            .recv_cq(cq)
            .caps(QpCaps {
                max_send_wr: send_depth,
                max_recv_wr: send_depth,
                ..Default::default()
            })
            .qp_type(QpType::Rc)
            .sq_sig_all(false)
            .build(pd)
            .unwrap()
    }

    /// An RC QP connected to itself; with the manual transport nothing
    /// executes, so this is a pure queue-machinery harness.
    fn self_connected(pd: &Pd, cq: &Cq, depth: u32) -> Qp {
        let qp = make_qp(pd, cq, depth);
        let ep = QpEndpoint {
            port_num: 1,
            qpn: qp.qp_num(),
        };
        qp.connect(1, &ep).unwrap();
        qp
    }

    /// Two RC QPs on one device, connected to each other.
    fn connected_pair(ctx: &Context, pd: &Pd) -> (Qp, Qp, Cq, Cq) {
        let cq_a = Cq::new(ctx, Cq::DEFAULT_CQ_DEPTH).unwrap();
        let cq_b = Cq::new(ctx, Cq::DEFAULT_CQ_DEPTH).unwrap();
        let a = make_qp(pd, &cq_a, 16);
        let b = make_qp(pd, &cq_b, 16);
        let ep_a = QpEndpoint {
            port_num: 1,
            qpn: a.qp_num(),
        };
        let ep_b = QpEndpoint {
            port_num: 1,
            qpn: b.qp_num(),
        };
        a.connect(1, &ep_b).unwrap();
        b.connect(1, &ep_a).unwrap();
        (a, b, cq_a, cq_b)
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (ctx, _) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = make_qp(&pd, &cq, 4);
        assert_eq!(qp.state(), QpState::Reset);

        // Posting in Reset has no effect.
        assert!(matches!(
            qp.noop(0, true),
            Err(VerbsError::InvalidState(QpState::Reset))
        ));

        // Invalid port.
        assert!(matches!(
            qp.init(9, Permission::default()),
            Err(VerbsError::InvalidParameter(_))
        ));

        qp.init(1, Permission::default()).unwrap();
        assert_eq!(qp.state(), QpState::Init);
        assert_eq!(qp.port(), Some(1));

        // Connected transport requires a peer path at RTR.
        assert!(matches!(
            qp.ready_to_receive(None),
            Err(VerbsError::InvalidParameter(_))
        ));

        let ep = qp.endpoint().unwrap();
        let peer = QpPeer::resolve(&ctx, ep).unwrap();
        qp.ready_to_receive(Some(&peer)).unwrap();
        assert_eq!(qp.state(), QpState::Rtr);

        // Sends are still gated; receives are open.
        assert!(matches!(
            qp.noop(0, true),
            Err(VerbsError::InvalidState(QpState::Rtr))
        ));

        assert!(matches!(
            qp.ready_to_send(SendParams {
                retry_cnt: 9,
                ..Default::default()
            }),
            Err(VerbsError::InvalidParameter(_))
        ));
        qp.ready_to_send(SendParams::default()).unwrap();
        assert_eq!(qp.state(), QpState::Rts);
    }

    #[test]
    fn test_ud_skips_path() {
        let (ctx, _) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = Qp::builder()
            .send_cq(&cq)
            .recv_cq(&cq)
            .qp_type(QpType::Ud)
            .sq_sig_all(false)
            .build(&pd)
            .unwrap();
        qp.activate(1).unwrap();
        assert_eq!(qp.state(), QpState::Rts);

        // Datagram sends need an explicit peer.
        let buf = vec![0u8; 16];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();
        assert!(matches!(
            qp.send(&[mr.as_slice()], 1, true),
            Err(VerbsError::InvalidParameter(_))
        ));

        // RDMA is rejected on datagram transports.
        assert!(matches!(
            qp.write(&[mr.as_slice()], &mr.as_remote(), 1, true),
            Err(VerbsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_caps_validated_at_create() {
        let (ctx, _) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let err = Qp::builder()
            .send_cq(&cq)
            .recv_cq(&cq)
            .caps(QpCaps {
                max_send_wr: ctx.attr().max_qp_wr + 1,
                ..Default::default()
            })
            .qp_type(QpType::Rc)
            .sq_sig_all(false)
            .build(&pd)
            .unwrap_err();
        assert!(matches!(err, VerbsError::CapabilityNotEnough("max_send_wr", _, _)));
    }

    #[test]
    fn test_post_order_is_completion_order() {
        let (ctx, transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 8);

        for i in 0..4u64 {
            let seq = qp.noop(100 + i, true).unwrap();
            assert_eq!(seq, i);
        }
        transport.complete_all(WcStatus::Success);

        let wcs = cq.poll().unwrap();
        assert_eq!(wcs.len(), 4);
        for (i, wc) in wcs.iter().enumerate() {
            assert_eq!(wc.seq(), i as Seq);
            assert_eq!(wc.wr_id(), 100 + i as u64);
            assert_eq!(wc.status(), WcStatus::Success);
        }
    }

    #[test]
    fn test_out_of_order_device_completion_is_resequenced() {
        // Ring of 4, four signaled sends; the device completes
        // sequence 1 before sequence 0. Polling still observes 0, 1.
        let (ctx, transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 4);

        for i in 0..4u64 {
            qp.noop(i, true).unwrap();
        }
        let subs = transport.drain();
        assert_eq!(subs.len(), 4);

        subs[1].complete(WcStatus::Success, 0);
        assert!(cq.poll().unwrap().is_empty());

        subs[0].complete(WcStatus::Success, 0);
        let wcs = cq.poll().unwrap();
        assert_eq!(wcs.iter().map(Wc::seq).collect::<Vec<_>>(), vec![0, 1]);

        subs[3].complete(WcStatus::Success, 0);
        subs[2].complete(WcStatus::Success, 0);
        let wcs = cq.poll().unwrap();
        assert_eq!(wcs.iter().map(Wc::seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_send_queue_backpressure() {
        let (ctx, transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 2);

        qp.noop(0, true).unwrap();
        qp.noop(1, true).unwrap();
        assert!(matches!(
            qp.noop(2, true),
            Err(VerbsError::ResourceExhausted("send queue"))
        ));

        // Draining one completion frees a slot; the retry succeeds.
        transport.pop().unwrap().complete(WcStatus::Success, 0);
        assert_eq!(cq.poll().unwrap().len(), 1);
        assert_eq!(qp.noop(2, true).unwrap(), 2);
    }

    #[test]
    fn test_error_flushes_outstanding_in_order() {
        let (ctx, transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 8);

        for i in 0..3u64 {
            qp.noop(i, true).unwrap();
        }
        qp.set_error();
        assert_eq!(qp.state(), QpState::Error);

        let wcs = cq.poll().unwrap();
        assert_eq!(wcs.len(), 3);
        for (i, wc) in wcs.iter().enumerate() {
            assert_eq!(wc.seq(), i as Seq);
            assert_eq!(wc.status(), WcStatus::WrFlushErr);
        }

        // Terminal until reset: no further posts succeed.
        assert!(matches!(
            qp.noop(9, true),
            Err(VerbsError::InvalidState(QpState::Error))
        ));

        // Late device completions for flushed work are dropped.
        transport.complete_all(WcStatus::Success);
        assert!(cq.poll().unwrap().is_empty());

        // After a reset the QP is reusable and numbering restarts.
        qp.reset().unwrap();
        assert_eq!(qp.state(), QpState::Reset);
        let ep = QpEndpoint {
            port_num: 1,
            qpn: qp.qp_num(),
        };
        qp.connect(1, &ep).unwrap();
        assert_eq!(qp.noop(0, true).unwrap(), 0);
    }

    #[test]
    fn test_flush_covers_unsignaled_and_receives() {
        let (ctx, _transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let scq = Cq::new(&ctx, 16).unwrap();
        let rcq = Cq::new(&ctx, 16).unwrap();
        let qp = Qp::builder()
            .send_cq(&scq)
            .recv_cq(&rcq)
            .caps(QpCaps::default())
            .qp_type(QpType::Rc)
            .sq_sig_all(false)
            .build(&pd)
            .unwrap();
        let ep = QpEndpoint {
            port_num: 1,
            qpn: qp.qp_num(),
        };
        qp.connect(1, &ep).unwrap();

        let buf = vec![0u8; 64];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();

        qp.noop(0, false).unwrap();
        qp.noop(1, false).unwrap();
        qp.recv(&[mr.as_slice()], 2).unwrap();
        qp.set_error();

        // Flush reports every outstanding WQE, signaled or not.
        let wcs = scq.poll().unwrap();
        assert_eq!(wcs.len(), 2);
        assert!(wcs.iter().all(|wc| wc.status() == WcStatus::WrFlushErr));

        let wcs = rcq.poll().unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].wr_id(), 2);
        assert_eq!(wcs[0].status(), WcStatus::WrFlushErr);
        assert_eq!(wcs[0].opcode(), WcOpcode::Recv);
    }

    #[test]
    fn test_unsignaled_success_produces_no_cqe() {
        let (ctx, transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 8);

        qp.noop(0, false).unwrap();
        qp.noop(1, true).unwrap();
        transport.complete_all(WcStatus::Success);

        let wcs = cq.poll().unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].seq(), 1);
        assert_eq!(wcs[0].wr_id(), 1);
    }

    #[test]
    fn test_every_signaled_post_yields_exactly_one_cqe() {
        // Mixed normal completion and forced error: M signaled posts,
        // M completions, no more, no fewer.
        let (ctx, transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 32).unwrap();
        let qp = self_connected(&pd, &cq, 16);

        for i in 0..5u64 {
            qp.noop(i, true).unwrap();
        }
        // Two finish normally, the rest are flushed.
        transport.pop().unwrap().complete(WcStatus::Success, 0);
        transport.pop().unwrap().complete(WcStatus::Success, 0);
        qp.set_error();
        transport.complete_all(WcStatus::Success);

        let wcs = cq.poll().unwrap();
        assert_eq!(wcs.len(), 5);
        assert_eq!(wcs.iter().map(Wc::seq).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(
            wcs.iter().filter(|wc| wc.status() == WcStatus::Success).count(),
            2
        );
        assert_eq!(
            wcs.iter().filter(|wc| wc.status() == WcStatus::WrFlushErr).count(),
            3
        );
        assert!(cq.poll().unwrap().is_empty());
    }

    #[test]
    fn test_failed_completion_signals_even_unsignaled() {
        let (ctx, transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 8);

        qp.noop(0, false).unwrap();
        transport.complete_all(WcStatus::RetryExcErr);
        let wcs = cq.poll().unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].status(), WcStatus::RetryExcErr);
    }

    #[test]
    fn test_deregister_busy_while_in_flight() {
        let (ctx, transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 8);

        let buf = vec![7u8; 64];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();
        qp.send(&[mr.as_slice()], 1, true).unwrap();

        assert!(matches!(mr.deregister(), Err(VerbsError::ResourceBusy(_))));

        transport.complete_all(WcStatus::Success);
        assert_eq!(cq.poll().unwrap().len(), 1);
        mr.deregister().unwrap();
    }

    #[test]
    fn test_posting_against_stale_key_fails() {
        let (ctx, _) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 8);

        let buf = vec![0u8; 64];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();
        let slice_sge = Sge::from(mr.as_slice());
        mr.deregister().unwrap();

        let wr = SendWr::send(vec![slice_sge]).signaled(true);
        assert!(matches!(
            qp.post_send(&wr),
            Err(VerbsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_destroy_with_outstanding_flushes_into_surviving_cq() {
        let (ctx, _transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 8);
        let qpn = qp.qp_num();

        qp.noop(1, true).unwrap();
        qp.noop(2, true).unwrap();
        qp.destroy();

        assert_eq!(ctx.live_qps(), 0);
        let wcs = cq.poll().unwrap();
        assert_eq!(wcs.len(), 2);
        assert!(wcs.iter().all(|wc| wc.status() == WcStatus::WrFlushErr));
        assert!(wcs.iter().all(|wc| wc.qp_num() == qpn));
    }

    #[test]
    fn test_drain_then_reset() {
        let (ctx, transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 8);

        qp.noop(1, true).unwrap();
        qp.drain().unwrap();
        assert_eq!(qp.state(), QpState::Sqd);

        // New sends refused while draining.
        assert!(matches!(
            qp.noop(2, true),
            Err(VerbsError::InvalidState(QpState::Sqd))
        ));

        // Not yet drained.
        assert!(matches!(qp.reset(), Err(VerbsError::ResourceBusy(_))));

        transport.complete_all(WcStatus::Success);
        assert_eq!(cq.poll().unwrap().len(), 1);
        qp.reset().unwrap();
        assert_eq!(qp.state(), QpState::Reset);
    }

    #[test]
    fn test_device_fatal_fans_out() {
        let (ctx, _transport) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq1 = Cq::new(&ctx, 16).unwrap();
        let cq2 = Cq::new(&ctx, 16).unwrap();
        let qp1 = self_connected(&pd, &cq1, 8);
        let qp2 = self_connected(&pd, &cq2, 8);

        qp1.noop(1, true).unwrap();
        qp2.noop(2, true).unwrap();
        qp2.noop(3, true).unwrap();

        let monitor = FatalMonitor::with_interval(&ctx, std::time::Duration::from_secs(60));
        ctx.inject_fault(FaultClass::Parity);
        assert!(monitor.scan());

        assert_eq!(qp1.state(), QpState::Error);
        assert_eq!(qp2.state(), QpState::Error);
        assert_eq!(cq1.poll().unwrap().len(), 1);
        assert_eq!(cq2.poll().unwrap().len(), 2);

        // The device is dead: all verbs fail fast.
        assert!(matches!(
            qp1.noop(9, true),
            Err(VerbsError::DeviceFatal(FaultClass::Parity))
        ));
        assert!(matches!(
            qp1.init(1, Permission::default()),
            Err(VerbsError::DeviceFatal(_))
        ));
    }

    #[test]
    fn test_loopback_send_recv() {
        let ctx = loopback_ctx();
        let pd = Pd::new(&ctx);
        let (a, b, cq_a, cq_b) = connected_pair(&ctx, &pd);

        let src = (0u8..64).collect::<Vec<_>>();
        let dst = vec![0u8; 64];
        let mr_src = Mr::register(&pd, &src, Permission::default()).unwrap();
        let mr_dst = Mr::register(&pd, &dst, Permission::default()).unwrap();

        b.recv(&[mr_dst.as_slice()], 7).unwrap();
        a.send(&[mr_src.as_slice()], 8, true).unwrap();

        let wcs = cq_a.poll().unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].ok().unwrap(), 64);
        assert_eq!(wcs[0].opcode(), WcOpcode::Send);

        let wcs = cq_b.poll().unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].wr_id(), 7);
        assert_eq!(wcs[0].opcode(), WcOpcode::Recv);
        assert_eq!(wcs[0].ok().unwrap(), 64);

        let got = unsafe { std::slice::from_raw_parts(mr_dst.addr() as *const u8, 64) };
        assert_eq!(got, &src[..]);
    }

    #[test]
    fn test_loopback_rnr_when_no_receive_posted() {
        let ctx = loopback_ctx();
        let pd = Pd::new(&ctx);
        let (a, _b, cq_a, _cq_b) = connected_pair(&ctx, &pd);

        let src = vec![1u8; 16];
        let mr = Mr::register(&pd, &src, Permission::default()).unwrap();
        a.send(&[mr.as_slice()], 1, true).unwrap();

        let wcs = cq_a.poll().unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].status(), WcStatus::RnrRetryExcErr);
    }

    #[test]
    fn test_loopback_short_receive_buffer() {
        let ctx = loopback_ctx();
        let pd = Pd::new(&ctx);
        let (a, b, cq_a, cq_b) = connected_pair(&ctx, &pd);

        let src = vec![1u8; 64];
        let dst = vec![0u8; 16];
        let mr_src = Mr::register(&pd, &src, Permission::default()).unwrap();
        let mr_dst = Mr::register(&pd, &dst, Permission::default()).unwrap();

        b.recv(&[mr_dst.as_slice()], 1).unwrap();
        a.send(&[mr_src.as_slice()], 2, true).unwrap();

        assert_eq!(cq_b.poll().unwrap()[0].status(), WcStatus::LocLenErr);
        assert_eq!(cq_a.poll().unwrap()[0].status(), WcStatus::RemOpErr);
    }

    #[test]
    fn test_loopback_rdma_write_and_read() {
        let ctx = loopback_ctx();
        let pd = Pd::new(&ctx);
        let (a, _b, cq_a, _cq_b) = connected_pair(&ctx, &pd);

        let local = (10u8..74).collect::<Vec<_>>();
        let target = vec![0u8; 64];
        let readback = vec![0u8; 64];
        let mr_local = Mr::register(&pd, &local, Permission::default()).unwrap();
        let mr_target = Mr::register(&pd, &target, Permission::default()).unwrap();
        let mr_readback = Mr::register(&pd, &readback, Permission::default()).unwrap();

        a.write(&[mr_local.as_slice()], &mr_target.as_remote(), 1, true)
            .unwrap();
        assert_eq!(cq_a.poll().unwrap()[0].ok().unwrap(), 64);
        let got = unsafe { std::slice::from_raw_parts(mr_target.addr() as *const u8, 64) };
        assert_eq!(got, &local[..]);

        a.read(&[mr_readback.as_slice()], &mr_target.as_remote(), 2, true)
            .unwrap();
        assert_eq!(cq_a.poll().unwrap()[0].ok().unwrap(), 64);
        let got = unsafe { std::slice::from_raw_parts(mr_readback.addr() as *const u8, 64) };
        assert_eq!(got, &local[..]);
    }

    #[test]
    fn test_loopback_remote_access_error() {
        let ctx = loopback_ctx();
        let pd = Pd::new(&ctx);
        let (a, _b, cq_a, _cq_b) = connected_pair(&ctx, &pd);

        let local = vec![0u8; 32];
        let target = vec![0u8; 32];
        let mr_local = Mr::register(&pd, &local, Permission::default()).unwrap();
        // No remote-write permission on the target region.
        let mr_target = Mr::register(&pd, &target, Permission::LOCAL_WRITE).unwrap();

        a.write(&[mr_local.as_slice()], &mr_target.as_remote(), 1, true)
            .unwrap();
        assert_eq!(cq_a.poll().unwrap()[0].status(), WcStatus::RemAccessErr);
    }

    #[test]
    fn test_loopback_atomics() {
        let ctx = loopback_ctx();
        let pd = Pd::new(&ctx);
        let (a, _b, cq_a, _cq_b) = connected_pair(&ctx, &pd);

        // Boxed u64s guarantee the 8-byte alignment atomics require.
        let counter = Box::new(100u64);
        let old_val = Box::new(0u64);
        let mr_counter = unsafe {
            Mr::register_raw(&pd, &*counter as *const u64 as *mut u8, 8, Permission::default())
        }
        .unwrap();
        let mr_old = unsafe {
            Mr::register_raw(&pd, &*old_val as *const u64 as *mut u8, 8, Permission::default())
        }
        .unwrap();
        let read_u64 = |addr: u64| unsafe { std::ptr::read_volatile(addr as *const u64) };

        // Fetch-and-add returns 100 and bumps the counter to 107.
        a.fetch_add(&mr_old.as_slice(), &mr_counter.as_remote(), 7, 1, true)
            .unwrap();
        assert_eq!(cq_a.poll().unwrap()[0].ok().unwrap(), 8);
        assert_eq!(read_u64(mr_old.addr()), 100);
        assert_eq!(read_u64(mr_counter.addr()), 107);

        // Mismatched compare leaves the value; the old value comes back.
        a.compare_swap(&mr_old.as_slice(), &mr_counter.as_remote(), 1, 0, 2, true)
            .unwrap();
        assert_eq!(cq_a.poll().unwrap()[0].ok().unwrap(), 8);
        assert_eq!(read_u64(mr_old.addr()), 107);
        assert_eq!(read_u64(mr_counter.addr()), 107);

        // Matching compare swaps in the new value.
        a.compare_swap(&mr_old.as_slice(), &mr_counter.as_remote(), 107, 1, 3, true)
            .unwrap();
        assert_eq!(cq_a.poll().unwrap()[0].ok().unwrap(), 8);
        assert_eq!(read_u64(mr_counter.addr()), 1);
    }

    #[test]
    fn test_atomic_alignment_validated() {
        let (ctx, _) = manual_ctx();
        let pd = Pd::new(&ctx);
        let cq = Cq::new(&ctx, 16).unwrap();
        let qp = self_connected(&pd, &cq, 8);

        let buf = vec![0u8; 64];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();
        let short = mr.get_slice(0..4).unwrap();
        assert!(matches!(
            qp.compare_swap(&short, &mr.as_remote(), 0, 1, 1, true),
            Err(VerbsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_local_invalidate() {
        let ctx = loopback_ctx();
        let pd = Pd::new(&ctx);
        let (a, _b, cq_a, _cq_b) = connected_pair(&ctx, &pd);

        let buf = vec![0u8; 64];
        let mr = Mr::register(&pd, &buf, Permission::default()).unwrap();
        let sge = Sge::from(mr.as_slice());

        a.local_inv(mr.lkey(), 1, true).unwrap();
        assert_eq!(cq_a.poll().unwrap()[0].status(), WcStatus::Success);

        // The key no longer resolves at post time.
        assert!(matches!(
            a.post_send(&SendWr::send(vec![sge]).signaled(true)),
            Err(VerbsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_concurrent_qps_on_one_device() {
        let ctx = loopback_ctx();
        let pd = Pd::new(&ctx);
        let mut handles = Vec::new();
        for t in 0..4u8 {
            let ctx = ctx.clone();
            let pd = pd.clone();
            handles.push(std::thread::spawn(move || {
                let (a, b, cq_a, cq_b) = connected_pair(&ctx, &pd);
                let src = vec![t; 32];
                let dst = vec![0u8; 32];
                let mr_src = Mr::register(&pd, &src, Permission::default()).unwrap();
                let mr_dst = Mr::register(&pd, &dst, Permission::default()).unwrap();
                for i in 0..100u64 {
                    b.recv(&[mr_dst.as_slice()], i).unwrap();
                    a.send(&[mr_src.as_slice()], i, true).unwrap();
                    assert_eq!(cq_a.poll().unwrap().len(), 1);
                    let wcs = cq_b.poll().unwrap();
                    assert_eq!(wcs.len(), 1);
                    assert_eq!(wcs[0].wr_id(), i);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_ud_send_to_peer() {
        let ctx = loopback_ctx();
        let pd = Pd::new(&ctx);
        let cq_a = Cq::new(&ctx, 16).unwrap();
        let cq_b = Cq::new(&ctx, 16).unwrap();
        let mk_ud = |cq: &Cq| {
            Qp::builder()
                .send_cq(cq)
                .recv_cq(cq)
                .qp_type(QpType::Ud)
                .sq_sig_all(false)
                .build(&pd)
                .unwrap()
        };
        let a = mk_ud(&cq_a);
        let b = mk_ud(&cq_b);
        a.activate(1).unwrap();
        b.activate(1).unwrap();

        let src = vec![9u8; 32];
        let dst = vec![0u8; 32];
        let mr_src = Mr::register(&pd, &src, Permission::default()).unwrap();
        let mr_dst = Mr::register(&pd, &dst, Permission::default()).unwrap();

        b.recv(&[mr_dst.as_slice()], 1).unwrap();
        let peer = QpPeer::resolve(&ctx, b.endpoint().unwrap()).unwrap();
        a.send_to(&peer, &[mr_src.as_slice()], 2, true).unwrap();

        assert_eq!(cq_a.poll().unwrap()[0].status(), WcStatus::Success);
        let wcs = cq_b.poll().unwrap();
        assert_eq!(wcs[0].ok().unwrap(), 32);
    }
}
