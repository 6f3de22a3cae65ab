//! The loopback execution engine.
//!
//! Executes every submitted work request against registered memory on
//! the local device, standing in for HCA hardware: sends are matched to
//! receive work requests posted on the destination QP, RDMA and atomic
//! operations access rkey-validated remote regions directly. Execution
//! is immediate, but all results flow through the normal completion
//! path, so callers observe the same ordering contract a real device
//! provides.

use std::sync::{Arc, Mutex};

use crate::verbs::cq::WcStatus;
use crate::verbs::mr::Permission;
use crate::verbs::qp::QpShared;
use crate::verbs::wr::{ResolvedSge, WrOpcode};

use super::{Side, Submission, Transport};

/// The default software device: a loopback engine executing work
/// against local memory.
pub struct LoopbackTransport {
    /// Serializes atomic operations; the software device's equivalent
    /// of the HCA's atomic execution unit.
    atomics: Mutex<()>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            atomics: Mutex::new(()),
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn submit(&self, sub: Submission) {
        let Some(src) = sub.qp() else {
            return;
        };
        match sub.opcode() {
            WrOpcode::Noop | WrOpcode::BindMw | WrOpcode::FastReg => {
                // No backing window/registration state in the software
                // device; accepted and completed.
                sub.complete(WcStatus::Success, 0);
            }
            WrOpcode::LocalInv => match sub.invalidate_key {
                Some(key) if src.pd().invalidate(key) => sub.complete(WcStatus::Success, 0),
                _ => sub.complete(WcStatus::GeneralErr, 0),
            },
            WrOpcode::Send => self.execute_send(&src, &sub),
            WrOpcode::RdmaWrite | WrOpcode::RdmaRead => self.execute_rdma(&src, &sub),
            WrOpcode::CompSwap | WrOpcode::FetchAdd => self.execute_atomic(&src, &sub),
        }
    }
}

impl LoopbackTransport {
    fn resolve_dest(src: &Arc<QpShared>, sub: &Submission) -> Option<Arc<QpShared>> {
        let ep = sub.dest?;
        src.ctx().lookup_qp(ep.qpn)
    }

    fn execute_send(&self, src: &Arc<QpShared>, sub: &Submission) {
        let reliable = src.qp_type().is_reliable();
        let dst = match Self::resolve_dest(src, sub) {
            Some(dst) if dst.can_receive() => dst,
            // Datagram sends are fire-and-forget; reliable transports
            // exhaust their retry budget against a dead peer.
            _ if reliable => return sub.complete(WcStatus::RetryExcErr, 0),
            _ => return sub.complete(WcStatus::Success, sub.total_len()),
        };
        let Some((rseq, rsgl, rcap)) = dst.take_recv_match() else {
            // Receiver not ready: no receive posted.
            if reliable {
                return sub.complete(WcStatus::RnrRetryExcErr, 0);
            }
            return sub.complete(WcStatus::Success, sub.total_len());
        };
        if sub.total_len() > rcap {
            dst.deliver_completion(Side::Recv, rseq, WcStatus::LocLenErr, 0);
            if reliable {
                return sub.complete(WcStatus::RemOpErr, 0);
            }
            return sub.complete(WcStatus::Success, sub.total_len());
        }

        // SAFETY: both lists resolve into live registered regions held
        // in flight by their work queue entries.
        unsafe { copy_gather_scatter(&sub.sgl, &rsgl) };
        dst.deliver_completion(Side::Recv, rseq, WcStatus::Success, sub.total_len());
        sub.complete(WcStatus::Success, sub.total_len());
    }

    fn execute_rdma(&self, src: &Arc<QpShared>, sub: &Submission) {
        let Some(remote) = sub.remote else {
            return sub.complete(WcStatus::GeneralErr, 0);
        };
        let dst = match Self::resolve_dest(src, sub) {
            Some(dst) if dst.can_receive() => dst,
            _ => return sub.complete(WcStatus::RetryExcErr, 0),
        };
        let need = match sub.opcode() {
            WrOpcode::RdmaWrite => Permission::REMOTE_WRITE,
            _ => Permission::REMOTE_READ,
        };
        // The guard keeps the remote region alive across the copy.
        let _target = match dst.pd().check_remote(&remote, need) {
            Ok(state) => state,
            Err(status) => {
                log::debug!("QP {}: rdma target rejected ({})", src.qp_num(), status);
                return sub.complete(status, 0);
            }
        };
        if sub.total_len() as usize > remote.len {
            return sub.complete(WcStatus::RemAccessErr, 0);
        }

        // SAFETY: local SGEs and the remote range were both validated
        // against live registered regions.
        unsafe {
            match sub.opcode() {
                WrOpcode::RdmaWrite => gather_to(&sub.sgl, remote.addr),
                _ => scatter_from(remote.addr, &sub.sgl),
            }
        }
        sub.complete(WcStatus::Success, sub.total_len());
    }

    fn execute_atomic(&self, src: &Arc<QpShared>, sub: &Submission) {
        let Some(remote) = sub.remote else {
            return sub.complete(WcStatus::GeneralErr, 0);
        };
        let dst = match Self::resolve_dest(src, sub) {
            Some(dst) if dst.can_receive() => dst,
            _ => return sub.complete(WcStatus::RetryExcErr, 0),
        };
        let _target = match dst.pd().check_remote(&remote, Permission::REMOTE_ATOMIC) {
            Ok(state) => state,
            Err(status) => {
                log::debug!("QP {}: atomic target rejected ({})", src.qp_num(), status);
                return sub.complete(status, 0);
            }
        };

        let _serial = self.atomics.lock().unwrap();
        // SAFETY: the remote range was validated to be a live, aligned
        // 8-byte target; atomics are serialized by the lock above.
        let old = unsafe { std::ptr::read_volatile(remote.addr as *const u64) };
        let new = match sub.opcode() {
            WrOpcode::CompSwap => {
                if old == sub.compare_add {
                    sub.swap
                } else {
                    old
                }
            }
            _ => old.wrapping_add(sub.compare_add),
        };
        // SAFETY: as above.
        unsafe { std::ptr::write_volatile(remote.addr as *mut u64, new) };

        // The old value lands in the (single, 8-byte) local SGE.
        // SAFETY: validated at post time.
        unsafe { scatter_bytes(&old.to_ne_bytes(), &sub.sgl) };
        sub.complete(WcStatus::Success, 8);
    }
}

/// Copy the gathered contents of `src` to the flat address `dst`.
unsafe fn gather_to(src: &[ResolvedSge], mut dst: u64) {
    for sge in src {
        std::ptr::copy(sge.addr as *const u8, dst as *mut u8, sge.len as usize);
        dst += sge.len as u64;
    }
}

/// Scatter the flat address range starting at `src` across `dst`.
unsafe fn scatter_from(mut src: u64, dst: &[ResolvedSge]) {
    for sge in dst {
        std::ptr::copy(src as *const u8, sge.addr as *mut u8, sge.len as usize);
        src += sge.len as u64;
    }
}

/// Scatter a byte buffer across `dst`.
unsafe fn scatter_bytes(src: &[u8], dst: &[ResolvedSge]) {
    let mut off = 0usize;
    for sge in dst {
        let n = (sge.len as usize).min(src.len() - off);
        std::ptr::copy(src[off..].as_ptr(), sge.addr as *mut u8, n);
        off += n;
        if off == src.len() {
            break;
        }
    }
}

/// Stream-copy from one scatter/gather list to another. The source
/// total must not exceed the destination total (checked by the caller).
unsafe fn copy_gather_scatter(src: &[ResolvedSge], dst: &[ResolvedSge]) {
    let mut di = 0usize;
    let mut doff = 0u64;
    for s in src {
        let mut saddr = s.addr;
        let mut sleft = s.len as u64;
        while sleft > 0 {
            let d = &dst[di];
            let dleft = d.len as u64 - doff;
            if dleft == 0 {
                di += 1;
                doff = 0;
                continue;
            }
            let n = sleft.min(dleft);
            std::ptr::copy(saddr as *const u8, (d.addr + doff) as *mut u8, n as usize);
            saddr += n;
            sleft -= n;
            doff += n;
            if doff == d.len as u64 {
                di += 1;
                doff = 0;
            }
        }
    }
}
