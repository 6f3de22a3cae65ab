//! Device context.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::hw::{FaultClass, FaultRegister, LoopbackTransport, Transport};
use crate::verbs::device::{DeviceAttr, DeviceConfig, Port, PortState};
use crate::verbs::error::{Result, VerbsError};
use crate::verbs::qp::QpShared;
use crate::verbs::type_alias::*;

/// Ownership holder of an open device.
pub(crate) struct CtxInner {
    config: DeviceConfig,
    ports: Vec<Port>,
    transport: Arc<dyn Transport>,
    clock: quanta::Clock,

    /// Device fault register, inspected by the watchdog.
    fault: FaultRegister,

    /// Catastrophic error state. Set at most once per open; terminal.
    fatal: Mutex<Option<FaultClass>>,

    /// Registry of live queue pairs on this device. Holds weak handles
    /// so that the registry never keeps a QP alive; destroyed QPs are
    /// pruned lazily.
    qps: Mutex<HashMap<Qpn, Weak<QpShared>>>,

    next_qpn: AtomicU32,
    next_key: AtomicU32,
}

/// An open software HCA instance.
///
/// All per-device state lives here: port list, capability limits, the
/// live-QP registry, the transport executing submitted work, and the
/// catastrophic error flag. Every other resource type holds a clone of
/// this handle.
#[derive(Clone)]
pub struct Context {
    inner: Arc<CtxInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.config.name)
            .finish()
    }
}

impl Context {
    /// Open a software device with the default loopback transport.
    pub fn open(config: DeviceConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(LoopbackTransport::new()))
    }

    /// Open a software device with the given transport.
    pub fn with_transport(config: DeviceConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        if config.num_ports == 0 {
            return Err(VerbsError::InvalidParameter("device must have at least one port"));
        }
        let ports = (1..=config.num_ports).map(Port::new).collect();
        Ok(Self {
            inner: Arc::new(CtxInner {
                config,
                ports,
                transport,
                clock: quanta::Clock::new(),
                fault: FaultRegister::new(),
                fatal: Mutex::new(None),
                qps: Mutex::new(HashMap::new()),
                next_qpn: AtomicU32::new(0x10),
                next_key: AtomicU32::new(0x1000),
            }),
        })
    }

    /// Get the device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Get the device capability limits.
    pub fn attr(&self) -> &DeviceAttr {
        &self.inner.config.attr
    }

    /// Get a port by number. Port numbers start at 1.
    pub fn port(&self, num: PortNum) -> Option<Port> {
        self.inner.ports.get(num.checked_sub(1)? as usize).copied()
    }

    /// Get the number of ports on the device.
    pub fn num_ports(&self) -> PortNum {
        self.inner.ports.len() as PortNum
    }

    /// Get the device's monotonic clock.
    pub fn clock(&self) -> &quanta::Clock {
        &self.inner.clock
    }

    /// Check whether the device is in the catastrophic error state.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.fatal_class().is_some()
    }

    /// Get the fault class that took the device down, if any.
    pub fn fatal_class(&self) -> Option<FaultClass> {
        *self.inner.fatal.lock().unwrap()
    }

    /// Latch a fault into the device fault register.
    ///
    /// This models the hardware side of a catastrophic failure: the
    /// register is only a flag until the watchdog (or an explicit
    /// [`FatalMonitor::scan`](crate::hw::FatalMonitor::scan)) inspects
    /// it and takes the device down.
    pub fn inject_fault(&self, class: FaultClass) {
        self.inner.fault.latch(class);
    }

    /// Get the number of live queue pairs on the device.
    pub fn live_qps(&self) -> usize {
        self.inner
            .qps
            .lock()
            .unwrap()
            .values()
            .filter(|qp| qp.strong_count() > 0)
            .count()
    }

    pub(crate) fn fault_register(&self) -> &FaultRegister {
        &self.inner.fault
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Enter the catastrophic error state and fan the failure out to
    /// every live queue pair. Idempotent; the first fault class wins.
    pub(crate) fn raise_fatal(&self, class: FaultClass) {
        {
            let mut fatal = self.inner.fatal.lock().unwrap();
            if fatal.is_some() {
                return;
            }
            *fatal = Some(class);
        }
        log::error!(
            "{}: catastrophic {} error, failing all queue pairs",
            self.inner.config.name,
            class
        );

        // Snapshot the registry first: the error transition takes ring
        // and CQ locks, which must not nest under the registry lock.
        let qps: Vec<Arc<QpShared>> = {
            let qps = self.inner.qps.lock().unwrap();
            qps.values().filter_map(Weak::upgrade).collect()
        };
        for qp in qps {
            qp.force_error("device fatal");
        }
    }

    pub(crate) fn register_qp(&self, qpn: Qpn, qp: Weak<QpShared>) {
        self.inner.qps.lock().unwrap().insert(qpn, qp);
    }

    pub(crate) fn unregister_qp(&self, qpn: Qpn) {
        self.inner.qps.lock().unwrap().remove(&qpn);
    }

    pub(crate) fn lookup_qp(&self, qpn: Qpn) -> Option<Arc<QpShared>> {
        self.inner.qps.lock().unwrap().get(&qpn)?.upgrade()
    }

    pub(crate) fn alloc_qpn(&self) -> Qpn {
        self.inner.next_qpn.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a memory region key. The software device issues the
    /// same value for the local and the remote key.
    pub(crate) fn alloc_key(&self) -> LKey {
        self.inner.next_key.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn port_active(&self, num: PortNum) -> bool {
        self.port(num).map(|p| p.state() == PortState::Active).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open() {
        let ctx = Context::open(DeviceConfig::default()).unwrap();
        assert_eq!(ctx.num_ports(), 1);
        assert!(ctx.port(1).is_some());
        assert!(ctx.port(0).is_none());
        assert!(ctx.port(2).is_none());
        assert!(!ctx.is_fatal());
    }

    #[test]
    fn test_zero_ports_rejected() {
        let config = DeviceConfig {
            num_ports: 0,
            ..Default::default()
        };
        assert!(matches!(
            Context::open(config),
            Err(VerbsError::InvalidParameter(_))
        ));
    }
}
