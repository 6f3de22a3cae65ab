//! Call-level error taxonomy.
//!
//! These are the errors returned synchronously from verbs calls. They
//! are caught before any side effect takes place: a call that returns
//! an error has not enqueued anything and will never produce a work
//! completion. Failures of work that was already accepted are reported
//! asynchronously through [`WcStatus`](crate::verbs::cq::WcStatus)
//! instead.

use thiserror::Error;

use crate::hw::FaultClass;
use crate::verbs::qp::QpState;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, VerbsError>;

/// Verbs call error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerbsError {
    /// Malformed request. Caught before any side effect.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The operation is not legal in the QP's current state. The state
    /// that rejected the operation is carried in the error. No side
    /// effect has taken place.
    #[error("operation not permitted in QP state {0:?}")]
    InvalidState(QpState),

    /// A queue is at capacity. Transient: retry after completions have
    /// drained the queue.
    #[error("{0} is full")]
    ResourceExhausted(&'static str),

    /// An allocation or memory-pinning failure. Not retryable without
    /// releasing other resources first.
    #[error("insufficient resources: {0}")]
    InsufficientResources(&'static str),

    /// The resource is referenced by outstanding work and cannot be
    /// released or transitioned yet.
    #[error("resource busy: {0}")]
    ResourceBusy(&'static str),

    /// A requested capability exceeds what the device supports. The
    /// three fields are the capability name, the maximum supported
    /// value, and the required value.
    #[error("capability not enough: {0} supports up to {1}, {2} required")]
    CapabilityNotEnough(&'static str, u32, u32),

    /// The completion queue has overrun. Completions were rejected
    /// because the queue was at capacity; the overrun is reported once
    /// on the first poll after it happened.
    #[error("completion queue overrun")]
    CqOverrun,

    /// A blocking wait elapsed without its condition being met.
    #[error("wait timed out")]
    TimedOut,

    /// The device is in a catastrophic error state and will stay there
    /// until reopened.
    #[error("device fatal: {0}")]
    DeviceFatal(FaultClass),

    /// A device configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}
