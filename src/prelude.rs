//! The softib prelude.
//!
//! The purpose of this module is to alleviate imports of common verbs
//! functionalities.

pub use crate::hw::{FatalMonitor, FaultClass, LoopbackTransport, ManualTransport, Transport};
pub use crate::verbs::context::Context;
pub use crate::verbs::cq::{Cq, Wc, WcOpcode, WcStatus};
pub use crate::verbs::device::{DeviceAttr, DeviceConfig, Port, PortState};
pub use crate::verbs::error::{Result, VerbsError};
pub use crate::verbs::mr::{Mr, MrRemote, MrSlice, Permission};
pub use crate::verbs::pd::Pd;
pub use crate::verbs::qp::{Qp, QpCaps, QpEndpoint, QpPeer, QpState, QpType, SendParams};
pub use crate::verbs::wr::{RecvWr, SendWr, Sge, WrOpcode};
