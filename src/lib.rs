//! A software-emulated InfiniBand host channel adapter, exposing the
//! Verbs transport model (queue pairs, completion queues, registered
//! memory regions and work requests) without any hardware underneath.
//!
//! `softib` provides `Arc`-based custom types for all resource holders
//! ([`Context`], [`Pd`], [`Cq`], [`Mr`], and [`Qp`]). These should be
//! viewed as references to the true underlying resources: you can share
//! a resource simply by `clone()`-ing its handle, which drastically
//! simplifies multi-threaded designs.
//!
//! Work requests posted to a [`Qp`] are executed by a pluggable device
//! model (the [`hw`] mod). The default [`hw::LoopbackTransport`] runs
//! every operation against registered memory on the local device, so a
//! full post/complete/poll cycle works in an ordinary process.
//!
//! # Example
//!
//! ```rust
//! use softib::*;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let context = Context::open(DeviceConfig::default())?;
//!     let pd = Pd::new(&context);
//!
//!     let buf = vec![0u8; 4096];
//!     let mr = Mr::register(&pd, &buf, Permission::default())?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Completion semantics follow the verbs contract: every successfully
//! posted signaled work request eventually yields exactly one work
//! completion (success, failure, or flush), delivered in post order
//! within each work queue.

mod verbs;
pub use verbs::type_alias::*;
pub use verbs::{context::Context, cq::*, device::*, error::*, mr::*, pd::Pd, qp::*, wr::*};

/// Device model: transports that execute submitted work requests, and
/// the catastrophic-error watchdog.
pub mod hw;

pub mod prelude;
