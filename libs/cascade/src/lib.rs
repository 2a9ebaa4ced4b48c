//! Cascade: hierarchical parallel dispatch
//!
//! A parent splits a segment of work into pieces, sends each child its share
//! as an [`Invoke`](codec::Invoke) envelope, and re-weights future splits from
//! how quickly each child answered. Any node can be a parent and a child at
//! once, so trees of masters-of-masters are built from one node type.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────┐      ┌───────────────────────┐
//! │        Mediator        │      │    network crate      │
//! │                        │      │                       │
//! │  Slave ── System ──────┼──────┼─▶ chief connection    │
//! │                        │      │                       │
//! │  ParallelSystemArray   │      │                       │
//! │   └ SystemArray        │      │                       │
//! │      ├ System ─────────┼──────┼─▶ child connection    │
//! │      ├ System ─────────┼──────┼─▶ child connection    │
//! │      └ Role index      │      │                       │
//! └────────────────────────┘      └───────────────────────┘
//! ```
//!
//! # Error Handling
//!
//! Failures of one child never take down the array. A lost connection
//! removes the System and shrinks the round in flight; its pieces are
//! reported as lost work in the [`RoundReport`]. Malformed or unroutable
//! envelopes are logged and dropped with the connection left open.

pub mod array;
pub mod error;
pub mod handlers;
pub mod mediator;
pub mod metrics;
pub mod parallel;
pub mod role;
pub mod slave;
pub mod system;

pub use array::{ArrayObserver, ChildFactory, SystemArray, SystemFactory};
pub use error::{Result, SystemError};
pub use handlers::{Handler, HandlerTable};
pub use mediator::Mediator;
pub use metrics::{ArrayMetrics, ArrayStats};
pub use parallel::{
    allocate, ParallelSystemArray, RoundCallbacks, RoundPhase, RoundReport, DEFAULT_SMOOTHING,
};
pub use role::Role;
pub use slave::{ChiefFallback, LostWork, PieceRequest, Slave};
pub use system::{InvokeHistory, System, SystemOwner, UNASSIGNED};
