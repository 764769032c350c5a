//! # Actor Module
//!
//! Actor-style scheduling: every subsystem owns one thread, one lock-free
//! mailbox and a control mailbox fed by the [`ControlBus`].

pub mod control;
pub mod harness;

pub use control::{ControlBus, ControlMailbox, ControlMessage, GameState, ReloadKind};
pub use harness::{Actor, ActorContext, ActorError, ActorHandle, ActorHost, DEFAULT_MESSAGE_BUDGET};
