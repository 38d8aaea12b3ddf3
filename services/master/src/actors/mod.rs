//! Actor framework for the master.
//!
//! All cluster state is owned by a single actor. Work that has to wait on a
//! collaborator runs on a spawned task and re-enters the actor by posting a
//! message to the tail of its own mailbox.

mod framework;

pub use framework::{spawn, Actor, ActorContext, ActorError, ActorHandle, ActorState, Message};
