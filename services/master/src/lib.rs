//! corral master library.
//!
//! The `corral-master` binary wires these modules behind an HTTP API; the
//! library surface exists for integration testing and for embedding the
//! master with other registry, allocator or messenger implementations.

pub mod actors;
pub mod allocator;
pub mod api;
pub mod authz;
pub mod config;
pub mod content;
pub mod error;
pub mod maintenance;
pub mod master;
pub mod messenger;
pub mod operation;
pub mod operator;
pub mod queue;
pub mod readonly;
pub mod registry;
pub mod resources;
pub mod scheduler;
pub mod state;

pub use error::MasterError;
pub use master::{start, Collaborators, MasterHandle, MasterOptions};
