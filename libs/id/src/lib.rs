//! # corral-id
//!
//! Typed identifiers for the corral cluster master.
//!
//! Master-assigned identifiers (agents, frameworks, offers, operations,
//! executors) use a prefixed ULID format: `{prefix}_{ulid}`.
//!
//! Examples:
//! - `agent_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `fw_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `offer_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! ULIDs sort by creation time, which gives the master a deterministic
//! iteration order over offers and operations.
//!
//! Task ids are chosen by schedulers and are plain non-empty strings.
//! Subscription stream ids are random UUIDs.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
