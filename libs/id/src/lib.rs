//! # cybernode-id
//!
//! Typed identifiers shared by the Cybernode agent and its orchestrator
//! bindings.
//!
//! ## ID Format
//!
//! Every identifier is a UUID carried behind a resource prefix:
//! `{prefix}_{uuid}`.
//!
//! Examples:
//! - `node_0192f3c1-5b2e-7a40-9d1e-3f0c2b7a9e11`
//! - `sb_0192f3c1-6a11-7c02-8b44-0e9d6a1f2c35`
//! - `lease_0192f3c1-7d90-7e18-a3c5-51b2e4f0d678`
//!
//! Fresh identifiers are UUIDv7, so ids minted by one process sort by
//! creation time. Parsing accepts any UUID version so identities minted by
//! orchestrators round-trip unchanged.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
