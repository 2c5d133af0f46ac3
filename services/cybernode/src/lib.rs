//! Cybernode compute-node agent.
//!
//! A Cybernode advertises this host's capacity to one or more provision
//! managers (orchestrators), accepts requests to run service instances and
//! keeps a record of everything it has run.
//!
//! ## Architecture
//!
//! - **Front door** ([`node`]): admission control over concurrent requests
//! - **Container** ([`container`]): lifecycle of every local instance
//! - **Consumer** ([`consumer`]): lease registration, renewal, reconnection
//! - **Statements** ([`statement`]): placement history, in memory or on disk
//! - **Runtime** ([`runtime`]): boundary to the machinery that runs services
//!
//! Components share a [`NodeContext`] rather than process-wide state, so
//! several nodes can live in one process.

pub mod admission;
pub mod api;
pub mod capacity;
pub mod config;
pub mod consumer;
pub mod container;
pub mod context;
pub mod error;
pub mod model;
pub mod node;
pub mod runtime;
pub mod scheduler;
pub mod statement;

pub use config::Config;
pub use context::NodeContext;
pub use error::{FailureKind, InstantiationError, ProvisionError, RemoteError};
pub use node::{Cybernode, InstantiationOutcome, InstantiationRequest, ProvisionEventKind};
