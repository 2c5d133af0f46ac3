//! Service statement persistence.
//!
//! A statement is the placement history of one service element on this
//! node. Two managers are provided:
//! - [`TransientStatementManager`]: in-memory, keeps only elements that
//!   still have active records
//! - [`DurableStatementManager`]: one JSON file per element, swept by age
//!
//! Neither manager ever surfaces I/O failures to its callers; a statement
//! that cannot be read or written is logged and treated as absent.

mod durable;
mod recorder;
mod transient;

use async_trait::async_trait;

use crate::model::{ServiceElement, ServiceStatement};

pub use durable::{statement_file_name, DurableStatementManager, SWEEP_INTERVAL};
pub use recorder::StatementRecorder;
pub use transient::TransientStatementManager;

/// Storage for service statements.
#[async_trait]
pub trait ServiceStatementManager: Send + Sync {
    /// All known statements.
    async fn get_all(&self) -> Vec<ServiceStatement>;

    /// The statement for `element`, if one exists.
    async fn get(&self, element: &ServiceElement) -> Option<ServiceStatement>;

    /// Store `statement`, replacing any previous version.
    async fn record(&self, statement: &ServiceStatement);

    /// Release resources held by the manager.
    async fn terminate(&self);
}
