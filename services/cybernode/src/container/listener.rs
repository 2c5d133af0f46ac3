use anyhow::Result;
use async_trait::async_trait;

use crate::model::ServiceRecord;

/// Observer of instance lifecycle transitions in the container.
///
/// Listeners are notified in registration order, outside the container's
/// lock. A failing listener is logged and never affects the instance or the
/// other listeners.
#[async_trait]
pub trait ContainerListener: Send + Sync {
    /// An instance finished loading and is now active.
    async fn service_instantiated(&self, record: &ServiceRecord) -> Result<()>;

    /// An instance stopped, failed or never finished loading.
    async fn service_discarded(&self, record: &ServiceRecord) -> Result<()>;
}
