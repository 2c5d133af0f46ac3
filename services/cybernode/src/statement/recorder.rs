use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cybernode_id::NodeId;
use tokio::sync::Mutex;
use tracing::debug;

use super::ServiceStatementManager;
use crate::container::ContainerListener;
use crate::model::{ServiceRecord, ServiceStatement};

/// Folds container lifecycle transitions into service statements.
pub struct StatementRecorder {
    node_id: NodeId,
    manager: Arc<dyn ServiceStatementManager>,
    /// Serializes read-modify-write of statements.
    update: Mutex<()>,
}

impl StatementRecorder {
    pub fn new(node_id: NodeId, manager: Arc<dyn ServiceStatementManager>) -> Self {
        Self {
            node_id,
            manager,
            update: Mutex::new(()),
        }
    }

    async fn apply(&self, record: &ServiceRecord) {
        let _guard = self.update.lock().await;
        let mut statement = self
            .manager
            .get(&record.element)
            .await
            .unwrap_or_else(|| ServiceStatement::new(record.element.clone()));
        statement.element = record.element.clone();
        statement.put_service_record(self.node_id, record.clone());
        self.manager.record(&statement).await;
        debug!(
            element = %record.element,
            instance = %record.instance.id,
            record_type = ?record.record_type,
            "Updated service statement"
        );
    }
}

#[async_trait]
impl ContainerListener for StatementRecorder {
    async fn service_instantiated(&self, record: &ServiceRecord) -> Result<()> {
        self.apply(record).await;
        Ok(())
    }

    async fn service_discarded(&self, record: &ServiceRecord) -> Result<()> {
        self.apply(record).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RecordType, ServiceBeanInstance, ServiceElement};
    use crate::statement::{DurableStatementManager, TransientStatementManager};
    use chrono::Utc;
    use cybernode_id::ServiceBeanId;

    fn record(node: NodeId, element: &ServiceElement, n: u64) -> ServiceRecord {
        let instance = ServiceBeanInstance {
            id: ServiceBeanId::new(),
            element: element.key(),
            instance_id: n,
            host_address: "127.0.0.1".to_string(),
            node_id: node,
        };
        ServiceRecord::active(node, element.clone(), instance)
    }

    #[tokio::test]
    async fn test_durable_history_keeps_discarded_records() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(DurableStatementManager::open(dir.path(), None).await.unwrap());
        let node = NodeId::new();
        let recorder = StatementRecorder::new(node, manager.clone());
        let element = ServiceElement::new("shop", "cart", 2);

        let first = record(node, &element, 0);
        let second = record(node, &element, 1);
        recorder.service_instantiated(&first).await.unwrap();
        recorder.service_instantiated(&second).await.unwrap();

        let mut gone = first.clone();
        gone.discard(Utc::now());
        recorder.service_discarded(&gone).await.unwrap();

        let statement = manager.get(&element).await.unwrap();
        assert_eq!(statement.service_records().len(), 2);
        assert_eq!(
            statement
                .service_records_for(node, Some(RecordType::Active))
                .len(),
            1
        );
        assert_eq!(
            statement
                .service_records_for(node, Some(RecordType::Inactive))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_transient_forgets_fully_discarded_element() {
        let manager = Arc::new(TransientStatementManager::new());
        let node = NodeId::new();
        let recorder = StatementRecorder::new(node, manager.clone());
        let element = ServiceElement::new("shop", "cart", 1);

        let active = record(node, &element, 0);
        recorder.service_instantiated(&active).await.unwrap();
        assert!(manager.get(&element).await.is_some());

        let mut gone = active;
        gone.discard(Utc::now());
        recorder.service_discarded(&gone).await.unwrap();
        assert!(manager.get(&element).await.is_none());
    }
}
