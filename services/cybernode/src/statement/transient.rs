use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::ServiceStatementManager;
use crate::model::{ElementKey, ServiceElement, ServiceStatement};

/// In-memory statement manager.
///
/// Only statements with at least one active record are kept, so memory stays
/// bounded by what is currently deployed.
#[derive(Default)]
pub struct TransientStatementManager {
    statements: RwLock<HashMap<ElementKey, ServiceStatement>>,
}

impl TransientStatementManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceStatementManager for TransientStatementManager {
    async fn get_all(&self) -> Vec<ServiceStatement> {
        self.statements.read().await.values().cloned().collect()
    }

    async fn get(&self, element: &ServiceElement) -> Option<ServiceStatement> {
        self.statements.read().await.get(&element.key()).cloned()
    }

    async fn record(&self, statement: &ServiceStatement) {
        let key = statement.element.key();
        let mut statements = self.statements.write().await;
        if statement.has_active_service_records() {
            statements.insert(key, statement.clone());
        } else if statements.remove(&key).is_some() {
            debug!(element = %key, "Dropped statement without active records");
        }
    }

    async fn terminate(&self) {
        self.statements.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceBeanInstance, ServiceRecord};
    use chrono::Utc;
    use cybernode_id::{NodeId, ServiceBeanId};

    fn statement_with_record(active: bool) -> (ServiceElement, ServiceStatement) {
        let node = NodeId::new();
        let element = ServiceElement::new("shop", "cart", 1);
        let instance = ServiceBeanInstance {
            id: ServiceBeanId::new(),
            element: element.key(),
            instance_id: 0,
            host_address: "127.0.0.1".to_string(),
            node_id: node,
        };
        let mut record = ServiceRecord::active(node, element.clone(), instance);
        if !active {
            record.discard(Utc::now());
        }
        let mut statement = ServiceStatement::new(element.clone());
        statement.put_service_record(node, record);
        (element, statement)
    }

    #[tokio::test]
    async fn test_record_and_get_roundtrip() {
        let manager = TransientStatementManager::new();
        let (element, statement) = statement_with_record(true);

        manager.record(&statement).await;

        let fetched = manager.get(&element).await.unwrap();
        assert_eq!(fetched.service_records(), statement.service_records());
        assert_eq!(manager.get_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_statement_removes_entry() {
        let manager = TransientStatementManager::new();
        let (element, active) = statement_with_record(true);
        manager.record(&active).await;

        let mut inactive = active.clone();
        let mut record = inactive.service_records()[0].clone();
        record.discard(Utc::now());
        inactive.put_service_record(record.node_id, record);
        manager.record(&inactive).await;

        assert!(manager.get(&element).await.is_none());
        assert!(manager.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_statement_never_stored() {
        let manager = TransientStatementManager::new();
        let (element, statement) = statement_with_record(false);
        manager.record(&statement).await;
        assert!(manager.get(&element).await.is_none());
    }
}
