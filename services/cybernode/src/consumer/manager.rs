use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cybernode_id::{LeaseId, NodeId, ProvisionManagerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::lease::ProvisionMonitorLease;
use crate::capacity::NodeCapacity;
use crate::error::{FailureKind, RemoteError};
use crate::model::{DeployedService, ServiceBeanInstance};

// =============================================================================
// Wire types
// =============================================================================

/// How orchestrators address this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub host_address: String,
}

/// Registration request: everything an orchestrator needs to place work here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub node: NodeDescriptor,
    pub capacity: NodeCapacity,
    pub deployed: Vec<DeployedService>,
    pub service_limit: usize,
    pub lease_duration_secs: u64,
}

/// Out-of-band update of capacity and deployed services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorUpdate {
    pub node: NodeDescriptor,
    pub capacity: NodeCapacity,
    pub deployed: Vec<DeployedService>,
    pub service_limit: usize,
}

/// Report that a service this orchestrator provisioned has failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceFailure {
    pub node_id: NodeId,
    pub instance: ServiceBeanInstance,
    pub reason: String,
}

// =============================================================================
// Provision manager interface
// =============================================================================

/// An orchestrator this node registers with.
///
/// Every failure is returned as a [`RemoteError`] already classified by the
/// implementation, so callers never inspect transport errors.
#[async_trait]
pub trait ProvisionManager: Send + Sync {
    fn id(&self) -> ProvisionManagerId;

    async fn register(
        &self,
        registration: &Registration,
    ) -> Result<ProvisionMonitorLease, RemoteError>;

    /// Extend a lease; returns the new expiration.
    async fn renew(
        &self,
        lease: &ProvisionMonitorLease,
        duration: Duration,
    ) -> Result<DateTime<Utc>, RemoteError>;

    async fn cancel(&self, lease: &ProvisionMonitorLease) -> Result<(), RemoteError>;

    async fn update(&self, update: &MonitorUpdate) -> Result<(), RemoteError>;

    async fn service_failed(&self, failure: &ServiceFailure) -> Result<(), RemoteError>;
}

/// Per-orchestrator wrapper handed to the instances it provisioned.
pub struct MonitorProxy {
    node_id: NodeId,
    manager: Arc<dyn ProvisionManager>,
}

impl MonitorProxy {
    pub fn new(node_id: NodeId, manager: Arc<dyn ProvisionManager>) -> Self {
        Self { node_id, manager }
    }

    pub fn manager_id(&self) -> ProvisionManagerId {
        self.manager.id()
    }

    pub fn manager(&self) -> &Arc<dyn ProvisionManager> {
        &self.manager
    }

    /// Tell the orchestrator an instance it provisioned has failed.
    pub async fn service_failed(
        &self,
        instance: &ServiceBeanInstance,
        reason: &str,
    ) -> Result<(), RemoteError> {
        info!(
            manager = %self.manager.id(),
            instance = %instance.id,
            reason,
            "Reporting service failure"
        );
        self.manager
            .service_failed(&ServiceFailure {
                node_id: self.node_id,
                instance: instance.clone(),
                reason: reason.to_string(),
            })
            .await
    }
}

// =============================================================================
// Mock
// =============================================================================

/// Scripted response of a [`MockProvisionManager`] registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockRegistration {
    Grant,
    /// Grant a lease that has already expired.
    Expired,
    Fail(FailureKind),
}

#[derive(Default)]
struct Script {
    register: VecDeque<MockRegistration>,
    renew: VecDeque<FailureKind>,
    renew_always: Option<FailureKind>,
    update: Option<FailureKind>,
}

/// In-memory provision manager for tests and development.
///
/// Calls succeed unless a failure has been scripted; every call is counted.
#[derive(Default)]
pub struct MockProvisionManager {
    id: ProvisionManagerId,
    script: Mutex<Script>,
    registrations: Mutex<Vec<Registration>>,
    updates: Mutex<Vec<MonitorUpdate>>,
    failures: Mutex<Vec<ServiceFailure>>,
    cancelled: Mutex<Vec<LeaseId>>,
    renewals: AtomicUsize,
    register_calls: AtomicUsize,
}

impl MockProvisionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses for the next registrations; once drained,
    /// registrations are granted.
    pub fn script_registrations(&self, responses: impl IntoIterator<Item = MockRegistration>) {
        self.script.lock().register.extend(responses);
    }

    /// Fail the next renewals with the given kinds.
    pub fn script_renewal_failures(&self, kinds: impl IntoIterator<Item = FailureKind>) {
        self.script.lock().renew.extend(kinds);
    }

    /// Fail every renewal from now on.
    pub fn fail_renewals(&self, kind: Option<FailureKind>) {
        self.script.lock().renew_always = kind;
    }

    pub fn fail_updates(&self, kind: Option<FailureKind>) {
        self.script.lock().update = kind;
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().clone()
    }

    pub fn updates(&self) -> Vec<MonitorUpdate> {
        self.updates.lock().clone()
    }

    pub fn failures(&self) -> Vec<ServiceFailure> {
        self.failures.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<LeaseId> {
        self.cancelled.lock().clone()
    }

    fn failure(kind: FailureKind, call: &str) -> RemoteError {
        RemoteError {
            kind,
            message: format!("mock {call} failure"),
        }
    }
}

#[async_trait]
impl ProvisionManager for MockProvisionManager {
    fn id(&self) -> ProvisionManagerId {
        self.id
    }

    async fn register(
        &self,
        registration: &Registration,
    ) -> Result<ProvisionMonitorLease, RemoteError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .script
            .lock()
            .register
            .pop_front()
            .unwrap_or(MockRegistration::Grant);
        debug!(manager = %self.id, ?response, "[MOCK] Registration");

        let now = Utc::now();
        let expiration = match response {
            MockRegistration::Grant => {
                now + chrono::Duration::seconds(registration.lease_duration_secs as i64)
            }
            MockRegistration::Expired => now - chrono::Duration::seconds(1),
            MockRegistration::Fail(kind) => return Err(Self::failure(kind, "register")),
        };

        self.registrations.lock().push(registration.clone());
        Ok(ProvisionMonitorLease {
            id: LeaseId::new(),
            manager: self.id,
            expiration,
            duration_secs: registration.lease_duration_secs,
        })
    }

    async fn renew(
        &self,
        lease: &ProvisionMonitorLease,
        duration: Duration,
    ) -> Result<DateTime<Utc>, RemoteError> {
        let failure = {
            let mut script = self.script.lock();
            script.renew.pop_front().or(script.renew_always)
        };
        if let Some(kind) = failure {
            return Err(Self::failure(kind, "renew"));
        }

        self.renewals.fetch_add(1, Ordering::SeqCst);
        debug!(manager = %self.id, lease = %lease.id, "[MOCK] Renewed lease");
        Ok(Utc::now() + chrono::Duration::seconds(duration.as_secs() as i64))
    }

    async fn cancel(&self, lease: &ProvisionMonitorLease) -> Result<(), RemoteError> {
        self.cancelled.lock().push(lease.id);
        Ok(())
    }

    async fn update(&self, update: &MonitorUpdate) -> Result<(), RemoteError> {
        if let Some(kind) = self.script.lock().update {
            return Err(Self::failure(kind, "update"));
        }
        self.updates.lock().push(update.clone());
        Ok(())
    }

    async fn service_failed(&self, failure: &ServiceFailure) -> Result<(), RemoteError> {
        self.failures.lock().push(failure.clone());
        Ok(())
    }
}
