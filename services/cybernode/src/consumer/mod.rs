//! Lease registration engine.
//!
//! The consumer keeps this node registered with every provision manager it
//! knows about. Per manager it:
//! - Registers capacity and deployed services under a lease, retrying
//!   transient failures
//! - Renews the lease at half its remaining time on a scheduled task
//! - Reconnects after a transient renewal or update failure, and drops the
//!   connection when that fails too
//!
//! Discovery, container changes and capacity transitions all reach the
//! consumer as messages on its event loop.

mod http;
mod lease;
mod manager;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use cybernode_id::ProvisionManagerId;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capacity::{release_free_heap, CapacityEvent, NodeCapacity};
use crate::container::{ContainerListener, ServiceBeanContainer};
use crate::context::NodeContext;
use crate::error::RemoteError;
use crate::model::{DeployedService, ServiceRecord};
use crate::scheduler::Ticket;

pub use http::{classify_status, HttpProvisionManager};
pub use lease::ProvisionMonitorLease;
pub use manager::{
    MockProvisionManager, MockRegistration, MonitorProxy, MonitorUpdate, NodeDescriptor,
    ProvisionManager, Registration, ServiceFailure,
};

/// Floor for the wait between renewals.
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

/// Messages handled by the consumer loop.
pub enum ConsumerEvent {
    /// A provision manager became reachable.
    Discovered(Arc<dyn ProvisionManager>),
    /// A provision manager went away.
    Discarded(ProvisionManagerId),
    /// The set of deployed services changed.
    DeployedChanged,
}

impl fmt::Debug for ConsumerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovered(manager) => f.debug_tuple("Discovered").field(&manager.id()).finish(),
            Self::Discarded(id) => f.debug_tuple("Discarded").field(id).finish(),
            Self::DeployedChanged => f.write_str("DeployedChanged"),
        }
    }
}

/// Why a connection left the lease table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Renewal, reconnection or update failed.
    Failure,
    /// The manager was discovered gone.
    Discarded,
    /// The node released itself from provisioning.
    Released,
    Shutdown,
}

struct LeaseEntry {
    /// Stable for the life of the connection, across renewals and
    /// reconnections.
    connection: u64,
    manager: Arc<dyn ProvisionManager>,
    lease: Mutex<ProvisionMonitorLease>,
    renewal: Mutex<Option<Ticket>>,
    reconnecting: AtomicBool,
}

impl LeaseEntry {
    fn manager_id(&self) -> ProvisionManagerId {
        self.manager.id()
    }
}

/// Registers the node with provision managers and keeps it registered.
pub struct ServiceConsumer {
    ctx: NodeContext,
    container: Arc<ServiceBeanContainer>,
    leases: Mutex<HashMap<ProvisionManagerId, Arc<LeaseEntry>>>,
    known: Mutex<HashMap<ProvisionManagerId, Arc<dyn ProvisionManager>>>,
    registering: Mutex<HashSet<ProvisionManagerId>>,
    enlisted: AtomicBool,
    next_connection: AtomicU64,
}

impl ServiceConsumer {
    pub fn new(ctx: NodeContext, container: Arc<ServiceBeanContainer>) -> Arc<Self> {
        let enlisted = ctx.config().provision_enabled;
        Arc::new(Self {
            ctx,
            container,
            leases: Mutex::new(HashMap::new()),
            known: Mutex::new(HashMap::new()),
            registering: Mutex::new(HashSet::new()),
            enlisted: AtomicBool::new(enlisted),
            next_connection: AtomicU64::new(1),
        })
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Process consumer and capacity events until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ConsumerEvent>,
        mut capacity: mpsc::Receiver<CapacityEvent>,
    ) {
        let mut shutdown = self.ctx.shutdown_signal();
        info!(node_id = %self.ctx.node_id(), "Starting service consumer");

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(event) = capacity.recv() => self.handle_capacity_event(event).await,
                // The borrowed value must not outlive the branch; it is not Send.
                _ = async { shutdown.wait_for(|stopping| *stopping).await.is_ok() } => {
                    info!("Service consumer shutting down");
                    break;
                }
                else => break,
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: ConsumerEvent) {
        debug!(?event, "Consumer event");
        match event {
            ConsumerEvent::Discovered(manager) => {
                let consumer = Arc::clone(self);
                self.ctx.scheduler().spawn(async move {
                    consumer.discovered(manager).await;
                });
            }
            ConsumerEvent::Discarded(id) => {
                self.discarded(id).await;
            }
            ConsumerEvent::DeployedChanged => self.push_update().await,
        }
    }

    /// React to a capacity transition. A breach first returns free heap to
    /// the OS, then pushes the new capacity to every manager at once.
    pub async fn handle_capacity_event(self: &Arc<Self>, event: CapacityEvent) {
        if let CapacityEvent::Breached {
            resource,
            value,
            threshold,
        } = &event
        {
            warn!(
                resource = %resource,
                value,
                threshold,
                "Capacity breached, pushing out-of-band update"
            );
            release_free_heap();
        }
        self.push_update().await;
    }

    // =========================================================================
    // Discovery and registration
    // =========================================================================

    /// Track a manager and register with it unless provisioning is disabled.
    pub async fn discovered(self: &Arc<Self>, manager: Arc<dyn ProvisionManager>) {
        let id = manager.id();
        if self.known.lock().insert(id, Arc::clone(&manager)).is_none() {
            info!(manager = %id, "Discovered provision manager");
        }
        if !self.is_enlisted() {
            debug!(manager = %id, "Provisioning not enlisted, deferring registration");
            return;
        }
        // Failures are logged by `register`.
        let _ = self.register(manager).await;
    }

    /// Forget a manager and drop its connection.
    pub async fn discarded(&self, id: ProvisionManagerId) {
        self.known.lock().remove(&id);
        self.drop_connection(id, DropReason::Discarded).await;
    }

    /// Register with `manager` and start renewing the lease.
    ///
    /// Returns `Ok(false)` when the node is already registered (or
    /// registering) with it.
    pub async fn register(
        self: &Arc<Self>,
        manager: Arc<dyn ProvisionManager>,
    ) -> Result<bool, RemoteError> {
        let id = manager.id();
        if self.leases.lock().contains_key(&id) || !self.registering.lock().insert(id) {
            return Ok(false);
        }

        let result = self.connect(&manager).await;
        self.registering.lock().remove(&id);

        let lease = match result {
            Ok(lease) => lease,
            Err(e) => {
                warn!(manager = %id, kind = ?e.kind, error = %e.message, "Registration failed");
                return Err(e);
            }
        };

        let entry = Arc::new(LeaseEntry {
            connection: self.next_connection.fetch_add(1, Ordering::SeqCst),
            manager,
            lease: Mutex::new(lease.clone()),
            renewal: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
        });

        // Checked under the table lock: `release` and `shutdown` flip their
        // flag before snapshotting the table, so a lease is either seen by
        // them or never inserted.
        let inserted = {
            let mut leases = self.leases.lock();
            let provisioning = !self.ctx.is_shutting_down() && self.is_enlisted();
            if provisioning {
                leases.insert(id, Arc::clone(&entry));
            }
            provisioning
        };
        if !inserted {
            debug!(manager = %id, "No longer provisioning, cancelling fresh lease");
            cancel_quietly(entry.manager.as_ref(), &lease).await;
            return Ok(false);
        }
        self.start_renewal(&entry);

        info!(
            manager = %id,
            lease = %lease.id,
            expiration = %lease.expiration,
            "Registered with provision manager"
        );
        Ok(true)
    }

    fn registration(&self) -> Registration {
        Registration {
            node: self.descriptor(),
            capacity: self.ctx.capacity(),
            deployed: self.container.deployed_services(),
            service_limit: self.ctx.config().service_limit,
            lease_duration_secs: self.ctx.config().provisioner_lease_duration.as_secs(),
        }
    }

    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            node_id: self.ctx.node_id(),
            host_address: self.ctx.config().host_address.clone(),
        }
    }

    /// Run the registration handshake with retries.
    ///
    /// Makes at most `provisioner_retry_count` attempts. Only retryable
    /// failures are retried; a granted lease that has already expired is
    /// cancelled and counts as a retryable failure.
    pub async fn connect(
        &self,
        manager: &Arc<dyn ProvisionManager>,
    ) -> Result<ProvisionMonitorLease, RemoteError> {
        let config = self.ctx.config();
        let attempts = config.provisioner_retry_count.max(1);
        let mut last_error = RemoteError::retryable("no registration attempt made");

        for attempt in 1..=attempts {
            if self.ctx.is_shutting_down() {
                return Err(RemoteError::permanent("node is shutting down"));
            }

            match manager.register(&self.registration()).await {
                Ok(lease) if !lease.is_expired(Utc::now()) => return Ok(lease),
                Ok(lease) => {
                    warn!(
                        manager = %manager.id(),
                        lease = %lease.id,
                        expiration = %lease.expiration,
                        attempt,
                        "Granted lease already expired, cancelling"
                    );
                    cancel_quietly(manager.as_ref(), &lease).await;
                    last_error = RemoteError::retryable("granted lease already expired");
                }
                Err(e) if e.is_retryable() => {
                    warn!(manager = %manager.id(), attempt, attempts, error = %e.message, "Registration attempt failed");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }

            if attempt < attempts {
                tokio::time::sleep(config.provisioner_retry_delay).await;
            }
        }
        Err(last_error)
    }

    // =========================================================================
    // Renewal
    // =========================================================================

    fn start_renewal(self: &Arc<Self>, entry: &Arc<LeaseEntry>) {
        let consumer = Arc::clone(self);
        let task_entry = Arc::clone(entry);
        let ticket = self.ctx.scheduler().spawn(async move {
            consumer.renewal_loop(task_entry).await;
        });
        *entry.renewal.lock() = Some(ticket);
    }

    async fn renewal_loop(self: Arc<Self>, entry: Arc<LeaseEntry>) {
        let id = entry.manager_id();
        loop {
            let delay = entry
                .lease
                .lock()
                .renewal_delay(Utc::now())
                .max(MIN_RENEWAL_DELAY);
            tokio::time::sleep(delay).await;
            if !self.is_current(&entry) {
                debug!(manager = %id, "Connection dropped, stopping renewal");
                return;
            }

            let lease = entry.lease.lock().clone();
            match entry.manager.renew(&lease, lease.duration()).await {
                Ok(expiration) => {
                    entry.lease.lock().expiration = expiration;
                    debug!(manager = %id, lease = %lease.id, expiration = %expiration, "Renewed lease");
                }
                Err(e) if e.is_retryable() => {
                    warn!(manager = %id, lease = %lease.id, error = %e.message, "Lease renewal failed, reconnecting");
                    if !self.reconnect(&entry).await {
                        self.drop_entry(&entry, DropReason::Failure, true).await;
                        return;
                    }
                }
                Err(e) => {
                    warn!(manager = %id, lease = %lease.id, kind = ?e.kind, error = %e.message, "Lease renewal rejected");
                    self.drop_entry(&entry, DropReason::Failure, true).await;
                    return;
                }
            }
        }
    }

    /// Re-run registration for an existing connection, keeping its entry.
    async fn reconnect(&self, entry: &Arc<LeaseEntry>) -> bool {
        if entry.reconnecting.swap(true, Ordering::SeqCst) {
            debug!(manager = %entry.manager_id(), "Reconnect already in progress");
            return true;
        }
        let result = self.connect(&entry.manager).await;
        entry.reconnecting.store(false, Ordering::SeqCst);

        match result {
            Ok(lease) => {
                let superseded = {
                    let leases = self.leases.lock();
                    let current = leases
                        .get(&entry.manager_id())
                        .is_some_and(|current| Arc::ptr_eq(current, entry));
                    current.then(|| std::mem::replace(&mut *entry.lease.lock(), lease.clone()))
                };
                let Some(superseded) = superseded else {
                    cancel_quietly(entry.manager.as_ref(), &lease).await;
                    return false;
                };
                info!(
                    manager = %entry.manager_id(),
                    lease = %lease.id,
                    superseded = %superseded.id,
                    "Reconnected to provision manager"
                );
                cancel_quietly(entry.manager.as_ref(), &superseded).await;
                true
            }
            Err(e) => {
                warn!(manager = %entry.manager_id(), kind = ?e.kind, error = %e.message, "Reconnect failed");
                false
            }
        }
    }

    fn is_current(&self, entry: &Arc<LeaseEntry>) -> bool {
        self.leases
            .lock()
            .get(&entry.manager_id())
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    // =========================================================================
    // Dropping connections
    // =========================================================================

    /// Remove the connection to `id`. Returns false if there was none.
    pub async fn drop_connection(&self, id: ProvisionManagerId, reason: DropReason) -> bool {
        let Some(entry) = self.leases.lock().remove(&id) else {
            return false;
        };
        self.finish_drop(&entry, reason, false).await;
        true
    }

    /// Remove `entry` if it is still the current connection for its manager.
    async fn drop_entry(&self, entry: &Arc<LeaseEntry>, reason: DropReason, from_renewal: bool) -> bool {
        let removed = {
            let mut leases = self.leases.lock();
            let current = leases
                .get(&entry.manager_id())
                .is_some_and(|current| Arc::ptr_eq(current, entry));
            current && leases.remove(&entry.manager_id()).is_some()
        };
        if removed {
            self.finish_drop(entry, reason, from_renewal).await;
        }
        removed
    }

    async fn finish_drop(&self, entry: &Arc<LeaseEntry>, reason: DropReason, from_renewal: bool) {
        // The renewal task deregisters itself when it returns.
        let ticket = entry.renewal.lock().take();
        if let Some(ticket) = ticket {
            if !from_renewal {
                self.ctx.scheduler().cancel(ticket);
            }
        }

        let lease = entry.lease.lock().clone();
        cancel_quietly(entry.manager.as_ref(), &lease).await;
        info!(
            manager = %entry.manager_id(),
            lease = %lease.id,
            ?reason,
            "Dropped provision manager connection"
        );

        if reason == DropReason::Failure
            && self.ctx.config().service_termination_on_unregister
            && !self.ctx.is_shutting_down()
            && self.leases.lock().is_empty()
        {
            warn!("Lost every provision manager, terminating local services");
            self.container.terminate_services().await;
        }
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Push the current capacity and deployed services to every manager.
    pub async fn push_update(self: &Arc<Self>) {
        self.update_monitors(self.ctx.capacity(), self.container.deployed_services())
            .await;
    }

    /// Send `capacity` and `deployed` to every registered manager
    /// concurrently. A failed push is handled on its own task and never
    /// holds up the others.
    pub async fn update_monitors(
        self: &Arc<Self>,
        capacity: NodeCapacity,
        deployed: Vec<DeployedService>,
    ) {
        let entries: Vec<_> = self.leases.lock().values().cloned().collect();
        if entries.is_empty() {
            return;
        }

        let update = MonitorUpdate {
            node: self.descriptor(),
            capacity,
            deployed,
            service_limit: self.ctx.config().service_limit,
        };
        debug!(managers = entries.len(), deployed = update.deployed.len(), "Updating provision managers");

        let update = &update;
        let results = join_all(entries.into_iter().map(|entry| async move {
            let result = entry.manager.update(update).await;
            (entry, result)
        }))
        .await;

        for (entry, result) in results {
            let Err(error) = result else {
                continue;
            };
            warn!(manager = %entry.manager_id(), kind = ?error.kind, error = %error.message, "Update failed");
            let consumer = Arc::clone(self);
            self.ctx.scheduler().spawn(async move {
                consumer.recover(entry, error).await;
            });
        }
    }

    async fn recover(self: Arc<Self>, entry: Arc<LeaseEntry>, error: RemoteError) {
        if error.is_retryable() && self.reconnect(&entry).await {
            return;
        }
        self.drop_entry(&entry, DropReason::Failure, false).await;
    }

    // =========================================================================
    // Enlistment
    // =========================================================================

    pub fn is_enlisted(&self) -> bool {
        self.enlisted.load(Ordering::SeqCst)
    }

    /// Start provisioning: register with every known manager. Returns the
    /// number of new registrations.
    pub async fn enlist(self: &Arc<Self>) -> usize {
        self.enlisted.store(true, Ordering::SeqCst);
        let managers: Vec<_> = self.known.lock().values().cloned().collect();
        info!(managers = managers.len(), "Enlisting with provision managers");

        join_all(managers.into_iter().map(|m| self.register(m)))
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count()
    }

    /// Stop provisioning: drop every connection and optionally stop all
    /// local services.
    pub async fn release(&self, terminate_services: bool) {
        self.enlisted.store(false, Ordering::SeqCst);
        let ids: Vec<_> = self.leases.lock().keys().copied().collect();
        info!(managers = ids.len(), terminate_services, "Releasing from provision managers");
        for id in ids {
            self.drop_connection(id, DropReason::Released).await;
        }
        if terminate_services {
            self.container.terminate_services().await;
        }
    }

    /// Cancel every lease; called once the node is shutting down.
    pub async fn shutdown(&self) {
        self.enlisted.store(false, Ordering::SeqCst);
        let ids: Vec<_> = self.leases.lock().keys().copied().collect();
        for id in ids {
            self.drop_connection(id, DropReason::Shutdown).await;
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn is_registered(&self, id: ProvisionManagerId) -> bool {
        self.leases.lock().contains_key(&id)
    }

    pub fn registered_count(&self) -> usize {
        self.leases.lock().len()
    }

    pub fn known_count(&self) -> usize {
        self.known.lock().len()
    }

    /// Current lease with `id`, if connected.
    pub fn lease(&self, id: ProvisionManagerId) -> Option<ProvisionMonitorLease> {
        let entry = self.leases.lock().get(&id).cloned()?;
        let lease = entry.lease.lock().clone();
        Some(lease)
    }

    /// Identity of the connection to `id`; unchanged by renewals and
    /// reconnections.
    pub fn connection_id(&self, id: ProvisionManagerId) -> Option<u64> {
        self.leases.lock().get(&id).map(|entry| entry.connection)
    }
}

async fn cancel_quietly(manager: &dyn ProvisionManager, lease: &ProvisionMonitorLease) {
    if let Err(e) = manager.cancel(lease).await {
        debug!(manager = %manager.id(), lease = %lease.id, error = %e.message, "Ignoring lease cancel failure");
    }
}

/// Container listener that wakes the consumer loop when deployed services
/// change.
pub struct DeployedChangeNotifier {
    events: mpsc::Sender<ConsumerEvent>,
}

impl DeployedChangeNotifier {
    pub fn new(events: mpsc::Sender<ConsumerEvent>) -> Self {
        Self { events }
    }

    fn notify(&self) {
        if let Err(e) = self.events.try_send(ConsumerEvent::DeployedChanged) {
            debug!(error = %e, "Deployed-change notification dropped");
        }
    }
}

#[async_trait]
impl ContainerListener for DeployedChangeNotifier {
    async fn service_instantiated(&self, _record: &ServiceRecord) -> Result<()> {
        self.notify();
        Ok(())
    }

    async fn service_discarded(&self, _record: &ServiceRecord) -> Result<()> {
        self.notify();
        Ok(())
    }
}
