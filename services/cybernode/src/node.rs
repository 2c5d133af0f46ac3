//! The node: instantiation front door and component wiring.
//!
//! [`Cybernode`] builds the per-node context and the components that share
//! it, runs the background jobs (consumer loop, capacity sampling, health
//! probes, statement sweeps) and admits instantiation requests:
//!
//! 1. refuse while shutting down or for anything but an instantiate event
//! 2. per-element admission (planned count, then per-machine cap)
//! 3. node-wide service limit
//! 4. container activation, wrapped with the current utilization
//!
//! The in-process slot taken in step 2 is released on every path.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use cybernode_id::{ProvisionManagerId, ServiceBeanId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::admission::{Admission, InProcess};
use crate::capacity::{CapacityEvent, CapacityMonitor, NodeCapacity};
use crate::config::Config;
use crate::consumer::{
    ConsumerEvent, DeployedChangeNotifier, HttpProvisionManager, MonitorProxy, ProvisionManager,
    ServiceConsumer,
};
use crate::container::{ServiceBeanContainer, ServiceEvent};
use crate::context::NodeContext;
use crate::error::ProvisionError;
use crate::model::{DeployedService, ServiceElement};
use crate::runtime::ServiceRuntime;
use crate::statement::{
    DurableStatementManager, ServiceStatementManager, StatementRecorder,
    TransientStatementManager,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Kind of provision event an orchestrator sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionEventKind {
    Instantiate,
    Update,
    Redeploy,
}

impl ProvisionEventKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Instantiate => "instantiate",
            Self::Update => "update",
            Self::Redeploy => "redeploy",
        }
    }
}

/// A request to run one instance of an element on this node.
pub struct InstantiationRequest {
    pub event_kind: ProvisionEventKind,
    pub element: ServiceElement,
    /// Orchestrator that sent the request; failures of the instance are
    /// reported back to it.
    pub orchestrator: Option<Arc<dyn ProvisionManager>>,
    pub events: Option<mpsc::Sender<ServiceEvent>>,
}

impl InstantiationRequest {
    pub fn new(element: ServiceElement) -> Self {
        Self {
            event_kind: ProvisionEventKind::Instantiate,
            element,
            orchestrator: None,
            events: None,
        }
    }

    pub fn from_orchestrator(mut self, orchestrator: Arc<dyn ProvisionManager>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }
}

/// Result of an admitted instantiation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstantiationOutcome {
    Deployed(DeployedService),
    /// The element already has every instance it needs; nothing was done.
    NotNeeded,
}

/// Receivers handed to the consumer loop when the node starts.
struct PendingLoops {
    consumer_events: mpsc::Receiver<ConsumerEvent>,
    capacity_events: mpsc::Receiver<CapacityEvent>,
}

/// A compute node: admits instantiation requests and keeps itself
/// registered with provision managers.
pub struct Cybernode {
    ctx: NodeContext,
    container: Arc<ServiceBeanContainer>,
    consumer: Arc<ServiceConsumer>,
    statements: Arc<dyn ServiceStatementManager>,
    durable: Option<Arc<DurableStatementManager>>,
    capacity: Option<Arc<CapacityMonitor>>,
    in_process: Arc<InProcess>,
    monitors: Mutex<HashMap<ProvisionManagerId, Arc<MonitorProxy>>>,
    /// Managers reached by URL, from configuration or instantiate calls.
    endpoints: Mutex<HashMap<String, Arc<dyn ProvisionManager>>>,
    consumer_tx: mpsc::Sender<ConsumerEvent>,
    pending: Mutex<Option<PendingLoops>>,
}

impl Cybernode {
    /// Build a node that samples the host for capacity.
    pub async fn new(config: Config, runtime: Arc<dyn ServiceRuntime>) -> Result<Arc<Self>> {
        let config = config.normalized();
        let (capacity_tx, capacity_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (monitor, capacity_watch) =
            CapacityMonitor::new(config.memory_high_threshold, capacity_tx);
        let ctx = NodeContext::new(config, capacity_watch);
        Self::assemble(ctx, runtime, Some(Arc::new(monitor)), capacity_rx).await
    }

    /// Build a node with a fixed capacity snapshot and no host sampling.
    pub async fn with_static_capacity(
        config: Config,
        capacity: NodeCapacity,
        runtime: Arc<dyn ServiceRuntime>,
    ) -> Result<Arc<Self>> {
        let (_, capacity_rx) = mpsc::channel(1);
        let ctx = NodeContext::with_static_capacity(config.normalized(), capacity);
        Self::assemble(ctx, runtime, None, capacity_rx).await
    }

    async fn assemble(
        ctx: NodeContext,
        runtime: Arc<dyn ServiceRuntime>,
        capacity: Option<Arc<CapacityMonitor>>,
        capacity_events: mpsc::Receiver<CapacityEvent>,
    ) -> Result<Arc<Self>> {
        let config = ctx.config();

        let durable = match &config.record_dir {
            Some(dir) => Some(Arc::new(
                DurableStatementManager::open(dir, config.record_retention())
                    .await
                    .with_context(|| format!("opening statement directory {}", dir.display()))?,
            )),
            None => None,
        };
        let statements: Arc<dyn ServiceStatementManager> = match &durable {
            Some(durable) => durable.clone(),
            None => Arc::new(TransientStatementManager::new()),
        };

        let (consumer_tx, consumer_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let container = Arc::new(ServiceBeanContainer::new(ctx.clone(), runtime));
        container.add_listener(Arc::new(StatementRecorder::new(
            ctx.node_id(),
            Arc::clone(&statements),
        )));
        container.add_listener(Arc::new(DeployedChangeNotifier::new(consumer_tx.clone())));
        let consumer = ServiceConsumer::new(ctx.clone(), Arc::clone(&container));

        Ok(Arc::new(Self {
            ctx,
            container,
            consumer,
            statements,
            durable,
            capacity,
            in_process: Arc::new(InProcess::new()),
            monitors: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            consumer_tx,
            pending: Mutex::new(Some(PendingLoops {
                consumer_events,
                capacity_events,
            })),
        }))
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn container(&self) -> &Arc<ServiceBeanContainer> {
        &self.container
    }

    pub fn consumer(&self) -> &Arc<ServiceConsumer> {
        &self.consumer
    }

    pub fn statements(&self) -> &Arc<dyn ServiceStatementManager> {
        &self.statements
    }

    /// In-process requests for `element`.
    pub fn in_process_count(&self, element: &ServiceElement) -> usize {
        self.in_process.count(&element.key())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start background jobs and announce configured provision managers.
    /// Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(pending) = self.pending.lock().take() else {
            return Ok(());
        };
        let config = self.ctx.config();
        let scheduler = self.ctx.scheduler();

        scheduler.spawn(
            Arc::clone(&self.consumer).run(pending.consumer_events, pending.capacity_events),
        );

        if let Some(monitor) = &self.capacity {
            let monitor = Arc::clone(monitor);
            scheduler.schedule_repeating(config.capacity_interval, move || {
                let monitor = Arc::clone(&monitor);
                async move { monitor.sample() }
            });
        }

        let container = Arc::clone(&self.container);
        scheduler.schedule_repeating(config.health_check_interval, move || {
            let container = Arc::clone(&container);
            async move {
                let failed = container.check_health().await;
                if failed > 0 {
                    warn!(failed, "Health check discarded services");
                }
            }
        });

        if let Some(durable) = &self.durable {
            durable.start_sweeper(scheduler);
        }

        for url in &config.provision_managers {
            let manager = self.manager_for_url(url)?;
            self.announce(manager).await;
        }

        info!(
            node_id = %self.ctx.node_id(),
            service_limit = config.service_limit,
            provision_enabled = config.provision_enabled,
            managers = config.provision_managers.len(),
            "Cybernode started"
        );
        Ok(())
    }

    /// Hand a discovered provision manager to the consumer.
    pub async fn announce(&self, manager: Arc<dyn ProvisionManager>) {
        if let Err(e) = self
            .consumer_tx
            .send(ConsumerEvent::Discovered(manager))
            .await
        {
            warn!(error = %e, "Consumer loop is gone, dropping discovery");
        }
    }

    /// Provision manager reachable at `url`, created on first use.
    pub fn manager_for_url(&self, url: &str) -> Result<Arc<dyn ProvisionManager>> {
        let mut endpoints = self.endpoints.lock();
        if let Some(manager) = endpoints.get(url) {
            return Ok(Arc::clone(manager));
        }
        let manager: Arc<dyn ProvisionManager> = Arc::new(
            HttpProvisionManager::new(url)
                .with_context(|| format!("building client for provision manager {url}"))?,
        );
        endpoints.insert(url.to_string(), Arc::clone(&manager));
        Ok(manager)
    }

    /// Start provisioning with every known manager.
    pub async fn enlist(&self) -> usize {
        self.consumer.enlist().await
    }

    /// Stop provisioning, optionally stopping every local service.
    pub async fn release(&self, terminate_services: bool) {
        self.consumer.release(terminate_services).await;
    }

    /// Stop everything this node runs. Only the first call does work.
    pub async fn shutdown(&self) {
        if !self.ctx.begin_shutdown() {
            return;
        }
        self.consumer.shutdown().await;
        self.container.terminate().await;
        self.statements.terminate().await;
        self.ctx.scheduler().cancel_all();
        info!(node_id = %self.ctx.node_id(), "Cybernode stopped");
    }

    // =========================================================================
    // Instantiation
    // =========================================================================

    /// Admit and run one instance of the requested element.
    pub async fn instantiate(
        &self,
        request: InstantiationRequest,
    ) -> Result<InstantiationOutcome, ProvisionError> {
        if self.ctx.is_shutting_down() {
            return Err(ProvisionError::ShuttingDown);
        }
        if request.event_kind != ProvisionEventKind::Instantiate {
            return Err(ProvisionError::UnknownEvent(
                request.event_kind.as_str().to_string(),
            ));
        }

        let element = request.element;
        let load = self.container.load();
        let _slot = match self
            .in_process
            .admit(&element, |key| load.borrow().active_count(key))?
        {
            Admission::Admitted(slot) => slot,
            Admission::NotNeeded => return Ok(InstantiationOutcome::NotNeeded),
        };

        // Node-wide limit, checked after the per-element slot is taken.
        let node_load = self.container.node_load();
        let limit = self.ctx.config().service_limit;
        let total = self
            .in_process
            .total()
            .saturating_sub(node_load.activations_in_process)
            + node_load.live;
        if total > limit {
            debug!(element = %element, total, limit, "Service limit reached");
            return Err(ProvisionError::ServiceLimitReached { total, limit });
        }

        let (monitor, created) = match &request.orchestrator {
            Some(manager) => {
                let (monitor, created) = self.monitor_for(manager);
                (Some(monitor), created)
            }
            None => (None, false),
        };

        let instance = match self
            .container
            .activate(&element, monitor.clone(), request.events)
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                if let (Some(monitor), true) = (&monitor, created) {
                    self.discard_monitor(monitor);
                }
                return Err(e.into());
            }
        };

        if self.ctx.is_shutting_down() {
            info!(instance = %instance.id, "Node shut down during activation, terminating instance");
            self.container.terminate_instance(instance.id).await;
            return Err(ProvisionError::ShuttingDown);
        }

        info!(
            element = %element,
            instance = %instance.id,
            instance_id = instance.instance_id,
            "Service instantiated"
        );
        Ok(InstantiationOutcome::Deployed(DeployedService {
            element,
            instance,
            utilization: self.ctx.capacity().utilization(),
        }))
    }

    /// Stop one instance at an orchestrator's request.
    pub async fn terminate_instance(&self, id: ServiceBeanId) -> bool {
        self.container.terminate_instance(id).await
    }

    pub fn deployed_services(&self) -> Vec<DeployedService> {
        self.container.deployed_services()
    }

    fn monitor_for(&self, manager: &Arc<dyn ProvisionManager>) -> (Arc<MonitorProxy>, bool) {
        let mut monitors = self.monitors.lock();
        if let Some(monitor) = monitors.get(&manager.id()) {
            return (Arc::clone(monitor), false);
        }
        let monitor = Arc::new(MonitorProxy::new(self.ctx.node_id(), Arc::clone(manager)));
        monitors.insert(manager.id(), Arc::clone(&monitor));
        (monitor, true)
    }

    fn discard_monitor(&self, monitor: &Arc<MonitorProxy>) {
        let mut monitors = self.monitors.lock();
        let id = monitor.manager_id();
        if monitors
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, monitor))
        {
            monitors.remove(&id);
            debug!(manager = %id, "Discarded monitor proxy of failed activation");
        }
    }

    /// Monitor proxies currently held, one per orchestrator.
    pub fn monitor_count(&self) -> usize {
        self.monitors.lock().len()
    }
}
