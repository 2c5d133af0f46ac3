//! Service bean container.
//!
//! The container is the per-node registry of every instance that is loading,
//! running or being stopped. It owns:
//! - The live map from [`ActivationToken`] to [`ServiceBeanDelegate`]
//! - The [`NodeLoad`] snapshot other components read instead of the map
//! - Listener fan-out for instantiate/discard transitions
//!
//! The live map sits behind one mutex. Snapshots are copied under it and all
//! runtime calls and listener notifications happen after it is released.

mod delegate;
mod listener;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cybernode_id::ServiceBeanId;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::consumer::MonitorProxy;
use crate::context::NodeContext;
use crate::error::InstantiationError;
use crate::model::{DeployedService, ElementKey, ServiceBeanInstance, ServiceElement, ServiceRecord};
use crate::runtime::ServiceRuntime;

pub use delegate::{ActivationToken, DelegateState, ServiceBeanDelegate, ServiceEvent};
pub use listener::ContainerListener;

/// Read-only view of how loaded the node is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeLoad {
    /// Delegates in the live map, whatever their state.
    pub live: usize,
    /// Delegates still loading.
    pub activations_in_process: usize,
    /// Active instances per element.
    pub active: HashMap<ElementKey, usize>,
}

impl NodeLoad {
    pub fn active_count(&self, element: &ElementKey) -> usize {
        self.active.get(element).copied().unwrap_or(0)
    }

    fn from_live(live: &HashMap<ActivationToken, Arc<ServiceBeanDelegate>>) -> Self {
        let mut load = Self {
            live: live.len(),
            ..Self::default()
        };
        for delegate in live.values() {
            match delegate.state() {
                DelegateState::Loading => load.activations_in_process += 1,
                DelegateState::Active => {
                    *load
                        .active
                        .entry(delegate.instance().element.clone())
                        .or_default() += 1;
                }
                DelegateState::Terminating | DelegateState::Terminated => {}
            }
        }
        load
    }
}

type LiveMap = HashMap<ActivationToken, Arc<ServiceBeanDelegate>>;

/// Registry and lifecycle driver for the node's service instances.
pub struct ServiceBeanContainer {
    ctx: NodeContext,
    runtime: Arc<dyn ServiceRuntime>,
    live: Mutex<LiveMap>,
    next_token: AtomicU64,
    load_tx: watch::Sender<NodeLoad>,
    listeners: RwLock<Vec<Arc<dyn ContainerListener>>>,
    terminated: AtomicBool,
}

impl ServiceBeanContainer {
    pub fn new(ctx: NodeContext, runtime: Arc<dyn ServiceRuntime>) -> Self {
        let (load_tx, _) = watch::channel(NodeLoad::default());
        Self {
            ctx,
            runtime,
            live: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            load_tx,
            listeners: RwLock::new(Vec::new()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Register a listener; listeners are notified in registration order.
    pub fn add_listener(&self, listener: Arc<dyn ContainerListener>) {
        self.listeners.write().push(listener);
    }

    /// Subscribe to [`NodeLoad`] updates.
    pub fn load(&self) -> watch::Receiver<NodeLoad> {
        self.load_tx.subscribe()
    }

    /// Latest [`NodeLoad`].
    pub fn node_load(&self) -> NodeLoad {
        self.load_tx.borrow().clone()
    }

    fn publish_load(&self, live: &LiveMap) {
        self.load_tx.send_replace(NodeLoad::from_live(live));
    }

    // =========================================================================
    // Activation
    // =========================================================================

    /// Create and start an instance of `element`.
    ///
    /// The delegate is in the live map before loading starts, so a
    /// termination request that arrives mid-load is observed: the instance
    /// is stopped as soon as it finishes loading and the call fails.
    pub async fn activate(
        &self,
        element: &ServiceElement,
        monitor: Option<Arc<MonitorProxy>>,
        events: Option<mpsc::Sender<ServiceEvent>>,
    ) -> Result<ServiceBeanInstance, InstantiationError> {
        let key = element.key();
        if self.terminated.load(Ordering::SeqCst) {
            return Err(InstantiationError::retryable(key, "container is terminated"));
        }

        let delegate = {
            let mut live = self.live.lock();
            let instance_id = element
                .instance_id
                .unwrap_or_else(|| lowest_free_instance_id(&live, &key));
            let token = ActivationToken(self.next_token.fetch_add(1, Ordering::SeqCst));
            let instance = ServiceBeanInstance {
                id: ServiceBeanId::new(),
                element: key.clone(),
                instance_id,
                host_address: self.ctx.config().host_address.clone(),
                node_id: self.ctx.node_id(),
            };
            let delegate = Arc::new(ServiceBeanDelegate::new(
                token,
                element.clone(),
                instance,
                monitor,
                events,
            ));
            live.insert(token, Arc::clone(&delegate));
            self.publish_load(&live);
            delegate
        };

        let instance = delegate.instance().clone();
        info!(
            element = %key,
            instance = %instance.id,
            instance_id = instance.instance_id,
            token = %delegate.token(),
            "Activating service"
        );

        let handle = match self.runtime.start(element, &instance).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(element = %key, instance = %instance.id, error = %e, fatal = e.fatal, "Service failed to load");
                self.finish_discard(
                    &delegate,
                    ServiceEvent::Failed {
                        instance: instance.clone(),
                        reason: e.message.clone(),
                    },
                )
                .await;
                return Err(InstantiationError {
                    element: key,
                    message: e.message,
                    fatal: e.fatal,
                });
            }
        };

        if !delegate.loaded(handle.clone()) {
            info!(element = %key, instance = %instance.id, "Service terminated while loading");
            if let Err(e) = self.runtime.stop(&handle).await {
                warn!(instance = %instance.id, error = %e, "Failed to stop service");
            }
            self.finish_discard(
                &delegate,
                ServiceEvent::Failed {
                    instance: instance.clone(),
                    reason: "terminated while loading".to_string(),
                },
            )
            .await;
            return Err(InstantiationError::retryable(key, "terminated while loading"));
        }

        if element.auto_advertise {
            if let Err(e) = self.runtime.advertise(&handle).await {
                warn!(instance = %instance.id, error = %e, "Failed to advertise service");
            }
        }

        if !self.started(delegate.token()).await {
            return Err(InstantiationError::retryable(key, "terminated during activation"));
        }
        Ok(instance)
    }

    /// Push configuration changes to every live instance of each element.
    ///
    /// Instances that are not active are skipped. Returns the number of
    /// instances updated.
    pub async fn update(
        &self,
        elements: &[ServiceElement],
        monitor: Option<Arc<MonitorProxy>>,
    ) -> usize {
        let mut updated = 0;
        for element in elements {
            let key = element.key();
            let matching: Vec<_> = self
                .live
                .lock()
                .values()
                .filter(|d| d.instance().element == key)
                .cloned()
                .collect();

            for delegate in matching {
                let Some(handle) = delegate.handle() else {
                    warn!(
                        element = %key,
                        instance = %delegate.instance().id,
                        state = ?delegate.state(),
                        "Skipping update of inactive service"
                    );
                    continue;
                };
                delegate.set_element(element.clone());
                if let Some(monitor) = &monitor {
                    delegate.set_monitor(Arc::clone(monitor));
                }
                match self.runtime.update(&handle, element).await {
                    Ok(()) => updated += 1,
                    Err(e) => {
                        warn!(instance = %delegate.instance().id, error = %e, "Failed to update service")
                    }
                }
            }
        }
        updated
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    fn snapshot(&self) -> Vec<Arc<ServiceBeanDelegate>> {
        self.live.lock().values().cloned().collect()
    }

    fn active_snapshot(&self) -> Vec<Arc<ServiceBeanDelegate>> {
        self.live
            .lock()
            .values()
            .filter(|d| d.is_active())
            .cloned()
            .collect()
    }

    /// Records of every active instance.
    pub fn service_records(&self) -> Vec<ServiceRecord> {
        self.active_snapshot()
            .iter()
            .map(|d| d.service_record())
            .collect()
    }

    /// Instances of `element` that are loading or active.
    pub fn service_bean_instances(&self, element: &ServiceElement) -> Vec<ServiceBeanInstance> {
        let key = element.key();
        self.snapshot()
            .iter()
            .filter(|d| d.instance().element == key)
            .filter(|d| matches!(d.state(), DelegateState::Loading | DelegateState::Active))
            .map(|d| d.instance().clone())
            .collect()
    }

    /// Number of live delegates.
    pub fn service_counter(&self) -> usize {
        self.live.lock().len()
    }

    /// Number of delegates still loading.
    pub fn activation_in_process_count(&self) -> usize {
        self.live
            .lock()
            .values()
            .filter(|d| d.state() == DelegateState::Loading)
            .count()
    }

    /// Every active instance with its element and utilization.
    pub fn deployed_services(&self) -> Vec<DeployedService> {
        self.active_snapshot()
            .iter()
            .map(|d| d.deployed_service())
            .collect()
    }

    // =========================================================================
    // Lifecycle callbacks
    // =========================================================================

    /// The delegate behind `token` became active. Returns false when the
    /// token is no longer live.
    pub async fn started(&self, token: ActivationToken) -> bool {
        let delegate = {
            let live = self.live.lock();
            let Some(delegate) = live.get(&token).cloned() else {
                return false;
            };
            self.publish_load(&live);
            delegate
        };

        delegate.emit(ServiceEvent::Started(delegate.instance().clone()));
        let record = delegate.service_record();
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = listener.service_instantiated(&record).await {
                warn!(instance = %record.instance.id, error = %e, "Container listener failed");
            }
        }
        true
    }

    /// The delegate behind `token` is gone. Returns false when the token is
    /// no longer live.
    pub async fn discarded(&self, token: ActivationToken) -> bool {
        let Some(delegate) = self.live.lock().get(&token).cloned() else {
            return false;
        };
        self.finish_discard(&delegate, ServiceEvent::Terminated(delegate.instance().clone()))
            .await;
        true
    }

    /// Drop `token` from the live map.
    ///
    /// Delegates taken by a termination sweep have already left the map, so
    /// removing them here is a no-op.
    pub fn remove(&self, token: ActivationToken) -> bool {
        let mut live = self.live.lock();
        let removed = live.remove(&token).is_some();
        if removed {
            self.publish_load(&live);
        }
        removed
    }

    async fn finish_discard(&self, delegate: &Arc<ServiceBeanDelegate>, event: ServiceEvent) {
        delegate.terminated();
        self.remove(delegate.token());
        delegate.emit(event);

        let record = delegate.discarded_record();
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = listener.service_discarded(&record).await {
                warn!(instance = %record.instance.id, error = %e, "Container listener failed");
            }
        }
    }

    /// Stop one delegate that has already left the live map.
    async fn stop_delegate(&self, delegate: &Arc<ServiceBeanDelegate>) -> bool {
        let (previous, handle) = delegate.begin_termination();
        match previous {
            DelegateState::Loading => {
                debug!(instance = %delegate.instance().id, "Termination requested while loading");
                true
            }
            DelegateState::Active => {
                if let Some(handle) = handle {
                    if let Err(e) = self.runtime.stop(&handle).await {
                        warn!(instance = %delegate.instance().id, error = %e, "Failed to stop service");
                    }
                }
                self.finish_discard(delegate, ServiceEvent::Terminated(delegate.instance().clone()))
                    .await;
                true
            }
            DelegateState::Terminating | DelegateState::Terminated => false,
        }
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// Stop every live instance and clear the live map. Idempotent.
    pub async fn terminate_services(&self) -> usize {
        let delegates: Vec<_> = {
            let mut live = self.live.lock();
            let drained = live.drain().map(|(_, d)| d).collect();
            self.publish_load(&live);
            drained
        };
        if delegates.is_empty() {
            return 0;
        }

        info!(count = delegates.len(), "Terminating all services");
        let mut stopped = 0;
        for delegate in &delegates {
            if self.stop_delegate(delegate).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop everything and refuse further activations.
    pub async fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            info!(node_id = %self.ctx.node_id(), "Container terminating");
        }
        self.terminate_services().await;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Stop one instance by id. Returns false if it is not live.
    pub async fn terminate_instance(&self, id: ServiceBeanId) -> bool {
        let delegate = {
            let mut live = self.live.lock();
            let token = live
                .iter()
                .find(|(_, d)| d.instance().id == id)
                .map(|(token, _)| *token);
            let delegate = token.and_then(|token| live.remove(&token));
            if delegate.is_some() {
                self.publish_load(&live);
            }
            delegate
        };

        let Some(delegate) = delegate else {
            return false;
        };
        info!(instance = %id, element = %delegate.instance().element, "Terminating service");
        self.stop_delegate(&delegate).await
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Probe every active instance. Unhealthy instances are stopped,
    /// discarded and reported to the orchestrator that provisioned them.
    /// Returns the number of failed instances.
    pub async fn check_health(&self) -> usize {
        let mut failed = 0;
        for delegate in self.active_snapshot() {
            let Some(handle) = delegate.handle() else {
                continue;
            };
            let instance = delegate.instance().clone();

            let healthy = match self.runtime.check_health(&handle).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!(instance = %instance.id, error = %e, "Health check errored");
                    false
                }
            };
            if healthy {
                delegate.set_utilization(self.runtime.utilization(&handle).await);
                continue;
            }

            if !self.remove(delegate.token()) {
                continue;
            }
            let (previous, handle) = delegate.begin_termination();
            if previous != DelegateState::Active {
                continue;
            }
            failed += 1;
            warn!(instance = %instance.id, element = %instance.element, "Service failed health check");

            if let Some(handle) = handle {
                if let Err(e) = self.runtime.stop(&handle).await {
                    debug!(instance = %instance.id, error = %e, "Failed to stop unhealthy service");
                }
            }
            if let Some(monitor) = delegate.monitor() {
                if let Err(e) = monitor.service_failed(&instance, "health check failed").await {
                    warn!(
                        instance = %instance.id,
                        manager = %monitor.manager_id(),
                        error = %e,
                        "Failed to report service failure"
                    );
                }
            }
            self.finish_discard(
                &delegate,
                ServiceEvent::Failed {
                    instance,
                    reason: "health check failed".to_string(),
                },
            )
            .await;
        }
        failed
    }
}

fn lowest_free_instance_id(live: &LiveMap, element: &ElementKey) -> u64 {
    let used: BTreeSet<u64> = live
        .values()
        .filter(|d| &d.instance().element == element)
        .map(|d| d.instance().instance_id)
        .collect();
    (0..).find(|n| !used.contains(n)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::NodeCapacity;
    use crate::config::Config;
    use crate::runtime::MockRuntime;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<(bool, u64)>>,
    }

    #[async_trait]
    impl ContainerListener for RecordingListener {
        async fn service_instantiated(&self, record: &ServiceRecord) -> Result<()> {
            self.events.lock().push((true, record.instance.instance_id));
            Ok(())
        }

        async fn service_discarded(&self, record: &ServiceRecord) -> Result<()> {
            assert!(!record.is_active());
            self.events.lock().push((false, record.instance.instance_id));
            Ok(())
        }
    }

    fn container(runtime: Arc<MockRuntime>) -> (ServiceBeanContainer, Arc<RecordingListener>) {
        let ctx = NodeContext::with_static_capacity(Config::default(), NodeCapacity::default());
        let container = ServiceBeanContainer::new(ctx, runtime);
        let listener = Arc::new(RecordingListener::default());
        container.add_listener(listener.clone());
        (container, listener)
    }

    #[tokio::test]
    async fn test_activate_allocates_lowest_free_instance_ids() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, listener) = container(runtime.clone());
        let element = ServiceElement::new("shop", "cart", 3);

        let a = container.activate(&element, None, None).await.unwrap();
        let b = container.activate(&element, None, None).await.unwrap();
        assert_eq!((a.instance_id, b.instance_id), (0, 1));

        assert!(container.terminate_instance(a.id).await);
        let c = container.activate(&element, None, None).await.unwrap();
        assert_eq!(c.instance_id, 0);

        assert_eq!(container.service_counter(), 2);
        assert_eq!(container.node_load().active_count(&element.key()), 2);
        assert_eq!(runtime.advertise_count(), 3);
        assert_eq!(
            *listener.events.lock(),
            vec![(true, 0), (true, 1), (false, 0), (true, 0)]
        );
    }

    #[tokio::test]
    async fn test_failed_load_is_removed_and_discarded() {
        let runtime = Arc::new(MockRuntime::failing(true));
        let (container, listener) = container(runtime);
        let element = ServiceElement::new("shop", "cart", 1);
        let (tx, mut rx) = mpsc::channel(8);

        let err = container
            .activate(&element, None, Some(tx))
            .await
            .unwrap_err();
        assert!(err.fatal);
        assert_eq!(container.service_counter(), 0);
        assert_eq!(container.node_load(), NodeLoad::default());
        assert_eq!(*listener.events.lock(), vec![(false, 0)]);
        assert!(matches!(rx.recv().await, Some(ServiceEvent::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_termination_during_load_is_observed() {
        let runtime = Arc::new(MockRuntime::with_start_delay(Duration::from_secs(5)));
        let (container, listener) = container(runtime.clone());
        let container = Arc::new(container);
        let element = ServiceElement::new("shop", "cart", 1);

        let activation = tokio::spawn({
            let container = Arc::clone(&container);
            let element = element.clone();
            async move { container.activate(&element, None, None).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(container.activation_in_process_count(), 1);

        assert_eq!(container.terminate_services().await, 1);
        let result = activation.await.unwrap();
        assert!(result.is_err());
        assert_eq!(runtime.running_count(), 0);
        assert_eq!(container.service_counter(), 0);
        assert_eq!(*listener.events.lock(), vec![(false, 0)]);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_refuses_new_work() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, _) = container(runtime.clone());
        let element = ServiceElement::new("shop", "cart", 2);
        container.activate(&element, None, None).await.unwrap();
        container.activate(&element, None, None).await.unwrap();

        container.terminate().await;
        container.terminate().await;

        assert_eq!(runtime.stop_count(), 2);
        assert_eq!(container.service_counter(), 0);
        assert!(container.activate(&element, None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_update_pushes_config_to_active_instances() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, _) = container(runtime.clone());
        let element = ServiceElement::new("shop", "cart", 2);
        let a = container.activate(&element, None, None).await.unwrap();

        let mut changed = element.clone();
        changed.config.log_level = Some("debug".to_string());
        assert_eq!(container.update(&[changed], None).await, 1);
        assert_eq!(runtime.update_count(a.id), 1);

        let records = container.service_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].element.config.log_level.as_deref(), Some("debug"));
    }

    #[tokio::test]
    async fn test_unhealthy_instance_is_discarded() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, listener) = container(runtime.clone());
        let element = ServiceElement::new("shop", "cart", 2);
        let a = container.activate(&element, None, None).await.unwrap();
        let b = container.activate(&element, None, None).await.unwrap();

        runtime.set_healthy(b.id, false);
        assert_eq!(container.check_health().await, 1);

        let remaining = container.service_bean_instances(&element);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, a.id);
        assert!(!runtime.is_running(b.id));
        assert_eq!(listener.events.lock().last(), Some(&(false, 1)));
    }

    #[tokio::test]
    async fn test_snapshots_are_copies() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, _) = container(runtime);
        let element = ServiceElement::new("shop", "cart", 1);
        container.activate(&element, None, None).await.unwrap();

        let deployed = container.deployed_services();
        container.terminate_services().await;
        assert_eq!(deployed.len(), 1);
        assert!(container.deployed_services().is_empty());
    }
}
