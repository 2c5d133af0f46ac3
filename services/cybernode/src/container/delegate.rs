use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::capacity::ResourceUtilization;
use crate::consumer::MonitorProxy;
use crate::model::{DeployedService, ServiceBeanInstance, ServiceElement, ServiceRecord};
use crate::runtime::ServiceHandle;

/// Key of one activation in the container's live map. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationToken(pub(crate) u64);

impl fmt::Display for ActivationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "activation-{}", self.0)
    }
}

/// Lifecycle of one instance inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateState {
    Loading,
    Active,
    Terminating,
    Terminated,
}

/// Lifecycle events delivered to the sink handed to `activate`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Started(ServiceBeanInstance),
    Failed {
        instance: ServiceBeanInstance,
        reason: String,
    },
    Terminated(ServiceBeanInstance),
}

struct Lifecycle {
    state: DelegateState,
    handle: Option<ServiceHandle>,
    started_at: Option<DateTime<Utc>>,
    utilization: ResourceUtilization,
}

/// Container-side handle wrapping one instance.
pub struct ServiceBeanDelegate {
    token: ActivationToken,
    instance: ServiceBeanInstance,
    element: RwLock<ServiceElement>,
    monitor: RwLock<Option<Arc<MonitorProxy>>>,
    events: Option<mpsc::Sender<ServiceEvent>>,
    lifecycle: Mutex<Lifecycle>,
}

impl ServiceBeanDelegate {
    pub(crate) fn new(
        token: ActivationToken,
        element: ServiceElement,
        instance: ServiceBeanInstance,
        monitor: Option<Arc<MonitorProxy>>,
        events: Option<mpsc::Sender<ServiceEvent>>,
    ) -> Self {
        Self {
            token,
            instance,
            element: RwLock::new(element),
            monitor: RwLock::new(monitor),
            events,
            lifecycle: Mutex::new(Lifecycle {
                state: DelegateState::Loading,
                handle: None,
                started_at: None,
                utilization: ResourceUtilization::default(),
            }),
        }
    }

    pub fn token(&self) -> ActivationToken {
        self.token
    }

    pub fn instance(&self) -> &ServiceBeanInstance {
        &self.instance
    }

    pub fn element(&self) -> ServiceElement {
        self.element.read().clone()
    }

    pub(crate) fn set_element(&self, element: ServiceElement) {
        *self.element.write() = element;
    }

    pub fn monitor(&self) -> Option<Arc<MonitorProxy>> {
        self.monitor.read().clone()
    }

    pub(crate) fn set_monitor(&self, monitor: Arc<MonitorProxy>) {
        *self.monitor.write() = Some(monitor);
    }

    pub fn state(&self) -> DelegateState {
        self.lifecycle.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == DelegateState::Active
    }

    /// Handle of the running instance, only while active.
    pub fn handle(&self) -> Option<ServiceHandle> {
        let lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            DelegateState::Active => lifecycle.handle.clone(),
            _ => None,
        }
    }

    /// Loading finished. Returns false when termination was requested while
    /// the instance was loading; the caller then owns stopping `handle`.
    pub(crate) fn loaded(&self, handle: ServiceHandle) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != DelegateState::Loading {
            return false;
        }
        lifecycle.state = DelegateState::Active;
        lifecycle.handle = Some(handle);
        lifecycle.started_at = Some(Utc::now());
        true
    }

    /// Move to `Terminating`, returning the previous state and the handle to
    /// stop, if any. Already terminating delegates are left untouched.
    pub(crate) fn begin_termination(&self) -> (DelegateState, Option<ServiceHandle>) {
        let mut lifecycle = self.lifecycle.lock();
        let previous = lifecycle.state;
        match previous {
            DelegateState::Loading | DelegateState::Active => {
                lifecycle.state = DelegateState::Terminating;
                (previous, lifecycle.handle.take())
            }
            DelegateState::Terminating | DelegateState::Terminated => (previous, None),
        }
    }

    pub(crate) fn terminated(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = DelegateState::Terminated;
        lifecycle.handle = None;
    }

    pub fn utilization(&self) -> ResourceUtilization {
        self.lifecycle.lock().utilization.clone()
    }

    pub(crate) fn set_utilization(&self, utilization: ResourceUtilization) {
        self.lifecycle.lock().utilization = utilization;
    }

    /// Active record for this instance.
    pub fn service_record(&self) -> ServiceRecord {
        let (started_at, utilization) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.started_at, lifecycle.utilization.clone())
        };
        let mut record =
            ServiceRecord::active(self.instance.node_id, self.element(), self.instance.clone());
        if let Some(started_at) = started_at {
            record.started_at = started_at;
        }
        record.utilization = Some(utilization);
        record
    }

    /// Inactive record for this instance, discarded now.
    pub fn discarded_record(&self) -> ServiceRecord {
        let mut record = self.service_record();
        record.discard(Utc::now());
        record
    }

    pub fn deployed_service(&self) -> DeployedService {
        DeployedService {
            element: self.element(),
            instance: self.instance.clone(),
            utilization: self.utilization(),
        }
    }

    pub(crate) fn emit(&self, event: ServiceEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.try_send(event) {
                debug!(instance = %self.instance.id, error = %e, "Service event dropped");
            }
        }
    }
}
