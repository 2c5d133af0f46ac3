//! Service runtime interface and mock implementation.
//!
//! The runtime is the boundary to whatever actually loads and runs service
//! code (in-process, forked, containerised). The container only ever talks to
//! it through this trait:
//! - Starting/stopping an instance
//! - Advertising it and pushing configuration changes
//! - Health and utilization probes
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cybernode_id::ServiceBeanId;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::capacity::ResourceUtilization;
use crate::model::{ServiceBeanInstance, ServiceElement};

/// Handle to a started service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Runtime-specific handle (process id, container id, ...).
    pub handle_id: String,

    pub instance: ServiceBeanId,
}

/// A failed service load.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LoadError {
    pub message: String,
    /// Loading can never succeed for this element (missing artifact, bad
    /// class); as opposed to a local, transient failure.
    pub fatal: bool,
}

/// Service runtime interface.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Load and start an instance.
    async fn start(
        &self,
        element: &ServiceElement,
        instance: &ServiceBeanInstance,
    ) -> Result<ServiceHandle, LoadError>;

    /// Make a started instance discoverable.
    async fn advertise(&self, handle: &ServiceHandle) -> Result<()>;

    /// Apply changed element configuration to a running instance.
    async fn update(&self, handle: &ServiceHandle, element: &ServiceElement) -> Result<()>;

    /// Stop a running instance.
    async fn stop(&self, handle: &ServiceHandle) -> Result<()>;

    /// Check if an instance is healthy.
    async fn check_health(&self, handle: &ServiceHandle) -> Result<bool>;

    /// Current resource use of an instance.
    async fn utilization(&self, _handle: &ServiceHandle) -> ResourceUtilization {
        ResourceUtilization::default()
    }
}

/// Mock runtime for testing and development.
#[derive(Default)]
pub struct MockRuntime {
    /// Counter for generating handle ids.
    handle_counter: AtomicU64,

    /// Simulated load time.
    start_delay: Duration,

    /// When set, starts fail; the flag is the failure's `fatal` bit.
    fail_starts: Mutex<Option<bool>>,

    running: Mutex<HashSet<ServiceBeanId>>,
    unhealthy: Mutex<HashSet<ServiceBeanId>>,
    updates: Mutex<HashMap<ServiceBeanId, usize>>,

    starts: AtomicUsize,
    stops: AtomicUsize,
    advertised: AtomicUsize,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock runtime whose starts take `delay`.
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing(fatal: bool) -> Self {
        let runtime = Self::default();
        runtime.set_failing(Some(fatal));
        runtime
    }

    pub fn set_failing(&self, fatal: Option<bool>) {
        *self.fail_starts.lock() = fatal;
    }

    pub fn set_healthy(&self, instance: ServiceBeanId, healthy: bool) {
        let mut unhealthy = self.unhealthy.lock();
        if healthy {
            unhealthy.remove(&instance);
        } else {
            unhealthy.insert(instance);
        }
    }

    pub fn is_running(&self, instance: ServiceBeanId) -> bool {
        self.running.lock().contains(&instance)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn advertise_count(&self) -> usize {
        self.advertised.load(Ordering::SeqCst)
    }

    pub fn update_count(&self, instance: ServiceBeanId) -> usize {
        self.updates.lock().get(&instance).copied().unwrap_or(0)
    }

    fn next_handle_id(&self) -> String {
        let counter = self.handle_counter.fetch_add(1, Ordering::SeqCst);
        format!("mock_{:016x}", counter)
    }
}

#[async_trait]
impl ServiceRuntime for MockRuntime {
    async fn start(
        &self,
        element: &ServiceElement,
        instance: &ServiceBeanInstance,
    ) -> Result<ServiceHandle, LoadError> {
        self.starts.fetch_add(1, Ordering::SeqCst);

        info!(
            element = %element,
            instance = %instance.id,
            instance_id = instance.instance_id,
            "[MOCK] Starting service"
        );

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        if let Some(fatal) = *self.fail_starts.lock() {
            return Err(LoadError {
                message: "mock runtime configured to fail".to_string(),
                fatal,
            });
        }

        self.running.lock().insert(instance.id);
        Ok(ServiceHandle {
            handle_id: self.next_handle_id(),
            instance: instance.id,
        })
    }

    async fn advertise(&self, handle: &ServiceHandle) -> Result<()> {
        debug!(instance = %handle.instance, "[MOCK] Advertising service");
        self.advertised.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, handle: &ServiceHandle, element: &ServiceElement) -> Result<()> {
        debug!(instance = %handle.instance, element = %element, "[MOCK] Updating service");
        *self.updates.lock().entry(handle.instance).or_default() += 1;
        Ok(())
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<()> {
        info!(
            instance = %handle.instance,
            handle_id = %handle.handle_id,
            "[MOCK] Stopping service"
        );
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.lock().remove(&handle.instance);
        Ok(())
    }

    async fn check_health(&self, handle: &ServiceHandle) -> Result<bool> {
        Ok(!self.unhealthy.lock().contains(&handle.instance))
    }
}
