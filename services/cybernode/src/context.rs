//! Per-node context shared by every component.
//!
//! Holds what would otherwise be process-wide state: the configuration, the
//! shutdown flag, read access to the latest capacity snapshot and the task
//! scheduler. Each node built in a process gets its own context, so several
//! nodes can run side by side in tests.

use std::sync::Arc;

use cybernode_id::NodeId;
use tokio::sync::watch;
use tracing::info;

use crate::capacity::NodeCapacity;
use crate::config::Config;
use crate::scheduler::TaskScheduler;

struct Inner {
    config: Config,
    shutdown_tx: watch::Sender<bool>,
    capacity: watch::Receiver<NodeCapacity>,
    scheduler: TaskScheduler,
}

/// Cheaply clonable handle to the node's shared context.
#[derive(Clone)]
pub struct NodeContext {
    inner: Arc<Inner>,
}

impl NodeContext {
    pub fn new(config: Config, capacity: watch::Receiver<NodeCapacity>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                shutdown_tx,
                capacity,
                scheduler: TaskScheduler::new(),
            }),
        }
    }

    /// Context with a fixed capacity snapshot, for tests and tools.
    pub fn with_static_capacity(config: Config, capacity: NodeCapacity) -> Self {
        // A closed watch channel still serves its last value.
        let (_, rx) = watch::channel(capacity);
        Self::new(config, rx)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.config.node_id
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }

    /// Latest capacity snapshot.
    pub fn capacity(&self) -> NodeCapacity {
        self.inner.capacity.borrow().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Flip the shutdown flag. Returns false if shutdown had already begun.
    pub fn begin_shutdown(&self) -> bool {
        let started = self.inner.shutdown_tx.send_if_modified(|flag| {
            let changed = !*flag;
            *flag = true;
            changed
        });
        if started {
            info!(node_id = %self.node_id(), "Node entering shutdown");
        }
        started
    }

    /// Receiver that observes the shutdown flag.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }
}
