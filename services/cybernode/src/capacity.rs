//! Node capacity snapshots and the monitor that produces them.
//!
//! The monitor samples host resources on a schedule, publishes each
//! [`NodeCapacity`] through a `watch` channel and raises [`CapacityEvent`]s
//! when a measured resource crosses its high threshold. It never reacts to
//! a breach itself; the consumer loop that owns orchestrator connections
//! does.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Name of the memory gauge in [`NodeCapacity::measured`].
pub const MEMORY: &str = "memory";

/// One measured resource and the level at which it counts as breached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredResource {
    pub name: String,
    /// Utilization, 0.0 - 1.0.
    pub value: f64,
    pub high_threshold: f64,
}

impl MeasuredResource {
    pub fn is_breached(&self) -> bool {
        self.value > self.high_threshold
    }
}

/// Utilization snapshot attached to deployed services and capacity reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    /// Highest utilization across all measured resources.
    pub utilization: f64,
    pub measured: Vec<MeasuredResource>,
}

impl ResourceUtilization {
    pub fn from_measured(measured: Vec<MeasuredResource>) -> Self {
        let utilization = measured.iter().map(|m| m.value).fold(0.0, f64::max);
        Self {
            utilization,
            measured,
        }
    }
}

/// A qualitative attribute of the host: installed software, OS, arch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapability {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Snapshot of what this node can offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub cpu_cores: i32,
    pub total_memory_bytes: i64,
    pub available_memory_bytes: i64,
    pub measured: Vec<MeasuredResource>,
    pub capabilities: Vec<PlatformCapability>,
    pub sampled_at: DateTime<Utc>,
}

impl NodeCapacity {
    /// Build a snapshot from raw host resources.
    pub fn from_resources(resources: &SystemResources, memory_high_threshold: f64) -> Self {
        let memory_used = if resources.total_memory_bytes > 0 {
            1.0 - resources.available_memory_bytes as f64 / resources.total_memory_bytes as f64
        } else {
            0.0
        };

        Self {
            cpu_cores: resources.cpu_cores,
            total_memory_bytes: resources.total_memory_bytes,
            available_memory_bytes: resources.available_memory_bytes,
            measured: vec![MeasuredResource {
                name: MEMORY.to_string(),
                value: memory_used.clamp(0.0, 1.0),
                high_threshold: memory_high_threshold,
            }],
            capabilities: host_capabilities(),
            sampled_at: Utc::now(),
        }
    }

    pub fn utilization(&self) -> ResourceUtilization {
        ResourceUtilization::from_measured(self.measured.clone())
    }

    pub fn breached(&self) -> impl Iterator<Item = &MeasuredResource> {
        self.measured.iter().filter(|m| m.is_breached())
    }
}

impl Default for NodeCapacity {
    fn default() -> Self {
        Self {
            cpu_cores: 0,
            total_memory_bytes: 0,
            available_memory_bytes: 0,
            measured: Vec::new(),
            capabilities: host_capabilities(),
            sampled_at: Utc::now(),
        }
    }
}

fn host_capabilities() -> Vec<PlatformCapability> {
    vec![
        PlatformCapability {
            name: "os".to_string(),
            version: Some(std::env::consts::OS.to_string()),
        },
        PlatformCapability {
            name: "arch".to_string(),
            version: Some(std::env::consts::ARCH.to_string()),
        },
    ]
}

// =============================================================================
// Monitor
// =============================================================================

/// Capacity transitions delivered to the consumer loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CapacityEvent {
    /// A new snapshot was published.
    Changed,
    /// A resource rose above its high threshold.
    Breached {
        resource: String,
        value: f64,
        threshold: f64,
    },
    /// A previously breached resource fell back below its threshold.
    Cleared { resource: String },
}

/// Samples host resources and publishes capacity snapshots.
pub struct CapacityMonitor {
    capacity_tx: watch::Sender<NodeCapacity>,
    events: mpsc::Sender<CapacityEvent>,
    memory_high_threshold: f64,
    breached: Mutex<HashSet<String>>,
}

impl CapacityMonitor {
    /// Create a monitor seeded with one sample of the host.
    pub fn new(
        memory_high_threshold: f64,
        events: mpsc::Sender<CapacityEvent>,
    ) -> (Self, watch::Receiver<NodeCapacity>) {
        let initial = NodeCapacity::from_resources(&SystemResources::measure(), memory_high_threshold);
        let (capacity_tx, capacity_rx) = watch::channel(initial);
        let monitor = Self {
            capacity_tx,
            events,
            memory_high_threshold,
            breached: Mutex::new(HashSet::new()),
        };
        (monitor, capacity_rx)
    }

    /// Measure the host and publish the result.
    pub fn sample(&self) {
        self.publish(NodeCapacity::from_resources(
            &SystemResources::measure(),
            self.memory_high_threshold,
        ));
    }

    /// Publish a snapshot and emit threshold transitions for it.
    pub fn publish(&self, capacity: NodeCapacity) {
        let mut transitions = Vec::new();
        {
            let mut breached = self.breached.lock();
            for resource in &capacity.measured {
                let was = breached.contains(&resource.name);
                match (was, resource.is_breached()) {
                    (false, true) => {
                        breached.insert(resource.name.clone());
                        transitions.push(CapacityEvent::Breached {
                            resource: resource.name.clone(),
                            value: resource.value,
                            threshold: resource.high_threshold,
                        });
                    }
                    (true, false) => {
                        breached.remove(&resource.name);
                        transitions.push(CapacityEvent::Cleared {
                            resource: resource.name.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }

        debug!(
            available_memory_bytes = capacity.available_memory_bytes,
            cpu_cores = capacity.cpu_cores,
            "Publishing node capacity"
        );
        self.capacity_tx.send_replace(capacity);

        for event in transitions {
            match &event {
                CapacityEvent::Breached {
                    resource,
                    value,
                    threshold,
                } => warn!(resource = %resource, value, threshold, "Capacity threshold breached"),
                CapacityEvent::Cleared { resource } => {
                    info!(resource = %resource, "Capacity threshold cleared")
                }
                CapacityEvent::Changed => {}
            }
            self.emit(event);
        }
        self.emit(CapacityEvent::Changed);
    }

    fn emit(&self, event: CapacityEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "Capacity event dropped");
        }
    }
}

/// Ask the allocator to hand free heap pages back to the OS.
pub fn release_free_heap() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        let released = unsafe { libc::malloc_trim(0) };
        debug!(released = released != 0, "Trimmed process heap");
    }
}

// =============================================================================
// Host sampling
// =============================================================================

/// Raw host resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    pub cpu_cores: i32,
    pub total_memory_bytes: i64,
    pub available_memory_bytes: i64,
}

impl SystemResources {
    /// Sample the host, falling back to page counts when `/proc/meminfo`
    /// is unavailable or unreadable.
    pub fn measure() -> Self {
        let cpu_cores = online_cpus();
        Self::read_proc_meminfo(cpu_cores).unwrap_or_else(|| Self::from_page_counts(cpu_cores))
    }

    fn read_proc_meminfo(cpu_cores: i32) -> Option<Self> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        let content = std::fs::read_to_string("/proc/meminfo").ok()?;
        Self::from_meminfo(cpu_cores, &content)
    }

    /// Build from `/proc/meminfo` text. Kernels without `MemAvailable` get
    /// free memory plus buffers and page cache instead. `None` when the
    /// total is missing.
    pub fn from_meminfo(cpu_cores: i32, content: &str) -> Option<Self> {
        let fields: HashMap<&str, i64> = content
            .lines()
            .filter_map(|line| {
                let (key, rest) = line.split_once(':')?;
                let kib = rest.split_whitespace().next()?.parse::<i64>().ok()?;
                Some((key.trim(), kib.saturating_mul(1024)))
            })
            .collect();

        let total_memory_bytes = fields.get("MemTotal").copied().filter(|total| *total > 0)?;
        let available_memory_bytes = match fields.get("MemAvailable") {
            Some(available) => *available,
            None => ["MemFree", "Buffers", "Cached"]
                .iter()
                .filter_map(|key| fields.get(key))
                .sum(),
        };
        Some(Self {
            cpu_cores,
            total_memory_bytes,
            available_memory_bytes,
        })
    }

    /// Physical page counts carry no availability figure; half is assumed.
    fn from_page_counts(cpu_cores: i32) -> Self {
        let mut total_memory_bytes: i64 = 16 << 30;
        #[cfg(unix)]
        {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
            if page_size > 0 && pages > 0 {
                total_memory_bytes = (page_size as i64).saturating_mul(pages as i64);
            }
        }
        Self {
            cpu_cores,
            total_memory_bytes,
            available_memory_bytes: total_memory_bytes / 2,
        }
    }
}

fn online_cpus() -> i32 {
    #[cfg(unix)]
    {
        let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if online > 0 {
            return online as i32;
        }
    }
    std::thread::available_parallelism().map_or(1, |n| n.get() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(total: i64, available: i64) -> SystemResources {
        SystemResources {
            cpu_cores: 4,
            total_memory_bytes: total,
            available_memory_bytes: available,
        }
    }

    #[test]
    fn test_measure_resources() {
        let resources = SystemResources::measure();
        assert!(resources.cpu_cores > 0);
        assert!(resources.total_memory_bytes > 0);
    }

    #[test]
    fn test_resources_from_meminfo() {
        let sample = "MemTotal:       16384000 kB\nMemFree:         1234567 kB\nMemAvailable:    8000000 kB\n";
        let resources = SystemResources::from_meminfo(8, sample).unwrap();
        assert_eq!(resources.cpu_cores, 8);
        assert_eq!(resources.total_memory_bytes, 16384000 * 1024);
        assert_eq!(resources.available_memory_bytes, 8000000 * 1024);
    }

    #[test]
    fn test_meminfo_without_available_uses_cache() {
        let sample = "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 200 kB\n";
        let resources = SystemResources::from_meminfo(1, sample).unwrap();
        assert_eq!(resources.available_memory_bytes, 350 * 1024);
    }

    #[test]
    fn test_meminfo_without_total_is_rejected() {
        assert!(SystemResources::from_meminfo(1, "MemFree: 100 kB\n").is_none());
        assert!(SystemResources::from_meminfo(1, "MemTotal: 0 kB\n").is_none());
    }

    #[test]
    fn test_capacity_memory_gauge() {
        let capacity = NodeCapacity::from_resources(&resources(1000, 250), 0.9);
        let memory = &capacity.measured[0];
        assert_eq!(memory.name, MEMORY);
        assert!((memory.value - 0.75).abs() < 1e-9);
        assert!(!memory.is_breached());
        assert_eq!(capacity.breached().count(), 0);
    }

    #[tokio::test]
    async fn test_monitor_emits_breach_once_then_clear() {
        let (tx, mut rx) = mpsc::channel(16);
        let (monitor, capacity_rx) = CapacityMonitor::new(0.9, tx);

        monitor.publish(NodeCapacity::from_resources(&resources(1000, 50), 0.9));
        monitor.publish(NodeCapacity::from_resources(&resources(1000, 40), 0.9));
        monitor.publish(NodeCapacity::from_resources(&resources(1000, 500), 0.9));

        assert_eq!(capacity_rx.borrow().available_memory_bytes, 500);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        let breaches = events
            .iter()
            .filter(|e| matches!(e, CapacityEvent::Breached { .. }))
            .count();
        let clears = events
            .iter()
            .filter(|e| matches!(e, CapacityEvent::Cleared { .. }))
            .count();
        let changes = events
            .iter()
            .filter(|e| matches!(e, CapacityEvent::Changed))
            .count();
        assert_eq!(breaches, 1);
        assert_eq!(clears, 1);
        assert_eq!(changes, 3);
    }
}
