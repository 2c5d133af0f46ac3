//! Service descriptors, instance identities and placement records.
//!
//! These types cross every seam of the agent: orchestrators send
//! [`ServiceElement`]s, the container hands out [`ServiceBeanInstance`]s and
//! the statement managers persist [`ServiceStatement`]s built from
//! [`ServiceRecord`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use cybernode_id::{NodeId, ServiceBeanId};
use serde::{Deserialize, Serialize};

use crate::capacity::ResourceUtilization;

// =============================================================================
// Service elements
// =============================================================================

/// How an orchestrator places instances of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionType {
    /// Placed on any node with capacity, up to the planned count.
    Dynamic,
    /// Placed on every node that qualifies.
    Fixed,
    /// Managed outside the orchestrator; never instantiated here.
    External,
}

/// A service-level threshold watched by a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaThreshold {
    pub id: String,
    pub low: f64,
    pub high: f64,
}

/// Per-element configuration that may change while instances run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub locators: Vec<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub sla: Vec<SlaThreshold>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Descriptor of a deployable service.
///
/// Identity is the pair `(opstring_name, name)`; every other field is
/// descriptive. Two elements that name the same service in the same
/// deployment compare equal even if their planned counts or configuration
/// differ, which is what admission counting relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceElement {
    /// Service name.
    pub name: String,

    /// Name of the owning deployment (OperationalString).
    pub opstring_name: String,

    /// Number of instances the deployment wants.
    pub planned: u32,

    /// Cap on instances per node; `None` is unlimited.
    #[serde(default)]
    pub max_per_machine: Option<u32>,

    pub provision_type: ProvisionType,

    /// Run the service in its own process.
    #[serde(default)]
    pub fork: bool,

    /// Advertise the service once it has started.
    #[serde(default = "default_auto_advertise")]
    pub auto_advertise: bool,

    /// Instance number chosen by the orchestrator. When absent the node
    /// picks the lowest number not in use locally.
    #[serde(default)]
    pub instance_id: Option<u64>,

    #[serde(default)]
    pub config: ServiceConfig,
}

fn default_auto_advertise() -> bool {
    true
}

impl ServiceElement {
    /// Create a dynamic element with default configuration.
    pub fn new(opstring_name: impl Into<String>, name: impl Into<String>, planned: u32) -> Self {
        Self {
            name: name.into(),
            opstring_name: opstring_name.into(),
            planned,
            max_per_machine: None,
            provision_type: ProvisionType::Dynamic,
            fork: false,
            auto_advertise: true,
            instance_id: None,
            config: ServiceConfig::default(),
        }
    }

    pub fn with_max_per_machine(mut self, max: u32) -> Self {
        self.max_per_machine = Some(max);
        self
    }

    pub fn key(&self) -> ElementKey {
        ElementKey {
            opstring_name: self.opstring_name.clone(),
            name: self.name.clone(),
        }
    }
}

impl PartialEq for ServiceElement {
    fn eq(&self, other: &Self) -> bool {
        self.opstring_name == other.opstring_name && self.name == other.name
    }
}

impl Eq for ServiceElement {}

impl Hash for ServiceElement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.opstring_name.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for ServiceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.opstring_name, self.name)
    }
}

/// Owned identity of a [`ServiceElement`], used as a map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementKey {
    pub opstring_name: String,
    pub name: String,
}

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.opstring_name, self.name)
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Identity of one running service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBeanInstance {
    pub id: ServiceBeanId,
    pub element: ElementKey,
    /// Instance number within the element.
    pub instance_id: u64,
    pub host_address: String,
    pub node_id: NodeId,
}

/// An instance paired with its element and latest utilization, as reported
/// to orchestrators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployedService {
    pub element: ServiceElement,
    pub instance: ServiceBeanInstance,
    pub utilization: ResourceUtilization,
}

// =============================================================================
// Records and statements
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Active,
    Inactive,
}

/// "This node ran (or is running) instance N of element E."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub node_id: NodeId,
    pub instance: ServiceBeanInstance,
    pub element: ServiceElement,
    pub record_type: RecordType,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub discarded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub utilization: Option<ResourceUtilization>,
}

impl ServiceRecord {
    pub fn active(node_id: NodeId, element: ServiceElement, instance: ServiceBeanInstance) -> Self {
        Self {
            node_id,
            instance,
            element,
            record_type: RecordType::Active,
            started_at: Utc::now(),
            discarded_at: None,
            utilization: None,
        }
    }

    /// Mark the record historical.
    pub fn discard(&mut self, at: DateTime<Utc>) {
        self.record_type = RecordType::Inactive;
        self.discarded_at = Some(at);
    }

    pub fn is_active(&self) -> bool {
        self.record_type == RecordType::Active
    }
}

/// Placement history of one element.
///
/// Records are keyed by the node that recorded them and the instance they
/// describe; putting a record for an existing key replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatement {
    pub element: ServiceElement,
    records: Vec<ServiceRecord>,
}

impl ServiceStatement {
    pub fn new(element: ServiceElement) -> Self {
        Self {
            element,
            records: Vec::new(),
        }
    }

    /// Insert or replace the record `recorded_by` holds for the instance.
    pub fn put_service_record(&mut self, recorded_by: NodeId, mut record: ServiceRecord) {
        record.node_id = recorded_by;
        match self
            .records
            .iter_mut()
            .find(|r| r.node_id == recorded_by && r.instance.id == record.instance.id)
        {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    pub fn service_records(&self) -> &[ServiceRecord] {
        &self.records
    }

    /// Records one node holds, optionally filtered by type.
    pub fn service_records_for(
        &self,
        node_id: NodeId,
        record_type: Option<RecordType>,
    ) -> Vec<ServiceRecord> {
        self.records
            .iter()
            .filter(|r| r.node_id == node_id)
            .filter(|r| record_type.map_or(true, |t| r.record_type == t))
            .cloned()
            .collect()
    }

    pub fn has_active_service_records(&self) -> bool {
        self.records.iter().any(ServiceRecord::is_active)
    }
}
