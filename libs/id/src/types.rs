//! Identifier types used across the agent.

use crate::define_id;

// =============================================================================
// Nodes and orchestrators
// =============================================================================

define_id!(NodeId, "node");
define_id!(ProvisionManagerId, "pm");
define_id!(LeaseId, "lease");

// =============================================================================
// Service instances
// =============================================================================

define_id!(ServiceBeanId, "sb");

// =============================================================================
// Tests
// =============================================================================
