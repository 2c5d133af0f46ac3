//! Error taxonomy for instantiation and orchestrator calls.
//!
//! Every failure that crosses the orchestrator boundary tells the caller
//! whether trying again (here later, or on another node) can help.

use thiserror::Error;

use crate::model::ElementKey;

/// Why a service instance could not be created.
#[derive(Debug, Clone, Error)]
#[error("failed to instantiate {element}: {message}")]
pub struct InstantiationError {
    pub element: ElementKey,
    pub message: String,
    /// The element cannot be instantiated anywhere; orchestrators should
    /// stop trying rather than pick another node.
    pub fatal: bool,
}

impl InstantiationError {
    pub fn retryable(element: ElementKey, message: impl Into<String>) -> Self {
        Self {
            element,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(element: ElementKey, message: impl Into<String>) -> Self {
        Self {
            element,
            message: message.into(),
            fatal: true,
        }
    }
}

/// Failures returned by the instantiation front door.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    /// The node is shutting down and accepts no new work.
    #[error("node is shutting down")]
    ShuttingDown,

    /// The request was not an instantiation request.
    #[error("unknown provision event: {0}")]
    UnknownEvent(String),

    /// This node already runs the per-machine maximum of the element.
    #[error("max per machine reached for {element}: {total} of {max}")]
    MaxPerMachineReached {
        element: ElementKey,
        total: usize,
        max: u32,
    },

    /// The node as a whole is at its service limit.
    #[error("service limit reached: {total} of {limit}")]
    ServiceLimitReached { total: usize, limit: usize },

    #[error(transparent)]
    Instantiation(#[from] InstantiationError),
}

impl ProvisionError {
    /// Whether the orchestrator may retry the request (here later or on
    /// another node).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MaxPerMachineReached { .. } | Self::ServiceLimitReached { .. } => true,
            Self::Instantiation(e) => !e.fatal,
            Self::ShuttingDown | Self::UnknownEvent(_) => false,
        }
    }

    /// Short stable code for wire responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ShuttingDown => "shutting_down",
            Self::UnknownEvent(_) => "unknown_event",
            Self::MaxPerMachineReached { .. } => "max_per_machine_reached",
            Self::ServiceLimitReached { .. } => "service_limit_reached",
            Self::Instantiation(e) if e.fatal => "instantiation_failed_fatal",
            Self::Instantiation(_) => "instantiation_failed",
        }
    }
}

/// How a failed orchestrator call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Indefinite failure (network, overload); trying again may succeed.
    Retryable,
    /// Security failure; abort without retrying.
    Fatal,
    /// The orchestrator rejected the call for good (unknown lease, bad
    /// request).
    Permanent,
}

/// A failed call to an orchestrator, classified where it happened.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} orchestrator failure: {message}")]
pub struct RemoteError {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ElementKey {
        ElementKey {
            opstring_name: "shop".to_string(),
            name: "cart".to_string(),
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(ProvisionError::ServiceLimitReached { total: 5, limit: 5 }.is_retryable());
        assert!(ProvisionError::MaxPerMachineReached {
            element: key(),
            total: 1,
            max: 1
        }
        .is_retryable());
        assert!(!ProvisionError::ShuttingDown.is_retryable());
        assert!(!ProvisionError::UnknownEvent("update".to_string()).is_retryable());
        assert!(ProvisionError::from(InstantiationError::retryable(key(), "boom")).is_retryable());
        assert!(!ProvisionError::from(InstantiationError::fatal(key(), "boom")).is_retryable());
    }

    #[test]
    fn test_remote_error_kinds() {
        assert!(RemoteError::retryable("timeout").is_retryable());
        assert!(!RemoteError::fatal("denied").is_retryable());
        assert!(!RemoteError::permanent("gone").is_retryable());
    }
}
