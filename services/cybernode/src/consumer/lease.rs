use std::time::Duration;

use chrono::{DateTime, Utc};
use cybernode_id::{LeaseId, ProvisionManagerId};
use serde::{Deserialize, Serialize};

/// Registration of this node with one provision manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionMonitorLease {
    pub id: LeaseId,
    /// Manager that granted the lease.
    pub manager: ProvisionManagerId,
    pub expiration: DateTime<Utc>,
    /// Duration requested at registration, reused for renewals.
    pub duration_secs: u64,
}

impl ProvisionMonitorLease {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Time left before the lease lapses; zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expiration - now).to_std().unwrap_or_default()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    /// How long to wait before renewing: half of what is left.
    pub fn renewal_delay(&self, now: DateTime<Utc>) -> Duration {
        self.remaining(now) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(expires_in: chrono::Duration) -> (ProvisionMonitorLease, DateTime<Utc>) {
        let now = Utc::now();
        let lease = ProvisionMonitorLease {
            id: LeaseId::new(),
            manager: ProvisionManagerId::new(),
            expiration: now + expires_in,
            duration_secs: 600,
        };
        (lease, now)
    }

    #[test]
    fn test_renewal_delay_is_half_remaining() {
        let (lease, now) = lease(chrono::Duration::seconds(600));
        assert_eq!(lease.renewal_delay(now), Duration::from_secs(300));
        assert!(!lease.is_expired(now));
    }

    #[test]
    fn test_expired_lease_has_no_remaining_time() {
        let (lease, now) = lease(chrono::Duration::seconds(-5));
        assert!(lease.is_expired(now));
        assert_eq!(lease.remaining(now), Duration::ZERO);
        assert_eq!(lease.renewal_delay(now), Duration::ZERO);
    }
}
