//! Per-element admission control for instantiation requests.
//!
//! Tracks requests that passed admission but have not resolved yet. The
//! per-element decision (count active and in-process, compare with the
//! element's planned count and per-machine cap, register) is one critical
//! section, so two concurrent requests for the same element never both pass
//! past the planned count.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::ProvisionError;
use crate::model::{ElementKey, ServiceElement};

/// Outcome of the per-element admission check.
#[derive(Debug)]
pub enum Admission {
    /// The request may proceed; the guard holds its in-process slot.
    Admitted(InProcessGuard),
    /// The element already has every instance it needs here.
    NotNeeded,
}

/// Set of admitted-but-unresolved requests, counted per element.
#[derive(Debug, Default)]
pub struct InProcess {
    counts: Mutex<HashMap<ElementKey, usize>>,
}

impl InProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a request for `element` may proceed.
    ///
    /// `active` reports how many instances of the element are active on the
    /// node; it is evaluated inside the critical section. A deployment that
    /// is already satisfied is a no-op even when the per-machine cap is also
    /// reached.
    pub fn admit(
        self: &Arc<Self>,
        element: &ServiceElement,
        active: impl FnOnce(&ElementKey) -> usize,
    ) -> Result<Admission, ProvisionError> {
        let key = element.key();
        let mut counts = self.counts.lock();

        let in_process = counts.get(&key).copied().unwrap_or(0);
        let active = active(&key);
        let total = active + in_process;

        if total >= element.planned as usize {
            debug!(
                element = %key,
                active,
                in_process,
                planned = element.planned,
                "Planned instances satisfied, skipping"
            );
            return Ok(Admission::NotNeeded);
        }

        if let Some(max) = element.max_per_machine {
            if total >= max as usize {
                return Err(ProvisionError::MaxPerMachineReached {
                    element: key,
                    total,
                    max,
                });
            }
        }

        *counts.entry(key.clone()).or_default() += 1;
        Ok(Admission::Admitted(InProcessGuard {
            set: Arc::clone(self),
            key,
        }))
    }

    /// In-process requests for one element.
    pub fn count(&self, element: &ElementKey) -> usize {
        self.counts.lock().get(element).copied().unwrap_or(0)
    }

    /// In-process requests across all elements.
    pub fn total(&self) -> usize {
        self.counts.lock().values().sum()
    }

    fn release(&self, key: &ElementKey) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                counts.remove(key);
            }
        }
    }
}

/// In-process slot for one admitted request, released on drop.
#[derive(Debug)]
pub struct InProcessGuard {
    set: Arc<InProcess>,
    key: ElementKey,
}

impl InProcessGuard {
    pub fn element(&self) -> &ElementKey {
        &self.key
    }
}

impl Drop for InProcessGuard {
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn admitted(result: Result<Admission, ProvisionError>) -> InProcessGuard {
        match result {
            Ok(Admission::Admitted(guard)) => guard,
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[test]
    fn test_guard_releases_slot() {
        let set = Arc::new(InProcess::new());
        let element = ServiceElement::new("shop", "cart", 2);

        let guard = admitted(set.admit(&element, |_| 0));
        assert_eq!(set.count(&element.key()), 1);
        assert_eq!(guard.element(), &element.key());

        drop(guard);
        assert_eq!(set.count(&element.key()), 0);
        assert_eq!(set.total(), 0);
    }

    #[test]
    fn test_in_process_counts_toward_planned() {
        let set = Arc::new(InProcess::new());
        let element = ServiceElement::new("shop", "cart", 2);

        let _a = admitted(set.admit(&element, |_| 0));
        let _b = admitted(set.admit(&element, |_| 0));
        assert!(matches!(
            set.admit(&element, |_| 0),
            Ok(Admission::NotNeeded)
        ));
        assert_eq!(set.total(), 2);
    }

    #[rstest]
    #[case::planned_satisfied_wins(2, Some(2), 2, true, false)]
    #[case::max_reached(5, Some(2), 2, false, true)]
    #[case::room_left(5, Some(3), 2, false, false)]
    #[case::unlimited(5, None, 4, false, false)]
    #[case::nothing_planned(0, None, 0, true, false)]
    fn test_admission_decisions(
        #[case] planned: u32,
        #[case] max: Option<u32>,
        #[case] active: usize,
        #[case] not_needed: bool,
        #[case] rejected: bool,
    ) {
        let set = Arc::new(InProcess::new());
        let mut element = ServiceElement::new("shop", "cart", planned);
        element.max_per_machine = max;

        match set.admit(&element, |_| active) {
            Ok(Admission::NotNeeded) => assert!(not_needed),
            Ok(Admission::Admitted(_)) => assert!(!not_needed && !rejected),
            Err(ProvisionError::MaxPerMachineReached { total, .. }) => {
                assert!(rejected);
                assert_eq!(total, active);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert_eq!(set.total(), 0);
    }

    #[test]
    fn test_elements_counted_separately() {
        let set = Arc::new(InProcess::new());
        let cart = ServiceElement::new("shop", "cart", 1);
        let search = ServiceElement::new("shop", "search", 1);

        let _a = admitted(set.admit(&cart, |_| 0));
        let _b = admitted(set.admit(&search, |_| 0));
        assert_eq!(set.count(&cart.key()), 1);
        assert_eq!(set.count(&search.key()), 1);
        assert_eq!(set.total(), 2);
    }
}
