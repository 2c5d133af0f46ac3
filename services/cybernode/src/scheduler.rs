//! Ticket-based task scheduling.
//!
//! Every background job the agent runs (lease renewal, statement sweeps,
//! capacity sampling, health probes) is spawned through a [`TaskScheduler`]
//! and identified by a [`Ticket`]. A ticket cancels exactly the job it was
//! issued for, and `cancel_all` tears down everything on shutdown.
//!
//! Jobs sleep on `tokio::time`, so tests can run them under a paused clock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shortest period a repeating job may run at.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to one scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket-{}", self.0)
    }
}

#[derive(Default)]
struct Jobs {
    next: AtomicU64,
    running: Mutex<HashMap<Ticket, JoinHandle<()>>>,
}

/// Spawns and tracks cancelable background jobs.
#[derive(Clone, Default)]
pub struct TaskScheduler {
    jobs: Arc<Jobs>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` in the background.
    pub fn spawn<F>(&self, job: F) -> Ticket
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ticket = Ticket(self.jobs.next.fetch_add(1, Ordering::Relaxed));
        let jobs = Arc::clone(&self.jobs);

        // The job deregisters itself once done; the table lock is held across
        // spawn so the removal cannot run before the insert.
        let mut running = self.jobs.running.lock();
        let handle = tokio::spawn(async move {
            job.await;
            jobs.running.lock().remove(&ticket);
        });
        running.insert(ticket, handle);
        ticket
    }

    /// Run `job` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, job: F) -> Ticket
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            job.await;
        })
    }

    /// Run `job` every `period`, first after one full period. A zero period
    /// is raised to one millisecond.
    pub fn schedule_repeating<F, Fut>(&self, period: Duration, mut job: F) -> Ticket
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period < MIN_PERIOD {
            warn!(period_ns = period.as_nanos() as u64, "Repeating job period too short, clamping");
        }
        let period = period.max(MIN_PERIOD);
        self.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                job().await;
            }
        })
    }

    /// Cancel one job. Returns false if it already finished or was unknown.
    pub fn cancel(&self, ticket: Ticket) -> bool {
        match self.jobs.running.lock().remove(&ticket) {
            Some(handle) => {
                handle.abort();
                debug!(%ticket, "Cancelled scheduled job");
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding job.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.jobs.running.lock().drain().collect();
        debug!(count = drained.len(), "Cancelling all scheduled jobs");
        for (_, handle) in drained {
            handle.abort();
        }
    }

    pub fn is_scheduled(&self, ticket: Ticket) -> bool {
        self.jobs.running.lock().contains_key(&ticket)
    }

    pub fn active_count(&self) -> usize {
        self.jobs.running.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_once_runs_after_delay() {
        let scheduler = TaskScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let ticket = scheduler.schedule_once(Duration::from_secs(5), {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(scheduler.is_scheduled(ticket));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        tokio::task::yield_now().await;
        assert!(!scheduler.is_scheduled(ticket));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_until_cancelled() {
        let scheduler = TaskScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let ticket = scheduler.schedule_repeating(Duration::from_secs(10), {
            let hits = Arc::clone(&hits);
            move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        assert!(scheduler.cancel(ticket));
        assert!(!scheduler.cancel(ticket));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_still_runs() {
        let scheduler = TaskScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let ticket = scheduler.schedule_repeating(Duration::ZERO, {
            let hits = Arc::clone(&hits);
            move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(hits.load(Ordering::SeqCst) >= 3);
        assert!(scheduler.cancel(ticket));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let scheduler = TaskScheduler::new();
        for _ in 0..3 {
            scheduler.schedule_once(Duration::from_secs(60), async {});
        }
        assert_eq!(scheduler.active_count(), 3);
        scheduler.cancel_all();
        assert_eq!(scheduler.active_count(), 0);
    }
}
