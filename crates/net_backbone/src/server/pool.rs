//! The fixed pool of workers that accepted connections report into.

use crate::config::AssignmentPolicy;
use crate::error::ServerError;
use crate::manager::Manager;
use crate::queue::MessageQueue;
use crate::worker::Worker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
    policy: AssignmentPolicy,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Creates `count` workers. Their threads start on first assignment.
    pub(crate) fn new(name: &str, count: usize, policy: AssignmentPolicy) -> Self {
        let workers = (0..count.max(1))
            .map(|i| Worker::new(format!("{name}-worker-{i}")))
            .collect();
        Self {
            workers,
            policy,
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn add_manager(&self, manager: Arc<dyn Manager>) {
        for worker in &self.workers {
            worker.add_manager(manager.clone());
        }
    }

    /// Picks a worker for a new connection and returns its queue.
    pub(crate) fn assign(&self) -> Result<Arc<MessageQueue>, ServerError> {
        let worker = match self.policy {
            AssignmentPolicy::RoundRobin => {
                let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
                &self.workers[index]
            }
            AssignmentPolicy::LeastBusy => self
                .workers
                .iter()
                .min_by_key(|worker| worker.assignment_count())
                .ok_or_else(|| ServerError::Internal("worker pool is empty".to_string()))?,
        };

        worker.start()?;
        debug!(worker = worker.name(), "connection assigned");
        Ok(worker.message_queue())
    }

    pub(crate) fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
    }

    pub(crate) fn join(&self) {
        for worker in &self.workers {
            worker.join();
        }
    }

    #[cfg(test)]
    pub(crate) fn workers(&self) -> &[Worker] {
        &self.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_every_worker() {
        let pool = WorkerPool::new("rr", 3, AssignmentPolicy::RoundRobin);
        let picks: Vec<_> = (0..6).map(|_| pool.assign().unwrap()).collect();

        assert!(Arc::ptr_eq(&picks[0], &picks[3]));
        assert!(Arc::ptr_eq(&picks[1], &picks[4]));
        assert!(!Arc::ptr_eq(&picks[0], &picks[1]));
        assert!(!Arc::ptr_eq(&picks[1], &picks[2]));

        pool.shutdown();
        pool.join();
    }

    #[test]
    fn least_busy_prefers_the_emptiest_queue() {
        let pool = WorkerPool::new("lb", 2, AssignmentPolicy::LeastBusy);
        let busy = pool.workers()[0].message_queue();
        let _holders: Vec<_> = (0..3).map(|_| Arc::downgrade(&busy)).collect();

        let picked = pool.assign().unwrap();
        assert!(Arc::ptr_eq(&picked, &pool.workers()[1].message_queue()));

        pool.shutdown();
        pool.join();
    }

    #[test]
    fn workers_start_lazily() {
        let pool = WorkerPool::new("lazy", 2, AssignmentPolicy::RoundRobin);
        assert!(pool.workers().iter().all(|worker| !worker.is_running()));

        pool.assign().unwrap();
        assert!(pool.workers()[0].is_running());
        assert!(!pool.workers()[1].is_running());

        pool.shutdown();
        pool.join();
    }
}
