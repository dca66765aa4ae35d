//! Central-queue policies: `eager` (FIFO) and `prio` (priority order).
//!
//! Every worker of the context pops from one shared queue and takes the
//! first job it can execute.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::queue::ReadyQueue;
use super::{can_execute, PolicyEnv, SchedulingPolicy};
use crate::runtime::error::Rejected;
use crate::runtime::task::Job;
use crate::runtime::worker::WorkerId;

#[derive(Debug)]
pub struct CentralPolicy {
    name: &'static str,
    queue: ReadyQueue,
    workers: RwLock<Vec<WorkerId>>,
}

impl CentralPolicy {
    /// First come, first served.
    pub fn eager() -> Self {
        Self {
            name: "eager",
            queue: ReadyQueue::new(false),
            workers: RwLock::new(Vec::new()),
        }
    }

    /// Highest priority first, FIFO within a priority.
    pub fn prio() -> Self {
        Self {
            name: "prio",
            queue: ReadyQueue::new(true),
            workers: RwLock::new(Vec::new()),
        }
    }
}

impl SchedulingPolicy for CentralPolicy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn add_workers(
        &self,
        workers: &[WorkerId],
        _env: &PolicyEnv<'_>,
    ) {
        let mut current = self.workers.write();
        for w in workers {
            if !current.contains(w) {
                current.push(*w);
            }
        }
    }

    fn remove_workers(
        &self,
        workers: &[WorkerId],
    ) -> Vec<Arc<Job>> {
        let mut current = self.workers.write();
        current.retain(|w| !workers.contains(w));
        if current.is_empty() {
            self.queue.drain()
        } else {
            Vec::new()
        }
    }

    fn push_task(
        &self,
        job: Arc<Job>,
        env: &PolicyEnv<'_>,
    ) -> Result<(), Rejected> {
        let workers = self.workers.read();
        let capable: Vec<WorkerId> = workers
            .iter()
            .copied()
            .filter(|w| env.worker(*w).map(|info| can_execute(&job, info)).unwrap_or(false))
            .collect();
        if capable.is_empty() {
            let reason = format!(
                "no worker of {} can run {}",
                self.name,
                job.codelet().map(|c| c.name()).unwrap_or("control task")
            );
            return Err(Rejected { job, reason });
        }
        trace!(job = %job.id(), policy = self.name, "queued");
        self.queue.push(job);
        for w in capable {
            env.wake(w);
        }
        Ok(())
    }

    fn pop_task(
        &self,
        worker: WorkerId,
        env: &PolicyEnv<'_>,
    ) -> Option<Arc<Job>> {
        let info = env.worker(worker)?;
        self.queue.pop_matching(|job| can_execute(job, info))
    }

    fn pop_every_task(&self) -> Vec<Arc<Job>> {
        self.queue.drain()
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}
