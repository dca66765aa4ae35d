//! Scheduling policies and contexts
//!
//! A policy decides which worker runs a ready job and in what order. Every
//! scheduling context owns one policy instance over a subset of the workers;
//! the root context owns all of them.
//!
//! - [`eager`] - central FIFO (`eager`) or priority queue (`prio`)
//! - [`dmda`] - model-driven placement on per-worker queues (`dmda`, `dmdas`)
//! - [`context`] - context registry and nesting

pub mod context;
pub mod dmda;
pub mod eager;
pub mod queue;

pub use context::{ContextRegistry, SchedContext};
pub use dmda::{select_candidate, Candidate, DmdaPolicy, Estimates, FitnessWeights};
pub use eager::CentralPolicy;
pub use queue::{JobQueue, PriorityJobQueue, ReadyQueue};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::runtime::coherency::CoherencyEngine;
use crate::runtime::error::Rejected;
use crate::runtime::perfmodel::PerfModel;
use crate::runtime::task::Job;
use crate::runtime::worker::{WorkerId, WorkerInfo};
use crate::util::config::{PolicyKind, SchedulerConfig};

/// Scheduling context identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchedCtxId(pub usize);

impl fmt::Display for SchedCtxId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// The context that always exists and owns every worker.
pub const ROOT_CONTEXT: SchedCtxId = SchedCtxId(0);

/// What a policy may look at while deciding.
pub struct PolicyEnv<'a> {
    /// Every worker of the runtime, indexed by id.
    pub workers: &'a [Arc<WorkerInfo>],
    pub engine: &'a CoherencyEngine,
    pub model: &'a dyn PerfModel,
    /// Microseconds since runtime start.
    pub now_us: f64,
}

impl<'a> PolicyEnv<'a> {
    #[inline]
    pub fn worker(
        &self,
        id: WorkerId,
    ) -> Option<&'a Arc<WorkerInfo>> {
        self.workers.get(id.0)
    }

    /// Wake a worker after queueing work for it.
    #[inline]
    pub fn wake(
        &self,
        id: WorkerId,
    ) {
        if let Some(worker) = self.worker(id) {
            worker.wake();
        }
    }
}

/// Contract every scheduling policy satisfies.
///
/// `push_task` never blocks on data transfers; `pop_task` only returns jobs
/// the worker can execute.
pub trait SchedulingPolicy: Send + Sync + fmt::Debug {
    /// Policy name as used in the configuration.
    fn name(&self) -> &'static str;

    /// Start scheduling on `workers`.
    fn add_workers(
        &self,
        workers: &[WorkerId],
        env: &PolicyEnv<'_>,
    );

    /// Stop scheduling on `workers` and hand back the jobs queued for them.
    fn remove_workers(
        &self,
        workers: &[WorkerId],
    ) -> Vec<Arc<Job>>;

    /// Queue a ready job, or give it back when no worker can execute it.
    fn push_task(
        &self,
        job: Arc<Job>,
        env: &PolicyEnv<'_>,
    ) -> Result<(), Rejected>;

    /// Next job for `worker`.
    fn pop_task(
        &self,
        worker: WorkerId,
        env: &PolicyEnv<'_>,
    ) -> Option<Arc<Job>>;

    /// Take every queued job.
    fn pop_every_task(&self) -> Vec<Arc<Job>>;

    /// Called right before the codelet runs.
    fn pre_exec_hook(
        &self,
        job: &Job,
        worker: WorkerId,
        env: &PolicyEnv<'_>,
    ) {
        let _ = (job, worker, env);
    }

    /// Called once the job left the worker, executed or pushed back.
    fn post_exec_hook(
        &self,
        job: &Job,
        worker: WorkerId,
        env: &PolicyEnv<'_>,
    ) {
        let _ = (job, worker, env);
    }

    /// Jobs currently queued.
    fn queued(&self) -> usize;
}

/// Implementations of `job` that `worker` can run.
pub fn eligible_implementations(
    job: &Job,
    worker: &WorkerInfo,
) -> SmallVec<[usize; 3]> {
    match job.codelet() {
        Some(codelet) => codelet.eligible(worker.arch).map(|(i, _)| i).collect(),
        None => SmallVec::new(),
    }
}

/// Whether `worker` can run `job` at all.
#[inline]
pub fn can_execute(
    job: &Job,
    worker: &WorkerInfo,
) -> bool {
    job.codelet()
        .map(|codelet| codelet.can_run_on(worker.arch))
        .unwrap_or(false)
}

/// Instantiate the policy named by `kind`.
pub fn build_policy(
    kind: PolicyKind,
    config: &SchedulerConfig,
) -> Box<dyn SchedulingPolicy> {
    let weights = FitnessWeights {
        alpha: config.alpha,
        beta: config.beta,
        gamma: config.gamma,
    };
    match kind {
        PolicyKind::Eager => Box::new(CentralPolicy::eager()),
        PolicyKind::Prio => Box::new(CentralPolicy::prio()),
        PolicyKind::Dmda => Box::new(DmdaPolicy::new(weights, false, config.prefetch)),
        PolicyKind::Dmdas => Box::new(DmdaPolicy::new(weights, true, config.prefetch)),
    }
}

#[cfg(test)]
mod tests;
