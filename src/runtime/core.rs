//! Shared runtime state
//!
//! [`RuntimeCore`] is the one object every subsystem reaches the others
//! through: the application thread submitting jobs, the worker threads, and
//! the coherency callbacks resolving queued accesses. It owns the submission
//! path (dependency wiring), the readiness path (pushing to a context's
//! policy, falling back to parent contexts) and the completion path
//! (release, callback, successors).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::runtime::coherency::CoherencyEngine;
use crate::runtime::error::{Rejected, Result, RuntimeError};
use crate::runtime::memory::MemoryNodes;
use crate::runtime::perfmodel::PerfModel;
use crate::runtime::scheduler::{can_execute, ContextRegistry, PolicyEnv, SchedContext, ROOT_CONTEXT};
use crate::runtime::stats::RuntimeStats;
use crate::runtime::task::deps::{add_dependency, finish};
use crate::runtime::task::{Job, JobHandle, JobId, JobOutcome, JobState};
use crate::runtime::worker::{WorkerId, WorkerInfo};
use crate::util::config::RuntimeConfig;

/// What an acquisition does once its dependencies are satisfied.
pub(crate) type Continuation = Box<dyn FnOnce(Arc<Job>) + Send>;

pub(crate) struct RuntimeCore {
    pub(crate) config: RuntimeConfig,
    pub(crate) nodes: Arc<MemoryNodes>,
    pub(crate) engine: CoherencyEngine,
    pub(crate) model: Arc<dyn PerfModel>,
    pub(crate) workers: Vec<Arc<WorkerInfo>>,
    pub(crate) contexts: ContextRegistry,
    pub(crate) stats: RuntimeStats,
    running: AtomicBool,
    /// Set once the workers are gone: newly ready jobs are aborted.
    drained: AtomicBool,
    next_job: AtomicU64,
    epoch: Instant,
    /// Serialises dependency wiring so two submissions never order each
    /// other both ways.
    submit_lock: Mutex<()>,
    inflight: Mutex<HashMap<JobId, Arc<Job>>>,
    /// Submitted, unfinished jobs, acquisitions excluded.
    pending: Mutex<usize>,
    /// Jobs ready, popped or executing, acquisitions excluded. Workers stay
    /// up while this is non-zero: completing one may make others ready.
    runnable: AtomicUsize,
    all_done: Condvar,
    acquisitions: Mutex<HashMap<JobId, Continuation>>,
}

impl std::fmt::Debug for RuntimeCore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RuntimeCore")
            .field("nodes", &self.nodes.len())
            .field("workers", &self.workers.len())
            .field("running", &self.is_running())
            .field("pending", &*self.pending.lock())
            .field("runnable", &self.runnable())
            .finish()
    }
}

impl RuntimeCore {
    pub(crate) fn new(
        config: RuntimeConfig,
        nodes: Arc<MemoryNodes>,
        engine: CoherencyEngine,
        model: Arc<dyn PerfModel>,
        workers: Vec<Arc<WorkerInfo>>,
        root: SchedContext,
    ) -> Self {
        let core = Self {
            config,
            nodes,
            engine,
            model,
            workers,
            contexts: ContextRegistry::new(root),
            stats: RuntimeStats::default(),
            running: AtomicBool::new(true),
            drained: AtomicBool::new(false),
            next_job: AtomicU64::new(1),
            epoch: Instant::now(),
            submit_lock: Mutex::new(()),
            inflight: Mutex::new(HashMap::new()),
            pending: Mutex::new(0),
            runnable: AtomicUsize::new(0),
            all_done: Condvar::new(),
            acquisitions: Mutex::new(HashMap::new()),
        };
        if let Some(root) = core.contexts.get(ROOT_CONTEXT) {
            root.policy().add_workers(root.workers(), &core.env());
        }
        core
    }

    /// Microseconds since the runtime started.
    #[inline]
    pub(crate) fn now_us(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1e6
    }

    /// Decision environment handed to policies.
    pub(crate) fn env(&self) -> PolicyEnv<'_> {
        PolicyEnv {
            workers: &self.workers,
            engine: &self.engine,
            model: self.model.as_ref(),
            now_us: self.now_us(),
        }
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting work. Returns whether the runtime was running.
    pub(crate) fn stop(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn next_job_id(&self) -> JobId {
        JobId(self.next_job.fetch_add(1, Ordering::SeqCst))
    }

    /// Check that some worker reachable from the job's context can run it.
    pub(crate) fn check_runnable(
        &self,
        job: &Job,
    ) -> Result<()> {
        let Some(codelet) = job.codelet() else {
            return Ok(());
        };
        if let Some(w) = job.pinned_worker() {
            let info = self.workers.get(w.0).ok_or(RuntimeError::UnknownWorker(w))?;
            if can_execute(job, info) {
                return Ok(());
            }
            return Err(RuntimeError::Rejected {
                job: job.id(),
                ctx: job.sched_ctx(),
                reason: format!("{} cannot run codelet {}", info.name, codelet.name()),
            });
        }

        let mut current = Some(job.sched_ctx());
        let mut first = true;
        while let Some(id) = current {
            let Some(ctx) = self.contexts.resolve(id) else {
                if first {
                    return Err(RuntimeError::UnknownContext(id));
                }
                break;
            };
            first = false;
            if ctx
                .workers()
                .iter()
                .any(|w| self.workers.get(w.0).map(|info| can_execute(job, info)).unwrap_or(false))
            {
                return Ok(());
            }
            current = ctx.parent();
        }
        Err(RuntimeError::Rejected {
            job: job.id(),
            ctx: job.sched_ctx(),
            reason: format!("no worker can run codelet {}", codelet.name()),
        })
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Wire the job's dependencies and make it ready when none are pending.
    pub(crate) fn submit_job(
        &self,
        job: &Arc<Job>,
        after: &[JobHandle],
    ) {
        self.stats.record_submitted();
        for b in job.buffers() {
            self.engine.retain(&b.handle);
        }
        if !job.is_acquisition() {
            *self.pending.lock() += 1;
        }
        self.inflight.lock().insert(job.id(), job.clone());
        job.set_state(JobState::Submitted);

        {
            let _wiring = self.submit_lock.lock();
            for pred in after {
                add_dependency(pred.job(), job);
            }
            for &i in job.fetch_order() {
                let access = &job.buffers()[i];
                let preds = {
                    let mut inner = access.handle.lock();
                    if inner.sequential_consistency {
                        inner.seq.register(job, access.mode)
                    } else {
                        Vec::new()
                    }
                };
                for pred in preds {
                    add_dependency(&pred, job);
                }
            }
        }

        job.set_state(JobState::Blocked);
        trace!(job = %job.id(), deps = job.pending_dependencies() - 1, "submitted");
        if job.on_dependency_satisfied() {
            self.job_ready(job.clone());
        }
    }

    /// Register what an acquisition runs once ready.
    pub(crate) fn set_continuation(
        &self,
        job: JobId,
        continuation: Continuation,
    ) {
        self.acquisitions.lock().insert(job, continuation);
    }

    /// All dependencies of `job` are satisfied.
    pub(crate) fn job_ready(
        &self,
        job: Arc<Job>,
    ) {
        if job.state().is_terminal() {
            return;
        }
        if self.drained.load(Ordering::SeqCst) {
            self.complete(&job, JobOutcome::Aborted);
            return;
        }
        if !job.is_acquisition() {
            self.runnable.fetch_add(1, Ordering::SeqCst);
        }
        job.set_state(JobState::Ready);

        if job.is_acquisition() {
            let continuation = self.acquisitions.lock().remove(&job.id());
            if let Some(continuation) = continuation {
                job.set_state(JobState::Executing);
                continuation(job);
            }
            return;
        }
        if job.codelet().is_none() {
            self.complete(&job, JobOutcome::Success);
            return;
        }
        self.push(job);
    }

    /// Hand a ready job to its context, falling back to the parents.
    pub(crate) fn push(
        &self,
        job: Arc<Job>,
    ) {
        if let Some(w) = job.pinned_worker() {
            match self.workers.get(w.0) {
                Some(info) if can_execute(&job, info) => {
                    trace!(job = %job.id(), worker = %w, "pinned");
                    info.local.push(job);
                    info.wake();
                },
                _ => {
                    let reason = format!("pinned worker {w} cannot run the job");
                    warn!(job = %job.id(), %reason, "push rejected");
                    self.complete(&job, JobOutcome::Rejected(reason));
                },
            }
            return;
        }

        let env = self.env();
        let mut job = job;
        let mut current = Some(job.sched_ctx());
        let mut reason = format!("context {} is gone", job.sched_ctx());
        while let Some(id) = current {
            let Some(ctx) = self.contexts.resolve(id) else {
                break;
            };
            job.set_scheduled_in(Some(ctx.id()));
            match ctx.policy().push_task(job, &env) {
                Ok(()) => return,
                Err(Rejected { job: back, reason: why }) => {
                    warn!(job = %back.id(), ctx = %ctx.id(), reason = %why, "push rejected");
                    job = back;
                    reason = why;
                    current = ctx.parent();
                },
            }
        }
        job.set_scheduled_in(None);
        self.complete(&job, JobOutcome::Rejected(reason));
    }

    /// Push a job back after a transient failure.
    pub(crate) fn retry(
        &self,
        job: Arc<Job>,
    ) {
        job.record_retry();
        self.stats.record_retry();
        warn!(job = %job.id(), attempt = job.retries(), "pushed back");
        if !job.state().is_terminal() {
            job.set_state(JobState::Ready);
        }
        if self.drained.load(Ordering::SeqCst) {
            self.complete(&job, JobOutcome::Aborted);
        } else {
            self.push(job);
        }
    }

    // ------------------------------------------------------------------
    // Worker side
    // ------------------------------------------------------------------

    /// Next job for `worker`: pinned jobs first, then its contexts, newest
    /// context first.
    pub(crate) fn pop_for(
        &self,
        worker: &WorkerInfo,
    ) -> Option<Arc<Job>> {
        if let Some(job) = worker.local.pop_front() {
            return Some(job);
        }
        let env = self.env();
        self.contexts
            .containing(worker.id)
            .into_iter()
            .find_map(|ctx| ctx.policy().pop_task(worker.id, &env))
    }

    pub(crate) fn pre_exec(
        &self,
        job: &Job,
        worker: WorkerId,
    ) {
        if let Some(ctx) = job.scheduled_in().and_then(|id| self.contexts.get(id)) {
            ctx.policy().pre_exec_hook(job, worker, &self.env());
        }
    }

    pub(crate) fn post_exec(
        &self,
        job: &Job,
        worker: WorkerId,
    ) {
        if let Some(ctx) = job.scheduled_in().and_then(|id| self.contexts.get(id)) {
            ctx.policy().post_exec_hook(job, worker, &self.env());
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Finish `job`: drop its buffer references, run the callback, then
    /// release its successors. Later calls for the same job are ignored.
    pub(crate) fn complete(
        &self,
        job: &Arc<Job>,
        outcome: JobOutcome,
    ) {
        let terminal = match outcome {
            JobOutcome::Aborted => JobState::Aborted,
            _ => JobState::Completed,
        };
        let Some(left) = job.mark_terminal(terminal) else {
            return;
        };
        if job.is_acquisition() {
            self.acquisitions.lock().remove(&job.id());
        }
        for b in job.buffers() {
            self.engine.unretain(&b.handle);
        }
        if let Some(callback) = job.take_callback() {
            callback(&outcome);
        }
        let successors = finish(job);
        self.stats.record_outcome(&outcome);
        debug!(job = %job.id(), ?outcome, successors = successors.len(), "completed");
        job.set_outcome(outcome);
        self.inflight.lock().remove(&job.id());
        if !job.is_acquisition() {
            let mut pending = self.pending.lock();
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                self.all_done.notify_all();
            }
        }

        for succ in successors {
            if succ.on_dependency_satisfied() {
                self.job_ready(succ);
            }
        }

        // Successors are counted before this job leaves the count.
        let counted = !job.is_acquisition() && left.is_runnable();
        if counted && self.runnable.fetch_sub(1, Ordering::SeqCst) == 1 && !self.is_running() {
            for w in &self.workers {
                w.wake();
            }
        }
    }

    /// Block until every submitted job has finished.
    pub(crate) fn wait_for_all(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.all_done.wait(&mut pending);
        }
    }

    /// Jobs submitted and not finished.
    pub(crate) fn pending(&self) -> usize {
        *self.pending.lock()
    }

    /// Jobs with a policy or a worker. Once zero after shutdown, every job
    /// left waits on an application acquisition and a worker may exit.
    #[inline]
    pub(crate) fn runnable(&self) -> usize {
        self.runnable.load(Ordering::SeqCst)
    }

    /// Whether some worker able to run `job` sits on a node with room for
    /// all of its buffers at once.
    pub(crate) fn fits_somewhere(
        &self,
        job: &Job,
    ) -> bool {
        let need: usize = job.buffers().iter().map(|b| b.handle.size()).sum();
        self.workers.iter().any(|info| {
            can_execute(job, info)
                && self
                    .nodes
                    .get(info.node)
                    .map(|node| node.capacity.map_or(true, |cap| need <= cap))
                    .unwrap_or(false)
        })
    }

    /// Abort everything left once the workers have exited.
    ///
    /// Acquisitions the application still holds are left alone.
    pub(crate) fn abort_remaining(&self) -> usize {
        self.drained.store(true, Ordering::SeqCst);
        for ctx in self.contexts.live() {
            drop(ctx.policy().pop_every_task());
        }
        for worker in &self.workers {
            drop(worker.local.drain());
        }
        let stranded: Vec<Arc<Job>> = self
            .inflight
            .lock()
            .values()
            .filter(|job| job.state() != JobState::Executing)
            .cloned()
            .collect();
        let count = stranded.len();
        for job in stranded {
            self.complete(&job, JobOutcome::Aborted);
        }
        count
    }
}
