//! Jobs: the runtime's execution record for a submitted task.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::codelet::Codelet;
use crate::runtime::coherency::AccessMode;
use crate::runtime::data::{DataHandle, Footprint};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::scheduler::SchedCtxId;
use crate::runtime::worker::WorkerId;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl JobId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Job({})", self.0)
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Submitted,
    /// Waiting on dependencies.
    Blocked,
    /// Dependencies satisfied, handed to a policy.
    Ready,
    /// Popped by a worker, data being fetched.
    Scheduled,
    Executing,
    Completed,
    /// Dropped by runtime shutdown.
    Aborted,
}

impl JobState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => JobState::Created,
            1 => JobState::Submitted,
            2 => JobState::Blocked,
            3 => JobState::Ready,
            4 => JobState::Scheduled,
            5 => JobState::Executing,
            6 => JobState::Completed,
            _ => JobState::Aborted,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Whether the job reached a terminal state.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Aborted)
    }

    /// Whether the job is with a policy or a worker: ready, popped or running.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        matches!(self, JobState::Ready | JobState::Scheduled | JobState::Executing)
    }
}

/// How a job ended, as seen by its callback and waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    /// The codelet reported a semantic failure.
    Failed(i32),
    /// No context could take the job once it became ready.
    Rejected(String),
    /// The runtime shut down first.
    Aborted,
}

impl JobOutcome {
    /// Whether the job ran successfully.
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success)
    }
}

/// Completion callback.
pub type Callback = Box<dyn FnOnce(&JobOutcome) + Send>;

/// One declared buffer.
#[derive(Debug, Clone)]
pub struct BufferAccess {
    pub handle: DataHandle,
    pub mode: AccessMode,
}

/// Scheduler bookkeeping attached by a model-driven policy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Prediction {
    /// Predicted execution length, microseconds.
    pub length_us: f64,
    /// Predicted input transfer time, microseconds.
    pub transfer_us: f64,
    /// Implementation chosen at push time.
    pub implementation: Option<usize>,
}

#[derive(Default)]
pub(crate) struct Dependents {
    pub(crate) successors: Vec<Arc<Job>>,
    pub(crate) done: bool,
}

/// Internal execution record.
pub struct Job {
    id: JobId,
    name: String,
    codelet: Option<Arc<Codelet>>,
    buffers: SmallVec<[BufferAccess; 4]>,
    /// Buffer indices sorted by handle id: the acquisition order.
    fetch_order: SmallVec<[usize; 4]>,
    args: Vec<u8>,
    priority: i32,
    sched_ctx: SchedCtxId,
    pinned_worker: Option<WorkerId>,
    footprint: Footprint,
    state: AtomicU8,
    /// Unsatisfied dependencies plus one submission guard.
    remaining: AtomicUsize,
    pub(crate) dependents: Mutex<Dependents>,
    callback: Mutex<Option<Callback>>,
    outcome: OnceCell<JobOutcome>,
    prediction: Mutex<Prediction>,
    attempts: AtomicUsize,
    /// Context whose policy placed the job, for the execution hooks.
    scheduled_in: Mutex<Option<SchedCtxId>>,
    /// Application-side acquisition: completes on release, not on execution.
    acquisition: bool,
}

impl fmt::Debug for Job {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("priority", &self.priority)
            .field("buffers", &self.buffers.len())
            .field("ctx", &self.sched_ctx)
            .finish()
    }
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: JobId,
        name: Option<String>,
        codelet: Option<Arc<Codelet>>,
        buffers: SmallVec<[BufferAccess; 4]>,
        args: Vec<u8>,
        priority: i32,
        sched_ctx: SchedCtxId,
        pinned_worker: Option<WorkerId>,
        callback: Option<Callback>,
        acquisition: bool,
    ) -> Result<Arc<Self>> {
        if codelet.is_none() && !buffers.is_empty() && !acquisition {
            return Err(RuntimeError::InvalidTask(
                "control task without codelet cannot declare buffers".to_string(),
            ));
        }
        if let Some(cl) = &codelet {
            if cl.implementations().is_empty() {
                return Err(RuntimeError::InvalidTask(format!(
                    "codelet {} has no implementation",
                    cl.name()
                )));
            }
            if let Some(n) = cl.expected_buffers() {
                if n != buffers.len() {
                    return Err(RuntimeError::InvalidTask(format!(
                        "codelet {} expects {n} buffers, got {}",
                        cl.name(),
                        buffers.len()
                    )));
                }
            }
        }
        for (i, a) in buffers.iter().enumerate() {
            if buffers[..i].iter().any(|b| b.handle == a.handle) {
                return Err(RuntimeError::InvalidTask(format!(
                    "{} declared twice",
                    a.handle.id()
                )));
            }
        }

        let mut fetch_order: SmallVec<[usize; 4]> = (0..buffers.len()).collect();
        fetch_order.sort_by_key(|&i| buffers[i].handle.id());
        let footprint = Footprint::combine(buffers.iter().map(|b| b.handle.footprint()));
        let name = name.unwrap_or_else(|| match &codelet {
            Some(cl) => format!("{}#{}", cl.name(), id.0),
            None => format!("control#{}", id.0),
        });

        Ok(Arc::new(Self {
            id,
            name,
            codelet,
            buffers,
            fetch_order,
            args,
            priority,
            sched_ctx,
            pinned_worker,
            footprint,
            state: AtomicU8::new(JobState::Created.as_u8()),
            remaining: AtomicUsize::new(1),
            dependents: Mutex::new(Dependents::default()),
            callback: Mutex::new(callback),
            outcome: OnceCell::new(),
            prediction: Mutex::new(Prediction::default()),
            attempts: AtomicUsize::new(0),
            scheduled_in: Mutex::new(None),
            acquisition,
        }))
    }

    /// Job id.
    #[inline]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Name for diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Codelet, `None` for control jobs.
    #[inline]
    pub fn codelet(&self) -> Option<&Arc<Codelet>> {
        self.codelet.as_ref()
    }

    /// Declared buffers.
    #[inline]
    pub fn buffers(&self) -> &[BufferAccess] {
        &self.buffers
    }

    /// Buffer indices in acquisition order.
    #[inline]
    pub fn fetch_order(&self) -> &[usize] {
        &self.fetch_order
    }

    /// Argument blob.
    #[inline]
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Scheduling priority, higher first.
    #[inline]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Target scheduling context.
    #[inline]
    pub fn sched_ctx(&self) -> SchedCtxId {
        self.sched_ctx
    }

    /// Worker the job must run on, if pinned.
    #[inline]
    pub fn pinned_worker(&self) -> Option<WorkerId> {
        self.pinned_worker
    }

    /// Combined footprint of all buffers.
    #[inline]
    pub fn footprint(&self) -> Footprint {
        self.footprint
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_state(
        &self,
        state: JobState,
    ) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Move to a terminal state once. Returns the state left, or `None` if
    /// already terminal.
    pub(crate) fn mark_terminal(
        &self,
        state: JobState,
    ) -> Option<JobState> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if JobState::from_u8(current).is_terminal() {
                return None;
            }
            match self.state.compare_exchange(current, state.as_u8(), Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Some(JobState::from_u8(current)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Context whose policy placed the job.
    pub fn scheduled_in(&self) -> Option<SchedCtxId> {
        *self.scheduled_in.lock()
    }

    pub(crate) fn set_scheduled_in(
        &self,
        ctx: Option<SchedCtxId>,
    ) {
        *self.scheduled_in.lock() = ctx;
    }

    /// Whether this is an application-side acquisition.
    #[inline]
    pub fn is_acquisition(&self) -> bool {
        self.acquisition
    }

    /// Last prediction attached by the scheduler.
    pub fn prediction(&self) -> Prediction {
        *self.prediction.lock()
    }

    pub(crate) fn set_prediction(
        &self,
        prediction: Prediction,
    ) {
        *self.prediction.lock() = prediction;
    }

    /// How many times the job was pushed back after a transient failure.
    #[inline]
    pub fn retries(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn record_retry(&self) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
    }

    /// Unsatisfied dependency count (including the submission guard).
    #[inline]
    pub fn pending_dependencies(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Register one more unsatisfied dependency.
    #[inline]
    pub(crate) fn add_pending(&self) {
        self.remaining.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark one dependency satisfied. Returns `true` when none remain.
    pub(crate) fn on_dependency_satisfied(&self) -> bool {
        match self.remaining.fetch_sub(1, Ordering::SeqCst) {
            0 => crate::runtime::error::fatal(
                "dependency counter underflow",
                &format!("{self:?}"),
            ),
            1 => true,
            _ => false,
        }
    }

    /// Take the callback, leaving `None`.
    pub(crate) fn take_callback(&self) -> Option<Callback> {
        self.callback.lock().take()
    }

    /// Record the outcome; later calls are ignored.
    pub(crate) fn set_outcome(
        &self,
        outcome: JobOutcome,
    ) {
        let _ = self.outcome.set(outcome);
    }

    /// Outcome if the job has finished.
    #[inline]
    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.get()
    }

    /// Block until the job has an outcome.
    #[inline]
    pub fn wait_outcome(&self) -> &JobOutcome {
        self.outcome.wait()
    }
}

/// Application-facing handle on a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle(pub(crate) Arc<Job>);

impl JobHandle {
    /// Job id.
    #[inline]
    pub fn id(&self) -> JobId {
        self.0.id()
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> JobState {
        self.0.state()
    }

    /// Block until the job completed (or was aborted) and return its outcome.
    pub fn wait(&self) -> Result<JobOutcome> {
        match self.0.wait_outcome() {
            JobOutcome::Aborted => Err(RuntimeError::Aborted(self.0.id())),
            outcome => Ok(outcome.clone()),
        }
    }

    /// Outcome if already finished.
    pub fn try_outcome(&self) -> Option<JobOutcome> {
        self.0.outcome().cloned()
    }

    /// Underlying job.
    #[inline]
    pub fn job(&self) -> &Arc<Job> {
        &self.0
    }
}
