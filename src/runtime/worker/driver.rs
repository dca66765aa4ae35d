//! Worker thread loop
//!
//! `Idle → Fetching → Executing → Releasing → Idle`. A worker keeps up to
//! `pipeline_depth` popped jobs in slots. Each slot acquires its buffers in
//! handle-id order; a request that cannot be granted at once parks the slot
//! and the grant comes back over the worker's channel, so the worker keeps
//! popping and executing meanwhile.

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::utils::Backoff;
use tracing::{debug, info_span, trace, warn};

use super::{WorkerId, WorkerInfo, WorkerStatus};
use crate::runtime::coherency::{Access, AccessTarget, Granted};
use crate::runtime::core::RuntimeCore;
use crate::runtime::error::{fatal, KernelError};
use crate::runtime::scheduler::eligible_implementations;
use crate::runtime::task::{Buffers, Job, JobId, JobOutcome, JobState};
use crate::util::config::IdleMode;

/// A grant delivered to a parked slot: `(job, buffer index, grant)`.
type GrantMsg = (JobId, usize, Granted);

/// Start the thread of `info`. `started` receives the worker id once the
/// thread runs.
pub(crate) fn spawn(
    core: Arc<RuntimeCore>,
    info: Arc<WorkerInfo>,
    started: Sender<WorkerId>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("codelet-{}-{}", info.arch, info.id.0))
        .spawn(move || {
            let span = info_span!("worker", id = info.id.0, arch = %info.arch);
            let _entered = span.enter();
            let _ = started.send(info.id);
            Driver::new(core, info).run();
        })
}

/// One popped job and its acquisition progress.
struct Slot {
    job: Arc<Job>,
    /// Position in the job's fetch order.
    next: usize,
    /// A request is queued on a handle.
    parked: bool,
    /// Fetched accesses, by buffer index.
    accesses: Vec<Option<Access>>,
}

impl Slot {
    fn new(job: Arc<Job>) -> Self {
        let accesses = job.buffers().iter().map(|_| None).collect();
        Self {
            job,
            next: 0,
            parked: false,
            accesses,
        }
    }

    #[inline]
    fn ready(&self) -> bool {
        !self.parked && self.next == self.job.fetch_order().len()
    }
}

enum Advance {
    Stalled,
    Progressed,
    OutOfMemory(String),
}

struct Driver {
    core: Arc<RuntimeCore>,
    info: Arc<WorkerInfo>,
    depth: usize,
    idle: IdleMode,
    idle_timeout: Duration,
    slots: VecDeque<Slot>,
    grants_tx: Sender<GrantMsg>,
    grants_rx: Receiver<GrantMsg>,
}

impl Driver {
    fn new(
        core: Arc<RuntimeCore>,
        info: Arc<WorkerInfo>,
    ) -> Self {
        let worker = &core.config.worker;
        let (depth, idle, idle_timeout) = (
            worker.pipeline_depth.max(1),
            worker.idle,
            Duration::from_millis(worker.idle_timeout_ms),
        );
        let (grants_tx, grants_rx) = channel::unbounded();
        Self {
            core,
            info,
            depth,
            idle,
            idle_timeout,
            slots: VecDeque::new(),
            grants_tx,
            grants_rx,
        }
    }

    fn run(mut self) {
        debug!(node = %self.info.node, depth = self.depth, "worker started");
        let backoff = Backoff::new();
        loop {
            let mut progressed = self.drain_grants();
            progressed |= self.advance_all();

            if let Some(pos) = self.slots.iter().position(Slot::ready) {
                if let Some(slot) = self.slots.remove(pos) {
                    self.execute(slot);
                    progressed = true;
                }
            }

            if self.slots.len() < self.depth {
                if let Some(job) = self.core.pop_for(&self.info) {
                    self.admit(job);
                    progressed = true;
                }
            }

            if progressed {
                backoff.reset();
                continue;
            }
            if !self.core.is_running() && self.slots.is_empty() && self.core.runnable() == 0 {
                break;
            }

            self.info.set_status(WorkerStatus::Idle);
            match self.idle {
                IdleMode::Block => {
                    self.info.signal.wait_timeout(self.idle_timeout);
                },
                IdleMode::Spin => {
                    if backoff.is_completed() {
                        self.info.signal.wait_timeout(self.idle_timeout);
                    } else {
                        backoff.snooze();
                    }
                },
            }
        }
        self.info.set_status(WorkerStatus::ShuttingDown);
        debug!(executed = self.info.executed(), "worker stopped");
    }

    fn admit(
        &mut self,
        job: Arc<Job>,
    ) {
        trace!(job = %job.id(), "popped");
        job.set_state(JobState::Scheduled);
        self.info.set_status(WorkerStatus::Fetching);
        self.slots.push_back(Slot::new(job));
    }

    /// Fetch grants resolved by other threads.
    fn drain_grants(&mut self) -> bool {
        let mut progressed = false;
        while let Ok((job, index, granted)) = self.grants_rx.try_recv() {
            progressed = true;
            let Some(pos) = self.slots.iter().position(|s| s.job.id() == job) else {
                warn!(%job, "grant for a job no longer held");
                self.core.engine.cancel(granted);
                continue;
            };
            let slot = &mut self.slots[pos];
            slot.parked = false;
            match self.core.engine.fetch(granted) {
                Ok(access) => {
                    slot.accesses[index] = Some(access);
                    slot.next += 1;
                },
                Err(e) => {
                    debug!(%job, error = %e, "fetch failed");
                    if let Some(slot) = self.slots.remove(pos) {
                        self.out_of_memory(slot, &e.to_string());
                    }
                },
            }
        }
        progressed
    }

    fn advance_all(&mut self) -> bool {
        let mut progressed = false;
        let mut i = 0;
        while i < self.slots.len() {
            match self.advance(i) {
                Advance::Stalled => i += 1,
                Advance::Progressed => {
                    progressed = true;
                    i += 1;
                },
                Advance::OutOfMemory(reason) => {
                    progressed = true;
                    if let Some(slot) = self.slots.remove(i) {
                        self.out_of_memory(slot, &reason);
                    }
                },
            }
        }
        progressed
    }

    /// Request the slot's remaining buffers until one has to wait.
    fn advance(
        &mut self,
        i: usize,
    ) -> Advance {
        let core = &self.core;
        let target = AccessTarget::worker(self.info.id, self.info.node);
        let slot = &mut self.slots[i];
        if slot.parked {
            return Advance::Stalled;
        }

        let job = slot.job.clone();
        let mut progressed = false;
        while let Some(&index) = job.fetch_order().get(slot.next) {
            let access = &job.buffers()[index];
            let on_grant = grant_sink(
                Arc::downgrade(core),
                self.info.clone(),
                self.grants_tx.clone(),
                job.id(),
                index,
            );
            progressed = true;
            let Some(granted) =
                core.engine
                    .request_access_with(&access.handle, target, access.mode, job.priority(), on_grant)
            else {
                trace!(job = %job.id(), handle = %access.handle.id(), "parked");
                slot.parked = true;
                break;
            };
            match core.engine.fetch(granted) {
                Ok(fetched) => {
                    slot.accesses[index] = Some(fetched);
                    slot.next += 1;
                },
                Err(e) => {
                    debug!(job = %job.id(), error = %e, "fetch failed");
                    return Advance::OutOfMemory(e.to_string());
                },
            }
        }
        if progressed {
            Advance::Progressed
        } else {
            Advance::Stalled
        }
    }

    fn release_all(
        &self,
        slot: &mut Slot,
    ) {
        for access in slot.accesses.iter_mut().filter_map(Option::take) {
            self.core.engine.release(access);
        }
    }

    /// Give a job back to the scheduler unchanged.
    fn push_back(
        &self,
        mut slot: Slot,
    ) {
        self.release_all(&mut slot);
        self.core.post_exec(&slot.job, self.info.id);
        self.core.retry(slot.job);
    }

    /// Push the job back after a failed allocation, or reject it when no
    /// node could ever hold its buffers or the requeue bound is spent.
    fn out_of_memory(
        &self,
        mut slot: Slot,
        error: &str,
    ) {
        let job = slot.job.clone();
        let limit = self.core.config.coherency.oom_requeues;
        let reason = if !self.core.fits_somewhere(&job) {
            format!("buffers exceed every eligible node: {error}")
        } else if job.retries() >= limit {
            format!("still out of memory after {limit} requeues: {error}")
        } else {
            self.push_back(slot);
            return;
        };
        warn!(job = %job.id(), %reason, "job rejected");
        self.release_all(&mut slot);
        self.core.post_exec(&job, self.info.id);
        self.core.complete(&job, JobOutcome::Rejected(reason));
    }

    fn execute(
        &self,
        mut slot: Slot,
    ) {
        let job = slot.job.clone();
        let Some(codelet) = job.codelet().cloned() else {
            self.release_all(&mut slot);
            self.core.complete(&job, JobOutcome::Success);
            return;
        };
        let eligible = eligible_implementations(&job, &self.info);
        let chosen = job
            .prediction()
            .implementation
            .filter(|i| eligible.contains(i))
            .or_else(|| eligible.first().copied());
        let Some(implementation) = chosen else {
            self.release_all(&mut slot);
            self.core.post_exec(&job, self.info.id);
            self.core.push(job);
            return;
        };

        self.info.set_status(WorkerStatus::Executing);
        job.set_state(JobState::Executing);
        self.core.pre_exec(&job, self.info.id);
        self.core.stats.exec_started();
        let kernel = codelet.implementations()[implementation].func().clone();
        let start = Instant::now();
        let result = {
            let views = slot.accesses.iter().flatten().map(Access::view).collect();
            let mut buffers = Buffers::new(views);
            panic::catch_unwind(AssertUnwindSafe(|| kernel(&mut buffers, job.args())))
        };
        let elapsed = start.elapsed();
        self.core.stats.exec_finished(elapsed.as_micros() as usize);

        let outcome = match result {
            Ok(Ok(())) => {
                if codelet.has_model() {
                    self.core.model.record_measurement(
                        codelet.name(),
                        job.footprint(),
                        self.info.arch,
                        implementation,
                        elapsed,
                    );
                }
                JobOutcome::Success
            },
            Ok(Err(KernelError::TryAgain)) => {
                debug!(job = %job.id(), "codelet asked to try again");
                self.push_back(slot);
                return;
            },
            Ok(Err(KernelError::Failed(code))) => {
                warn!(job = %job.id(), code, "codelet failed");
                JobOutcome::Failed(code)
            },
            Ok(Err(KernelError::Fatal(message))) => {
                fatal(&format!("codelet {} failed", codelet.name()), &message)
            },
            Err(_) => fatal(&format!("codelet {} panicked", codelet.name()), &format!("{job:?}")),
        };

        trace!(job = %job.id(), implementation, elapsed_us = elapsed.as_micros() as u64, "executed");
        self.info.record_executed();
        self.info.set_status(WorkerStatus::Releasing);
        self.release_all(&mut slot);
        self.core.post_exec(&job, self.info.id);
        self.core.complete(&job, outcome);
    }
}

/// Callback resolving a parked request: forward the grant to the worker, or
/// give it up when the worker is gone.
fn grant_sink(
    core: Weak<RuntimeCore>,
    info: Arc<WorkerInfo>,
    tx: Sender<GrantMsg>,
    job: JobId,
    index: usize,
) -> impl FnOnce(Granted) + Send + 'static {
    move |granted| {
        if let Err(channel::SendError((_, _, orphan))) = tx.send((job, index, granted)) {
            match core.upgrade() {
                Some(core) => core.engine.cancel(orphan),
                None => drop(orphan),
            }
            return;
        }
        info.wake();
    }
}
