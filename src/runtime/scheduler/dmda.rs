//! Model-driven placement (`dmda`, `dmdas`)
//!
//! Each worker has its own ready queue and a running estimate of when that
//! queue drains. A push evaluates every (worker, implementation) pair of the
//! context and keeps the one with the lowest fitness:
//!
//! ```text
//! fitness = alpha * (finish - best_finish) + beta * transfer + gamma * energy
//! ```
//!
//! where `finish` is the worker's expected drain time, pushed back by the
//! input transfer, plus the predicted length. Pairs without a prediction win
//! outright: among them the worker with the fewest queued jobs is chosen, so
//! calibration measurements spread over all workers.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace};

use super::queue::ReadyQueue;
use super::{PolicyEnv, SchedulingPolicy};
use crate::runtime::coherency::AccessMode;
use crate::runtime::error::Rejected;
use crate::runtime::task::{Job, Prediction};
use crate::runtime::worker::WorkerId;

/// Weights of the fitness terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitnessWeights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            gamma: 1000.0,
        }
    }
}

/// Expected queue timeline of one worker, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Estimates {
    /// When the worker starts on its queued work.
    pub exp_start: f64,
    /// Predicted work queued.
    pub exp_len: f64,
    /// `exp_start + exp_len`.
    pub exp_end: f64,
    /// Jobs placed and not yet finished.
    pub ntasks: usize,
}

impl Estimates {
    fn starting_at(now: f64) -> Self {
        Self {
            exp_start: now,
            exp_end: now,
            ..Self::default()
        }
    }

    /// Execution may start later than predicted, never earlier.
    pub fn refresh(
        &mut self,
        now: f64,
    ) {
        self.exp_start = self.exp_start.max(now);
        self.exp_end = self.exp_start + self.exp_len;
    }

    fn on_push(
        &mut self,
        length: f64,
        transfer: f64,
    ) {
        self.exp_len += length + transfer;
        self.exp_end = self.exp_start + self.exp_len;
        self.ntasks += 1;
    }

    fn on_pop(
        &mut self,
        now: f64,
        prediction: Prediction,
    ) {
        self.exp_start = now + prediction.length_us;
        self.exp_len = (self.exp_len - (prediction.length_us + prediction.transfer_us)).max(0.0);
        self.exp_end = self.exp_start + self.exp_len;
    }

    fn on_finish(
        &mut self,
        now: f64,
    ) {
        self.exp_start = now;
        self.exp_end = self.exp_start + self.exp_len;
        self.ntasks = self.ntasks.saturating_sub(1);
    }
}

/// One (worker, implementation) option for a job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub worker: WorkerId,
    pub implementation: usize,
    /// `None` while the model is uncalibrated.
    pub length_us: Option<f64>,
    pub transfer_us: f64,
    pub energy: f64,
    /// Worker's expected drain time.
    pub exp_end: f64,
    /// Worker's queued job count.
    pub ntasks: usize,
}

impl Candidate {
    /// Predicted completion time.
    pub fn finish(
        &self,
        now: f64,
    ) -> f64 {
        self.exp_end.max(now + self.transfer_us) + self.length_us.unwrap_or(0.0)
    }
}

/// Index of the candidate DMDA places the job on.
///
/// Ties go to the lowest worker id, then the lowest implementation index.
pub fn select_candidate(
    candidates: &[Candidate],
    weights: FitnessWeights,
    now: f64,
) -> Option<usize> {
    let tie = |a: &Candidate, b: &Candidate| {
        a.worker
            .cmp(&b.worker)
            .then(a.implementation.cmp(&b.implementation))
    };

    if candidates.iter().any(|c| c.length_us.is_none()) {
        return candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.length_us.is_none())
            .min_by(|(_, a), (_, b)| a.ntasks.cmp(&b.ntasks).then(tie(a, b)))
            .map(|(i, _)| i);
    }

    let best = candidates
        .iter()
        .map(|c| c.finish(now))
        .fold(f64::INFINITY, f64::min);
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let fitness = weights.alpha * (c.finish(now) - best)
                + weights.beta * c.transfer_us
                + weights.gamma * c.energy;
            (i, c, fitness)
        })
        .min_by(|(_, a, fa), (_, b, fb)| fa.total_cmp(fb).then(tie(a, b)))
        .map(|(i, _, _)| i)
}

#[derive(Debug)]
struct WorkerSlot {
    queue: ReadyQueue,
    est: Estimates,
}

#[derive(Debug)]
pub struct DmdaPolicy {
    weights: FitnessWeights,
    sorted: bool,
    prefetch: bool,
    /// Decision lock: held for one push or pop, never across a transfer.
    slots: Mutex<IndexMap<WorkerId, WorkerSlot>>,
}

impl DmdaPolicy {
    /// `sorted` selects `dmdas`: per-worker queues ordered by priority.
    pub fn new(
        weights: FitnessWeights,
        sorted: bool,
        prefetch: bool,
    ) -> Self {
        Self {
            weights,
            sorted,
            prefetch,
            slots: Mutex::new(IndexMap::new()),
        }
    }

    #[inline]
    pub fn weights(&self) -> FitnessWeights {
        self.weights
    }

    /// Current estimates of `worker`.
    pub fn estimates(
        &self,
        worker: WorkerId,
    ) -> Option<Estimates> {
        self.slots.lock().get(&worker).map(|s| s.est)
    }

    /// Jobs queued for `worker`.
    pub fn queued_on(
        &self,
        worker: WorkerId,
    ) -> usize {
        self.slots.lock().get(&worker).map(|s| s.queue.len()).unwrap_or(0)
    }

    fn candidates(
        slots: &mut IndexMap<WorkerId, WorkerSlot>,
        job: &Job,
        env: &PolicyEnv<'_>,
    ) -> Vec<Candidate> {
        let Some(codelet) = job.codelet() else {
            return Vec::new();
        };
        let mut candidates = Vec::new();
        for (worker, slot) in slots.iter_mut() {
            slot.est.refresh(env.now_us);
            let Some(info) = env.worker(*worker) else {
                continue;
            };
            let transfer_us: f64 = job
                .buffers()
                .iter()
                .map(|b| env.engine.predict_transfer(&b.handle, info.node, b.mode))
                .sum();
            for (implementation, _) in codelet.eligible(info.arch) {
                let (length_us, energy) = if codelet.has_model() {
                    let length = env
                        .model
                        .predict_length(codelet.name(), job.footprint(), info.arch, implementation)
                        .map(|d| d.as_secs_f64() * 1e6);
                    let energy = env
                        .model
                        .predict_energy(codelet.name(), job.footprint(), info.arch, implementation)
                        .unwrap_or(0.0);
                    (length, energy)
                } else {
                    (None, 0.0)
                };
                candidates.push(Candidate {
                    worker: *worker,
                    implementation,
                    length_us,
                    transfer_us,
                    energy,
                    exp_end: slot.est.exp_end,
                    ntasks: slot.est.ntasks,
                });
            }
        }
        candidates
    }
}

impl SchedulingPolicy for DmdaPolicy {
    fn name(&self) -> &'static str {
        if self.sorted {
            "dmdas"
        } else {
            "dmda"
        }
    }

    fn add_workers(
        &self,
        workers: &[WorkerId],
        env: &PolicyEnv<'_>,
    ) {
        let mut slots = self.slots.lock();
        for w in workers {
            slots.entry(*w).or_insert_with(|| WorkerSlot {
                queue: ReadyQueue::new(self.sorted),
                est: Estimates::starting_at(env.now_us),
            });
        }
    }

    fn remove_workers(
        &self,
        workers: &[WorkerId],
    ) -> Vec<Arc<Job>> {
        let mut slots = self.slots.lock();
        workers
            .iter()
            .filter_map(|w| slots.shift_remove(w))
            .flat_map(|slot| slot.queue.drain())
            .collect()
    }

    fn push_task(
        &self,
        job: Arc<Job>,
        env: &PolicyEnv<'_>,
    ) -> Result<(), Rejected> {
        let mut slots = self.slots.lock();
        let candidates = Self::candidates(&mut slots, &job, env);
        let Some(chosen) = select_candidate(&candidates, self.weights, env.now_us).map(|i| candidates[i]) else {
            drop(slots);
            let reason = format!(
                "no worker of {} can run {}",
                self.name(),
                job.codelet().map(|c| c.name()).unwrap_or("control task")
            );
            return Err(Rejected { job, reason });
        };

        let length = chosen.length_us.unwrap_or(0.0);
        job.set_prediction(Prediction {
            length_us: length,
            transfer_us: chosen.transfer_us,
            implementation: Some(chosen.implementation),
        });
        if let Some(slot) = slots.get_mut(&chosen.worker) {
            slot.est.on_push(length, chosen.transfer_us);
            slot.queue.push(job.clone());
        }
        drop(slots);

        debug!(
            job = %job.id(),
            worker = %chosen.worker,
            implementation = chosen.implementation,
            calibrated = chosen.length_us.is_some(),
            transfer_us = chosen.transfer_us,
            "placed"
        );
        env.wake(chosen.worker);

        if self.prefetch {
            if let Some(info) = env.worker(chosen.worker) {
                for b in job.buffers().iter().filter(|b| b.mode == AccessMode::Read) {
                    env.engine.prefetch(&b.handle, info.node);
                }
            }
        }
        Ok(())
    }

    fn pop_task(
        &self,
        worker: WorkerId,
        env: &PolicyEnv<'_>,
    ) -> Option<Arc<Job>> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&worker)?;
        let job = slot.queue.pop()?;
        slot.est.on_pop(env.now_us, job.prediction());
        trace!(job = %job.id(), %worker, exp_end = slot.est.exp_end, "popped");
        Some(job)
    }

    fn pop_every_task(&self) -> Vec<Arc<Job>> {
        let mut slots = self.slots.lock();
        let mut jobs = Vec::new();
        for slot in slots.values_mut() {
            jobs.extend(slot.queue.drain());
            slot.est.exp_len = 0.0;
            slot.est.exp_end = slot.est.exp_start;
            slot.est.ntasks = 0;
        }
        jobs
    }

    fn post_exec_hook(
        &self,
        _job: &Job,
        worker: WorkerId,
        env: &PolicyEnv<'_>,
    ) {
        if let Some(slot) = self.slots.lock().get_mut(&worker) {
            slot.est.on_finish(env.now_us);
        }
    }

    fn queued(&self) -> usize {
        self.slots.lock().values().map(|s| s.queue.len()).sum()
    }
}
