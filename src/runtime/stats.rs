//! Runtime statistics

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::runtime::task::JobOutcome;

/// Counters updated by the submission path and the workers.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    /// Jobs submitted, control jobs included.
    pub submitted: AtomicUsize,
    /// Jobs that completed successfully.
    pub completed: AtomicUsize,
    /// Jobs whose codelet reported a failure.
    pub failed: AtomicUsize,
    /// Jobs no context could take.
    pub rejected: AtomicUsize,
    /// Jobs dropped by shutdown.
    pub aborted: AtomicUsize,
    /// Pushes back after a transient failure.
    pub retried: AtomicUsize,
    /// Total kernel execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Kernels executing right now.
    pub running: AtomicUsize,
    /// Peak number of concurrently executing kernels.
    pub peak_parallelism: AtomicUsize,
}

impl RuntimeStats {
    #[inline]
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
    }

    /// Record how a job ended.
    pub fn record_outcome(
        &self,
        outcome: &JobOutcome,
    ) {
        let counter = match outcome {
            JobOutcome::Success => &self.completed,
            JobOutcome::Failed(_) => &self.failed,
            JobOutcome::Rejected(_) => &self.rejected,
            JobOutcome::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    /// A kernel starts executing.
    pub fn exec_started(&self) {
        let current = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_parallelism(current);
    }

    /// A kernel finished after `duration_us`.
    pub fn exec_finished(
        &self,
        duration_us: usize,
    ) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::SeqCst);
    }

    /// Update parallelism.
    #[inline]
    pub fn update_parallelism(
        &self,
        current: usize,
    ) {
        loop {
            let peak = self.peak_parallelism.load(Ordering::SeqCst);
            if current <= peak {
                break;
            }
            if self
                .peak_parallelism
                .compare_exchange(peak, current, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Point-in-time copy of the job counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            aborted: self.aborted.load(Ordering::SeqCst),
            retried: self.retried.load(Ordering::SeqCst),
            total_exec_time_us: self.total_exec_time_us.load(Ordering::SeqCst),
            peak_parallelism: self.peak_parallelism.load(Ordering::SeqCst),
            transfers: 0,
            transferred_bytes: 0,
        }
    }
}

/// Serializable statistics, transfer counters included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub rejected: usize,
    pub aborted: usize,
    pub retried: usize,
    pub total_exec_time_us: usize,
    pub peak_parallelism: usize,
    /// Cross-node copies performed.
    pub transfers: usize,
    pub transferred_bytes: usize,
}
