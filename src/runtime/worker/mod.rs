//! Workers
//!
//! One OS thread per execution unit. A worker belongs to an architecture,
//! fetches its buffers on one memory node and owns a local queue for jobs
//! pinned to it. The thread itself runs the loop in [`driver`].

pub(crate) mod driver;

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::runtime::memory::NodeId;
use crate::runtime::scheduler::JobQueue;

/// Unique worker identifier, dense from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "worker{}", self.0)
    }
}

/// Architecture of an execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerArch {
    Cpu,
    Cuda,
    OpenCl,
}

impl WorkerArch {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerArch::Cpu => "cpu",
            WorkerArch::Cuda => "cuda",
            WorkerArch::OpenCl => "opencl",
        }
    }
}

impl fmt::Display for WorkerArch {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a worker thread is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerStatus {
    Idle,
    Fetching,
    Executing,
    Releasing,
    ShuttingDown,
}

impl WorkerStatus {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => WorkerStatus::Idle,
            1 => WorkerStatus::Fetching,
            2 => WorkerStatus::Executing,
            3 => WorkerStatus::Releasing,
            _ => WorkerStatus::ShuttingDown,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Wake-up flag a worker sleeps on.
#[derive(Debug, Default)]
pub struct WorkerSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WorkerSignal {
    /// Wake the worker, or make its next wait return at once.
    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    /// Sleep until notified or `timeout` elapses. Returns whether notified.
    pub fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            let _ = self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

/// Static description and shared state of one worker.
#[derive(Debug)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub arch: WorkerArch,
    /// Memory node the worker computes on.
    pub node: NodeId,
    pub name: String,
    status: AtomicU8,
    /// Jobs pinned to this worker.
    pub(crate) local: JobQueue,
    pub(crate) signal: WorkerSignal,
    executed: AtomicUsize,
}

impl WorkerInfo {
    pub(crate) fn new(
        id: WorkerId,
        arch: WorkerArch,
        node: NodeId,
    ) -> Self {
        Self {
            id,
            arch,
            node,
            name: format!("{arch}{}", id.0),
            status: AtomicU8::new(WorkerStatus::Idle.as_u8()),
            local: JobQueue::new(),
            signal: WorkerSignal::default(),
            executed: AtomicUsize::new(0),
        }
    }

    /// Current status.
    #[inline]
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_status(
        &self,
        status: WorkerStatus,
    ) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    /// Jobs executed so far.
    #[inline]
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub(crate) fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::SeqCst);
    }

    /// Jobs waiting in the pinned queue.
    #[inline]
    pub fn pinned_queued(&self) -> usize {
        self.local.len()
    }

    /// Wake the worker thread.
    #[inline]
    pub fn wake(&self) {
        self.signal.notify();
    }
}

/// Serializable worker summary.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerDescription {
    pub id: WorkerId,
    pub arch: WorkerArch,
    pub node: NodeId,
    pub name: String,
}

impl From<&WorkerInfo> for WorkerDescription {
    fn from(info: &WorkerInfo) -> Self {
        Self {
            id: info.id,
            arch: info.arch,
            node: info.node,
            name: info.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests;
