//! Runtime error taxonomy
//!
//! Recoverable conditions are plain values (`Pending`, `Rejected`), data and
//! scheduling errors are `thiserror` enums, and broken core invariants never
//! travel as values: they go through [`fatal`] and abort the process.

use thiserror::Error;

use crate::runtime::data::HandleId;
use crate::runtime::memory::NodeId;
use crate::runtime::scheduler::SchedCtxId;
use crate::runtime::task::JobId;
use crate::runtime::worker::WorkerId;
use crate::util::config::ConfigError;

pub use crate::runtime::memory::AllocError;

/// Result alias used across the runtime.
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// Top-level runtime error.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The task description is malformed.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// No worker of the context can execute the job.
    #[error("job {job} rejected by context {ctx}: {reason}")]
    Rejected {
        job: JobId,
        ctx: SchedCtxId,
        reason: String,
    },

    /// Data management error.
    #[error(transparent)]
    Data(#[from] DataError),

    /// Allocation failed even after eviction.
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unknown scheduling context.
    #[error("unknown scheduling context {0}")]
    UnknownContext(SchedCtxId),

    /// Unknown worker id.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// The job was aborted by runtime shutdown.
    #[error("job {0} aborted by runtime shutdown")]
    Aborted(JobId),

    /// The runtime is shutting down and no longer accepts work.
    #[error("runtime is shutting down")]
    ShuttingDown,

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised by data registration, access and partitioning.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The handle has been unregistered.
    #[error("data handle {0} is unregistered")]
    Unregistered(HandleId),

    /// The handle is partitioned; only its children may be accessed.
    #[error("data handle {0} is partitioned")]
    Partitioned(HandleId),

    /// `unpartition` called on a handle without children.
    #[error("data handle {0} is not partitioned")]
    NotPartitioned(HandleId),

    /// The memory node does not exist or cannot hold data.
    #[error("invalid memory node {0}")]
    InvalidNode(NodeId),

    /// A reduction access without reduction methods.
    #[error("data handle {0} has no reduction methods")]
    MissingReduction(HandleId),

    /// Scratch and reduction accesses need a worker-bound target.
    #[error("per-worker access on handle {0} without a worker")]
    NoWorker(HandleId),

    /// Initial content does not match the layout.
    #[error("layout expects {expected} bytes, got {found}")]
    SizeMismatch { expected: usize, found: usize },

    /// The filter cannot split this layout.
    #[error("cannot apply filter: {0}")]
    BadFilter(String),
}

/// Failure signalled by a codelet implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// Transient resource failure; the job is pushed again unchanged.
    #[error("transient resource failure, try again")]
    TryAgain,

    /// Semantic failure reported to the application through the callback.
    #[error("codelet failed with code {0}")]
    Failed(i32),

    /// Unrecoverable failure; the runtime aborts.
    #[error("fatal codelet failure: {0}")]
    Fatal(String),
}

/// A push refused by a scheduling policy.
///
/// The job travels back to the caller, which re-submits it elsewhere.
#[derive(Debug)]
pub struct Rejected {
    /// The refused job.
    pub job: std::sync::Arc<crate::runtime::task::Job>,
    /// Why no worker could take it.
    pub reason: String,
}

/// Report a broken core invariant with a state dump and abort.
#[cold]
pub fn fatal(
    what: &str,
    state: &str,
) -> ! {
    tracing::error!(%what, %state, "core invariant violated");
    eprintln!("codelet-rt: fatal: {what}\n--- state dump ---\n{state}");
    std::process::abort()
}
