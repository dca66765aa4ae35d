//! Task builder for constructing submissions with various options.

use std::sync::Arc;

use smallvec::SmallVec;

use super::codelet::Codelet;
use super::job::{BufferAccess, Callback, JobHandle, JobOutcome};
use crate::runtime::coherency::AccessMode;
use crate::runtime::data::{encode, DataHandle, Element};
use crate::runtime::scheduler::{SchedCtxId, ROOT_CONTEXT};
use crate::runtime::worker::WorkerId;

/// Description of a task before submission.
pub struct TaskBuilder {
    pub(crate) codelet: Option<Arc<Codelet>>,
    pub(crate) buffers: SmallVec<[BufferAccess; 4]>,
    pub(crate) args: Vec<u8>,
    pub(crate) priority: i32,
    pub(crate) name: Option<String>,
    pub(crate) sched_ctx: SchedCtxId,
    pub(crate) worker: Option<WorkerId>,
    pub(crate) after: Vec<JobHandle>,
    pub(crate) callback: Option<Callback>,
}

impl std::fmt::Debug for TaskBuilder {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("codelet", &self.codelet.as_ref().map(|c| c.name().to_string()))
            .field("buffers", &self.buffers)
            .field("priority", &self.priority)
            .field("sched_ctx", &self.sched_ctx)
            .field("worker", &self.worker)
            .finish()
    }
}

impl TaskBuilder {
    /// Task running `codelet`.
    pub fn new(codelet: &Arc<Codelet>) -> Self {
        Self {
            codelet: Some(codelet.clone()),
            ..Self::control()
        }
    }

    /// Control task: no codelet, no buffers, only dependencies and callback.
    pub fn control() -> Self {
        Self {
            codelet: None,
            buffers: SmallVec::new(),
            args: Vec::new(),
            priority: 0,
            name: None,
            sched_ctx: ROOT_CONTEXT,
            worker: None,
            after: Vec::new(),
            callback: None,
        }
    }

    /// Declare a buffer.
    pub fn buffer(
        mut self,
        handle: &DataHandle,
        mode: AccessMode,
    ) -> Self {
        self.buffers.push(BufferAccess {
            handle: handle.clone(),
            mode,
        });
        self
    }

    /// Declare a read-only buffer.
    #[inline]
    pub fn read(
        self,
        handle: &DataHandle,
    ) -> Self {
        self.buffer(handle, AccessMode::Read)
    }

    /// Declare a write-only buffer.
    #[inline]
    pub fn write(
        self,
        handle: &DataHandle,
    ) -> Self {
        self.buffer(handle, AccessMode::Write)
    }

    /// Declare a read-write buffer.
    #[inline]
    pub fn read_write(
        self,
        handle: &DataHandle,
    ) -> Self {
        self.buffer(handle, AccessMode::ReadWrite)
    }

    /// Raw argument blob.
    pub fn args(
        mut self,
        args: Vec<u8>,
    ) -> Self {
        self.args = args;
        self
    }

    /// Argument blob encoded from plain values.
    pub fn scalar_args<T: Element>(
        mut self,
        values: &[T],
    ) -> Self {
        self.args = encode(values);
        self
    }

    /// Set the priority (higher runs first).
    #[inline]
    pub fn priority(
        mut self,
        priority: i32,
    ) -> Self {
        self.priority = priority;
        self
    }

    /// Set the task name.
    #[inline]
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Submit to a scheduling context other than the root.
    #[inline]
    pub fn in_context(
        mut self,
        ctx: SchedCtxId,
    ) -> Self {
        self.sched_ctx = ctx;
        self
    }

    /// Pin the task to one worker.
    #[inline]
    pub fn on_worker(
        mut self,
        worker: WorkerId,
    ) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Explicit dependency on an earlier job.
    pub fn after(
        mut self,
        job: &JobHandle,
    ) -> Self {
        self.after.push(job.clone());
        self
    }

    /// Completion callback, run on the completing thread.
    pub fn callback<F>(
        mut self,
        f: F,
    ) -> Self
    where
        F: FnOnce(&JobOutcome) + Send + 'static,
    {
        self.callback = Some(Box::new(f));
        self
    }
}
