//! Runtime system
//!
//! A [`Runtime`] owns the memory nodes, the coherency engine, the workers and
//! the scheduling contexts of one instance. Several instances may coexist in
//! a process; nothing is global.
//!
//! ```no_run
//! use std::sync::Arc;
//! use codelet_rt::runtime::{Codelet, Runtime, TaskBuilder};
//! use codelet_rt::util::config::RuntimeConfig;
//!
//! let rt = Runtime::new(RuntimeConfig::default()).unwrap();
//! let scale = Arc::new(Codelet::new("scale").cpu(|bufs, _args| {
//!     let v = bufs.get_mut(0);
//!     for i in 0..v.len::<f32>() {
//!         let x: f32 = v.get(i);
//!         v.set(i, x * 2.0);
//!     }
//!     Ok(())
//! }));
//! let h = rt.register_vector(&[1.0f32, 2.0, 3.0]).unwrap();
//! rt.submit(TaskBuilder::new(&scale).read_write(&h)).unwrap();
//! rt.wait_for_all();
//! assert_eq!(rt.unregister_vector::<f32>(&h).unwrap(), vec![2.0, 4.0, 6.0]);
//! ```

pub mod coherency;
pub(crate) mod core;
pub mod data;
pub mod error;
pub mod memory;
pub mod perfmodel;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod worker;

pub use coherency::{AccessMode, ReductionOps};
pub use data::{DataHandle, Element, Filter, Layout, ReplicaState};
pub use error::{DataError, KernelError, Result, RuntimeError};
pub use memory::{NodeId, NodeKind, HOST_NODE};
pub use scheduler::{SchedCtxId, ROOT_CONTEXT};
pub use stats::StatsSnapshot;
pub use task::{Buffers, Codelet, JobHandle, JobOutcome, JobState, KernelResult, TaskBuilder};
pub use worker::{WorkerArch, WorkerDescription, WorkerId};

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel;
use parking_lot::Mutex;
use smallvec::smallvec;
use tracing::{debug, info, warn};

use self::coherency::{Access, AccessTarget, CoherencyEngine};
use self::core::RuntimeCore;
use self::data::{decode, encode};
use self::memory::{MemoryNodes, NodeAllocator, SimulatedAllocator};
use self::perfmodel::{HistoryModel, PerfModel};
use self::scheduler::{build_policy, SchedContext};
use self::task::{BufferAccess, BufferView, Job};
use self::worker::WorkerInfo;
use crate::util::config::{PolicyKind, RuntimeConfig};

/// One runtime instance.
pub struct Runtime {
    core: Arc<RuntimeCore>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Runtime").field("core", &self.core).finish()
    }
}

impl Runtime {
    /// Start a runtime configured from the environment.
    pub fn init() -> Result<Self> {
        Self::new(RuntimeConfig::from_env()?)
    }

    /// Start a runtime with the in-memory history model.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let model = Arc::new(HistoryModel::new(config.perfmodel.calibration_min_samples));
        Self::with_model(config, model)
    }

    /// Start a runtime with a custom performance model.
    pub fn with_model(
        config: RuntimeConfig,
        model: Arc<dyn PerfModel>,
    ) -> Result<Self> {
        config.validate()?;

        let mut nodes = MemoryNodes::new(config.memory.host_capacity);
        let mut placement = Vec::with_capacity(config.num_workers());
        for _ in 0..config.machine.ncpus {
            placement.push((WorkerArch::Cpu, HOST_NODE));
        }
        for i in 0..config.machine.ncuda {
            let node = nodes.register(NodeKind::AcceleratorRam, format!("cuda{i}"), config.memory.accelerator_capacity);
            placement.push((WorkerArch::Cuda, node));
        }
        for i in 0..config.machine.nopencl {
            let node = nodes.register(
                NodeKind::AcceleratorRam,
                format!("opencl{i}"),
                config.memory.accelerator_capacity,
            );
            placement.push((WorkerArch::OpenCl, node));
        }
        for i in 0..config.machine.ndisk {
            nodes.register(NodeKind::Disk, format!("disk{i}"), config.memory.disk_capacity);
        }
        nodes.calibrate_bus(&config.bus);
        let nodes = Arc::new(nodes);

        let allocator: Arc<dyn NodeAllocator> = Arc::new(SimulatedAllocator::new(&nodes));
        let engine = CoherencyEngine::new(nodes.clone(), allocator, config.coherency.alloc_retries);
        let workers: Vec<Arc<WorkerInfo>> = placement
            .into_iter()
            .enumerate()
            .map(|(i, (arch, node))| Arc::new(WorkerInfo::new(WorkerId(i), arch, node)))
            .collect();
        let root = SchedContext::new(
            ROOT_CONTEXT,
            "root",
            None,
            workers.iter().map(|w| w.id).collect(),
            config.scheduler.policy,
            build_policy(config.scheduler.policy, &config.scheduler),
        );
        let core = Arc::new(RuntimeCore::new(config, nodes, engine, model, workers, root));

        let (started_tx, started_rx) = channel::unbounded();
        let mut threads = Vec::with_capacity(core.workers.len());
        for info in &core.workers {
            match worker::driver::spawn(core.clone(), info.clone(), started_tx.clone()) {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    core.stop();
                    for w in &core.workers {
                        w.wake();
                    }
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(e.into());
                },
            }
        }
        drop(started_tx);
        let started = started_rx.iter().take(threads.len()).count();

        info!(
            workers = started,
            nodes = core.nodes.len(),
            policy = %core.config.scheduler.policy,
            "runtime started"
        );
        Ok(Self {
            core,
            threads: Mutex::new(threads),
        })
    }

    /// Configuration the runtime was started with.
    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.core.config
    }

    /// Memory nodes and bus table.
    #[inline]
    pub fn nodes(&self) -> &MemoryNodes {
        &self.core.nodes
    }

    /// Coherency engine.
    #[inline]
    pub fn engine(&self) -> &CoherencyEngine {
        &self.core.engine
    }

    /// Performance model fed by executions.
    #[inline]
    pub fn model(&self) -> &Arc<dyn PerfModel> {
        &self.core.model
    }

    /// Workers in id order.
    pub fn workers(&self) -> Vec<WorkerDescription> {
        self.core.workers.iter().map(|w| WorkerDescription::from(w.as_ref())).collect()
    }

    /// Shared state of one worker.
    pub fn worker(
        &self,
        id: WorkerId,
    ) -> Option<&Arc<WorkerInfo>> {
        self.core.workers.get(id.0)
    }

    /// Ids of the workers of `arch`.
    pub fn workers_of(
        &self,
        arch: WorkerArch,
    ) -> Vec<WorkerId> {
        self.core
            .workers
            .iter()
            .filter(|w| w.arch == arch)
            .map(|w| w.id)
            .collect()
    }

    /// Counters, transfers included.
    pub fn stats(&self) -> StatsSnapshot {
        let transfers = self.core.engine.transfers();
        StatsSnapshot {
            transfers: transfers.cross_node_copies(),
            transferred_bytes: transfers.bytes(),
            ..self.core.stats.snapshot()
        }
    }

    /// Submitted jobs not finished yet.
    pub fn pending_jobs(&self) -> usize {
        self.core.pending()
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    /// Register a buffer with no content yet: the first access sees zeroes.
    pub fn register_handle(
        &self,
        home: NodeId,
        layout: Layout,
    ) -> Result<DataHandle> {
        self.core.engine.register(layout, home, None)
    }

    /// Register a buffer initialised with `bytes` on `home`.
    pub fn register_bytes(
        &self,
        home: NodeId,
        layout: Layout,
        bytes: &[u8],
    ) -> Result<DataHandle> {
        self.core.engine.register(layout, home, Some(bytes))
    }

    /// Register a host vector.
    pub fn register_vector<T: Element>(
        &self,
        values: &[T],
    ) -> Result<DataHandle> {
        self.register_bytes(HOST_NODE, Layout::vector_of::<T>(values.len()), &encode(values))
    }

    /// Register a host row-major matrix.
    pub fn register_matrix<T: Element>(
        &self,
        rows: usize,
        cols: usize,
        values: &[T],
    ) -> Result<DataHandle> {
        self.register_bytes(HOST_NODE, Layout::matrix_of::<T>(rows, cols), &encode(values))
    }

    /// Register a single host value.
    pub fn register_variable<T: Element>(
        &self,
        value: T,
    ) -> Result<DataHandle> {
        self.register_bytes(HOST_NODE, Layout::variable_of::<T>(), &encode(&[value]))
    }

    /// Attach reduction methods so the handle accepts `Redux` accesses.
    pub fn set_reduction<I, R>(
        &self,
        handle: &DataHandle,
        init: I,
        reduce: R,
    ) where
        I: Fn(&mut Buffers<'_>, &[u8]) -> KernelResult + Send + Sync + 'static,
        R: Fn(&mut Buffers<'_>, &[u8]) -> KernelResult + Send + Sync + 'static,
    {
        self.core.engine.set_reduction(handle, ReductionOps::new(init, reduce));
    }

    /// Wait for the jobs accessing `handle`, bring its content home, destroy
    /// it and return the content.
    ///
    /// Fails with [`DataError::Unregistered`] when called twice.
    pub fn unregister(
        &self,
        handle: &DataHandle,
    ) -> Result<Vec<u8>> {
        let acquired = self.acquire_on(handle, handle.home(), AccessMode::Read)?;
        if let Err(e) = self.core.engine.begin_unregister(handle) {
            self.release(acquired);
            return Err(e.into());
        }
        let bytes = acquired.bytes();
        self.release(acquired);
        self.core.engine.finish_unregister(handle);
        debug!(handle = %handle.id(), "unregistered");
        Ok(bytes)
    }

    /// [`Runtime::unregister`] decoding the content as `T`.
    pub fn unregister_vector<T: Element>(
        &self,
        handle: &DataHandle,
    ) -> Result<Vec<T>> {
        Ok(decode(&self.unregister(handle)?))
    }

    /// Destroy `handle` once every submitted job is done with it, without
    /// waiting. The content is discarded.
    pub fn unregister_submit(
        &self,
        handle: &DataHandle,
    ) -> Result<()> {
        self.core.engine.unregister_lazy(handle)?;
        Ok(())
    }

    /// Split `handle` into children. The parent is inaccessible until
    /// [`Runtime::unpartition`].
    pub fn partition(
        &self,
        handle: &DataHandle,
        filter: Filter,
    ) -> Result<Vec<DataHandle>> {
        let acquired = self.acquire_on(handle, handle.home(), AccessMode::ReadWrite)?;
        let content = acquired.bytes();
        let result = self.core.engine.split(handle, &filter, &content);
        self.release(acquired);
        result
    }

    /// Unregister the children and gather their content back into `handle`.
    pub fn unpartition(
        &self,
        handle: &DataHandle,
    ) -> Result<()> {
        let children = handle.children();
        if children.is_empty() {
            return Err(DataError::NotPartitioned(handle.id()).into());
        }
        let mut content = Vec::with_capacity(handle.size());
        for child in &children {
            content.extend(self.unregister(child)?);
        }
        self.core.engine.merge(handle, &content)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Submit a task. Returns once its dependencies are wired; execution is
    /// asynchronous.
    pub fn submit(
        &self,
        task: TaskBuilder,
    ) -> Result<JobHandle> {
        if !self.core.is_running() {
            return Err(RuntimeError::ShuttingDown);
        }
        let TaskBuilder {
            codelet,
            buffers,
            args,
            priority,
            name,
            sched_ctx,
            worker,
            after,
            callback,
        } = task;
        for b in &buffers {
            self.core
                .engine
                .validate_access(&b.handle, AccessTarget::node(b.handle.home()), b.mode)?;
        }
        let job = Job::new(
            self.core.next_job_id(),
            name,
            codelet,
            buffers,
            args,
            priority,
            sched_ctx,
            worker,
            callback,
            false,
        )?;
        self.core.check_runnable(&job)?;
        self.core.submit_job(&job, &after);
        Ok(JobHandle(job))
    }

    /// Block until every submitted job has finished.
    pub fn wait_for_all(&self) {
        self.core.wait_for_all();
    }

    // ------------------------------------------------------------------
    // Application-side access
    // ------------------------------------------------------------------

    /// Acquire `handle` on its home node, after every job submitted before
    /// that conflicts with `mode`.
    pub fn acquire(
        &self,
        handle: &DataHandle,
        mode: AccessMode,
    ) -> Result<Acquired> {
        self.acquire_on(handle, handle.home(), mode)
    }

    /// Acquire `handle` on `node`. Blocks until granted and fetched.
    pub fn acquire_on(
        &self,
        handle: &DataHandle,
        node: NodeId,
        mode: AccessMode,
    ) -> Result<Acquired> {
        let (tx, rx) = channel::bounded(1);
        self.acquire_cb(handle, node, mode, move |acquired| {
            let _ = tx.send(acquired);
        })?;
        rx.recv().map_err(|_| RuntimeError::ShuttingDown)?
    }

    /// Acquire `handle` on `node` and hand the result to `on_ready`, from
    /// whichever thread completes the acquisition.
    pub fn acquire_cb<F>(
        &self,
        handle: &DataHandle,
        node: NodeId,
        mode: AccessMode,
        on_ready: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Acquired>) + Send + 'static,
    {
        if !self.core.is_running() {
            return Err(RuntimeError::ShuttingDown);
        }
        if mode.is_per_worker() {
            return Err(DataError::NoWorker(handle.id()).into());
        }
        self.core
            .engine
            .validate_access(handle, AccessTarget::node(node), mode)?;

        let job = Job::new(
            self.core.next_job_id(),
            Some(format!("acquire {}", handle.id())),
            None,
            smallvec![BufferAccess {
                handle: handle.clone(),
                mode,
            }],
            Vec::new(),
            0,
            ROOT_CONTEXT,
            None,
            None,
            true,
        )?;

        let core = Arc::downgrade(&self.core);
        let target = handle.clone();
        self.core.set_continuation(
            job.id(),
            Box::new(move |job: Arc<Job>| {
                let Some(runtime) = core.upgrade() else {
                    on_ready(Err(RuntimeError::ShuttingDown));
                    return;
                };
                let weak = Arc::downgrade(&runtime);
                runtime.engine.request_access_then(
                    &target,
                    AccessTarget::node(node),
                    mode,
                    0,
                    move |granted| {
                        let Some(runtime) = weak.upgrade() else {
                            drop(granted);
                            on_ready(Err(RuntimeError::ShuttingDown));
                            return;
                        };
                        match runtime.engine.fetch(granted) {
                            Ok(access) => on_ready(Ok(Acquired { access, job })),
                            Err(e) => {
                                runtime.complete(&job, JobOutcome::Rejected(e.to_string()));
                                on_ready(Err(e.into()));
                            },
                        }
                    },
                );
            }),
        );
        self.core.submit_job(&job, &[]);
        Ok(())
    }

    /// End an application-side access and release the jobs waiting on it.
    pub fn release(
        &self,
        acquired: Acquired,
    ) {
        let Acquired { access, job } = acquired;
        self.core.engine.release(access);
        self.core.complete(&job, JobOutcome::Success);
    }

    // ------------------------------------------------------------------
    // Scheduling contexts
    // ------------------------------------------------------------------

    /// Create a context under the root scheduling on `workers`.
    pub fn create_context(
        &self,
        name: &str,
        workers: &[WorkerId],
        policy: PolicyKind,
    ) -> Result<SchedCtxId> {
        self.create_nested_context(name, ROOT_CONTEXT, workers, policy)
    }

    /// Create a context under `parent`; `workers` must belong to the parent.
    pub fn create_nested_context(
        &self,
        name: &str,
        parent: SchedCtxId,
        workers: &[WorkerId],
        policy: PolicyKind,
    ) -> Result<SchedCtxId> {
        let instance = build_policy(policy, &self.core.config.scheduler);
        instance.add_workers(workers, &self.core.env());
        let ctx = self
            .core
            .contexts
            .create(name, parent, workers.to_vec(), policy, instance)?;
        info!(ctx = %ctx.id(), name, %parent, workers = workers.len(), %policy, "context created");
        Ok(ctx.id())
    }

    /// Delete a context. Its queued jobs move to the nearest live ancestor.
    pub fn delete_context(
        &self,
        id: SchedCtxId,
    ) -> Result<()> {
        let ctx = self.core.contexts.remove(id)?;
        let queued = ctx.policy().pop_every_task();
        info!(ctx = %id, requeued = queued.len(), "context deleted");
        for job in queued {
            job.set_scheduled_in(None);
            self.core.push(job);
        }
        Ok(())
    }

    /// Live context `id`.
    pub fn context(
        &self,
        id: SchedCtxId,
    ) -> Option<Arc<SchedContext>> {
        self.core.contexts.get(id)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop the workers once they are idle and abort whatever was never
    /// executed. Idempotent.
    pub fn shutdown(&self) {
        if !self.core.stop() {
            return;
        }
        for w in &self.core.workers {
            w.wake();
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        let aborted = self.core.abort_remaining();
        info!(aborted, "runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Data held by the application between [`Runtime::acquire`] and
/// [`Runtime::release`].
#[must_use = "an acquired handle blocks conflicting jobs until released"]
pub struct Acquired {
    access: Access,
    job: Arc<Job>,
}

impl std::fmt::Debug for Acquired {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Acquired")
            .field("handle", &self.access.handle().id())
            .field("mode", &self.access.mode())
            .field("node", &self.access.node())
            .finish()
    }
}

impl Acquired {
    #[inline]
    pub fn handle(&self) -> &DataHandle {
        self.access.handle()
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.access.mode()
    }

    #[inline]
    pub fn node(&self) -> NodeId {
        self.access.node()
    }

    /// Buffer view; writable unless acquired `Read`.
    pub fn view(&self) -> BufferView<'_> {
        self.access.view()
    }

    /// Copy of the content.
    pub fn bytes(&self) -> Vec<u8> {
        self.access.bytes()
    }

    /// Content decoded as `T`.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        self.access.to_vec()
    }
}
