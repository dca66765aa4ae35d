//! Coherency engine
//!
//! Keeps every handle's replicas consistent across memory nodes.
//!
//! Arbitration ([`CoherencyEngine::request_access`]) decides *when* an access
//! may proceed: any number of holders of one shareable mode, or exactly one
//! holder of an exclusive mode. Fetching ([`CoherencyEngine::fetch`]) decides
//! *where the bytes come from*: it allocates the target replica, copies from
//! the cheapest valid source, folds pending reduction contributions and
//! updates replica states. Releasing drops the hold and grants queued
//! requests outside the header lock.
//!
//! The header lock is never held across an allocation, a copy or a fold. The
//! replica being filled is flagged `fetching` and its source is pinned for
//! the duration, so concurrent fetchers wait on the handle's condvar.

mod reduction;
mod request;
mod transfer;

pub use reduction::ReductionOps;
pub use request::{Access, AccessFuture, AccessMode, AccessTarget, Granted, Pending};
pub use transfer::{LinkCounters, TransferStats};

pub(crate) use request::{AccessRequest, Waiter};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::runtime::data::{
    DataHandle, Filter, HandleId, HandleInner, HandleShared, Layout, Lifecycle, ReplicaState,
};
use crate::runtime::error::{fatal, AllocError, DataError, Result};
use crate::runtime::memory::{EvictionCandidate, MemoryNodes, NodeAllocator, NodeId, Storage};

/// Eviction candidates examined per failed allocation.
const EVICTION_SCAN_LIMIT: usize = 64;

/// Replica manager shared by the runtime, the workers and the policies.
pub struct CoherencyEngine {
    nodes: Arc<MemoryNodes>,
    allocator: Arc<dyn NodeAllocator>,
    transfers: TransferStats,
    /// Live handles by id, for eviction lookups.
    registry: Mutex<HashMap<u64, Weak<HandleShared>>>,
    next_handle: AtomicU64,
    alloc_retries: usize,
}

impl fmt::Debug for CoherencyEngine {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CoherencyEngine")
            .field("nodes", &self.nodes.len())
            .field("live_handles", &self.live_handles())
            .field("copies", &self.transfers.copies())
            .finish()
    }
}

impl CoherencyEngine {
    pub fn new(
        nodes: Arc<MemoryNodes>,
        allocator: Arc<dyn NodeAllocator>,
        alloc_retries: usize,
    ) -> Self {
        Self {
            nodes,
            allocator,
            transfers: TransferStats::default(),
            registry: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            alloc_retries,
        }
    }

    #[inline]
    pub fn nodes(&self) -> &Arc<MemoryNodes> {
        &self.nodes
    }

    #[inline]
    pub fn allocator(&self) -> &Arc<dyn NodeAllocator> {
        &self.allocator
    }

    #[inline]
    pub fn transfers(&self) -> &TransferStats {
        &self.transfers
    }

    /// Handles registered and not yet destroyed.
    pub fn live_handles(&self) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a buffer whose home is `home`.
    ///
    /// With `init`, the home replica is allocated and becomes `Owner`.
    /// Without, no replica is valid and the first access sees zeroes.
    pub fn register(
        &self,
        layout: Layout,
        home: NodeId,
        init: Option<&[u8]>,
    ) -> Result<DataHandle> {
        self.register_with_parent(layout, home, init, None)
    }

    fn register_with_parent(
        &self,
        layout: Layout,
        home: NodeId,
        init: Option<&[u8]>,
        parent: Option<&DataHandle>,
    ) -> Result<DataHandle> {
        if !self.nodes.is_valid_target(home) {
            return Err(DataError::InvalidNode(home).into());
        }
        if let Some(bytes) = init {
            if bytes.len() != layout.size() {
                return Err(DataError::SizeMismatch {
                    expected: layout.size(),
                    found: bytes.len(),
                }
                .into());
            }
        }

        let id = HandleId(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let handle = DataHandle::new(id, layout, home, self.nodes.len(), parent);
        if let Some(bytes) = init {
            let storage = self.allocate(id, home, layout.size())?;
            storage.write().copy_from_slice(bytes);
            let mut inner = handle.lock();
            let replica = &mut inner.replicas[home.index()];
            replica.storage = Some(storage);
            replica.state = ReplicaState::Owner;
        }
        self.registry.lock().insert(id.0, handle.downgrade());
        debug!(handle = %id, %home, size = layout.size(), "registered");
        Ok(handle)
    }

    /// Attach reduction methods.
    pub fn set_reduction(
        &self,
        handle: &DataHandle,
        ops: ReductionOps,
    ) {
        handle.lock().reduction = Some(ops);
    }

    /// Check that `mode` may be requested on `handle` at `target`.
    pub fn validate_access(
        &self,
        handle: &DataHandle,
        target: AccessTarget,
        mode: AccessMode,
    ) -> std::result::Result<(), DataError> {
        let inner = handle.lock();
        if inner.lifecycle != Lifecycle::Registered {
            return Err(DataError::Unregistered(handle.id()));
        }
        if !inner.children.is_empty() {
            return Err(DataError::Partitioned(handle.id()));
        }
        if !self.nodes.is_valid_target(target.node) {
            return Err(DataError::InvalidNode(target.node));
        }
        if mode == AccessMode::Redux && inner.reduction.is_none() {
            return Err(DataError::MissingReduction(handle.id()));
        }
        Ok(())
    }

    /// Count a submitted job against the handle.
    pub(crate) fn retain(
        &self,
        handle: &DataHandle,
    ) {
        handle.lock().busy_count += 1;
    }

    /// Drop a reference taken by [`CoherencyEngine::retain`].
    pub(crate) fn unretain(
        &self,
        handle: &DataHandle,
    ) {
        let mut inner = handle.lock();
        if inner.busy_count == 0 {
            fatal("busy count underflow", &dump(handle, &inner));
        }
        inner.busy_count -= 1;
        let dead = take_if_dead(&mut inner);
        handle.0.changed.notify_all();
        drop(inner);
        if let Some(blocks) = dead {
            self.destroy(handle, blocks);
        }
    }

    /// Mark the handle for destruction once nothing references it.
    ///
    /// The content is discarded.
    pub fn unregister_lazy(
        &self,
        handle: &DataHandle,
    ) -> std::result::Result<(), DataError> {
        let mut inner = handle.lock();
        check_registered(handle, &inner)?;
        inner.lifecycle = Lifecycle::LazyUnregister;
        let dead = take_if_dead(&mut inner);
        drop(inner);
        debug!(handle = %handle.id(), "lazy unregister");
        if let Some(blocks) = dead {
            self.destroy(handle, blocks);
        }
        Ok(())
    }

    /// Forbid further accesses; in-flight holders keep going.
    pub(crate) fn begin_unregister(
        &self,
        handle: &DataHandle,
    ) -> std::result::Result<(), DataError> {
        let mut inner = handle.lock();
        check_registered(handle, &inner)?;
        inner.lifecycle = Lifecycle::Unregistering;
        Ok(())
    }

    /// Wait until the handle is idle, then free all of its storage.
    pub(crate) fn finish_unregister(
        &self,
        handle: &DataHandle,
    ) {
        let mut inner = handle.lock();
        while inner.busy_count > 0 {
            handle.0.changed.wait(&mut inner);
        }
        inner.lifecycle = Lifecycle::Destroyed;
        inner.seq.clear();
        let blocks = inner.take_all_storage();
        drop(inner);
        self.destroy(handle, blocks);
    }

    /// Bring the content home, wait for every holder and destroy the handle.
    ///
    /// Returns the final content. A second call fails with
    /// [`DataError::Unregistered`]. The read is queued ahead of every other
    /// request and ignores job ordering: jobs submitted but not yet fetching
    /// are not waited for. Applications go through `Runtime::unregister`.
    pub(crate) fn unregister(
        &self,
        handle: &DataHandle,
    ) -> Result<Vec<u8>> {
        self.begin_unregister(handle)?;
        let granted = match self.request_access(
            handle,
            AccessTarget::node(handle.home()),
            AccessMode::Read,
            i32::MAX,
        ) {
            Ok(granted) => granted,
            Err(Pending(future)) => future.wait()?,
        };
        let access = self.fetch(granted)?;
        let bytes = access.bytes();
        self.release(access);
        self.finish_unregister(handle);
        Ok(bytes)
    }

    fn destroy(
        &self,
        handle: &DataHandle,
        blocks: Vec<Storage>,
    ) {
        let freed = blocks.len();
        for block in blocks {
            self.allocator.free(block);
        }
        self.registry.lock().remove(&handle.id().0);
        debug!(handle = %handle.id(), freed, "handle destroyed");
    }

    // ------------------------------------------------------------------
    // Partitioning
    // ------------------------------------------------------------------

    /// Register one child per piece of `content` and attach them to `parent`.
    pub(crate) fn split(
        &self,
        parent: &DataHandle,
        filter: &Filter,
        content: &[u8],
    ) -> Result<Vec<DataHandle>> {
        let pieces = filter.split(&parent.layout())?;
        let mut children = Vec::with_capacity(pieces.len());
        for (layout, range) in pieces {
            match self.register_with_parent(layout, parent.home(), Some(&content[range]), Some(parent)) {
                Ok(child) => children.push(child),
                Err(e) => {
                    for child in &children {
                        let _ = self.unregister_lazy(child);
                    }
                    return Err(e);
                },
            }
        }
        parent.lock().children = children.clone();
        debug!(parent = %parent.id(), children = children.len(), "partitioned");
        Ok(children)
    }

    /// Detach the children and write their gathered content into `parent`.
    pub(crate) fn merge(
        &self,
        parent: &DataHandle,
        content: &[u8],
    ) -> Result<()> {
        {
            let mut inner = parent.lock();
            if inner.children.is_empty() {
                return Err(DataError::NotPartitioned(parent.id()).into());
            }
            inner.children.clear();
        }
        let granted = match self.request_access(
            parent,
            AccessTarget::node(parent.home()),
            AccessMode::Write,
            i32::MAX,
        ) {
            Ok(granted) => granted,
            Err(Pending(future)) => future.wait()?,
        };
        let access = self.fetch(granted)?;
        access.storage().write().copy_from_slice(content);
        self.release(access);
        debug!(parent = %parent.id(), "unpartitioned");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Arbitration
    // ------------------------------------------------------------------

    /// Ask for `mode` access to `handle` on `target`.
    ///
    /// Granted immediately when no incompatible holder exists and nothing is
    /// queued ahead; otherwise queued by priority, FIFO within a priority.
    pub fn request_access(
        &self,
        handle: &DataHandle,
        target: AccessTarget,
        mode: AccessMode,
        priority: i32,
    ) -> std::result::Result<Granted, Pending> {
        let mut inner = handle.lock();
        inner.busy_count += 1;
        if try_grant(&mut inner, mode) {
            trace!(handle = %handle.id(), ?mode, node = %target.node, "granted");
            return Ok(Granted {
                handle: handle.clone(),
                target,
                mode,
            });
        }
        let (tx, rx) = oneshot::channel();
        enqueue(&mut inner, priority, mode, target, Waiter::Future(tx));
        trace!(handle = %handle.id(), ?mode, queued = inner.requests.len(), "access queued");
        Err(Pending(AccessFuture {
            rx,
            handle: handle.clone(),
        }))
    }

    /// Like [`CoherencyEngine::request_access`], but a queued request is
    /// resolved by calling `on_grant` from the releasing thread.
    ///
    /// Returns the grant directly when no waiting is needed.
    pub fn request_access_with<F>(
        &self,
        handle: &DataHandle,
        target: AccessTarget,
        mode: AccessMode,
        priority: i32,
        on_grant: F,
    ) -> Option<Granted>
    where
        F: FnOnce(Granted) + Send + 'static,
    {
        let mut inner = handle.lock();
        inner.busy_count += 1;
        if try_grant(&mut inner, mode) {
            return Some(Granted {
                handle: handle.clone(),
                target,
                mode,
            });
        }
        enqueue(&mut inner, priority, mode, target, Waiter::Callback(Box::new(on_grant)));
        None
    }

    /// Like [`CoherencyEngine::request_access_with`], but `on_grant` also runs
    /// (on the calling thread) when the access is granted at once.
    pub fn request_access_then<F>(
        &self,
        handle: &DataHandle,
        target: AccessTarget,
        mode: AccessMode,
        priority: i32,
        on_grant: F,
    ) where
        F: FnOnce(Granted) + Send + 'static,
    {
        let mut inner = handle.lock();
        inner.busy_count += 1;
        if try_grant(&mut inner, mode) {
            drop(inner);
            on_grant(Granted {
                handle: handle.clone(),
                target,
                mode,
            });
            return;
        }
        enqueue(&mut inner, priority, mode, target, Waiter::Callback(Box::new(on_grant)));
    }

    /// Give up a grant without fetching.
    pub fn cancel(
        &self,
        granted: Granted,
    ) {
        self.finish_access(&granted.handle, granted.target, granted.mode, false);
    }

    /// Drop a fetched access and grant whatever became compatible.
    pub fn release(
        &self,
        access: Access,
    ) {
        let Access {
            handle,
            target,
            mode,
            storage,
        } = access;
        drop(storage);
        self.finish_access(&handle, target, mode, true);
    }

    fn finish_access(
        &self,
        handle: &DataHandle,
        target: AccessTarget,
        mode: AccessMode,
        fetched: bool,
    ) {
        let mut inner = handle.lock();
        if fetched && !mode.is_per_worker() {
            let node = target.node.index();
            if inner.replicas[node].refcnt == 0 {
                fatal("replica refcount underflow", &dump(handle, &inner));
            }
            inner.replicas[node].refcnt -= 1;
        }
        if mode != AccessMode::Scratch {
            if inner.refcnt == 0 {
                fatal("handle refcount underflow", &dump(handle, &inner));
            }
            inner.refcnt -= 1;
        }
        if inner.busy_count == 0 {
            fatal("busy count underflow", &dump(handle, &inner));
        }
        inner.busy_count -= 1;

        let granted = if mode != AccessMode::Scratch && inner.refcnt == 0 {
            inner.current_mode = None;
            drain_grantable(&mut inner)
        } else {
            Vec::new()
        };
        let dead = take_if_dead(&mut inner);
        handle.0.changed.notify_all();
        drop(inner);

        trace!(handle = %handle.id(), ?mode, woken = granted.len(), "released");
        self.resolve(handle, granted);
        if let Some(blocks) = dead {
            self.destroy(handle, blocks);
        }
    }

    fn resolve(
        &self,
        handle: &DataHandle,
        granted: Vec<AccessRequest>,
    ) {
        for request in granted {
            let grant = Granted {
                handle: handle.clone(),
                target: request.target,
                mode: request.mode,
            };
            match request.waiter {
                Waiter::Future(tx) => {
                    if let Err(orphan) = tx.send(grant) {
                        warn!(handle = %handle.id(), seq = request.seq, "grant receiver dropped");
                        self.cancel(orphan);
                    }
                },
                Waiter::Callback(on_grant) => on_grant(grant),
            }
        }
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    /// Make the granted replica valid on its node.
    ///
    /// On allocation failure the grant is given up before returning.
    pub fn fetch(
        &self,
        granted: Granted,
    ) -> std::result::Result<Access, AllocError> {
        let Granted {
            handle,
            target,
            mode,
        } = granted;
        let result = match mode {
            AccessMode::Scratch => self.fetch_scratch(&handle, target),
            AccessMode::Redux => self.fetch_redux(&handle, target),
            _ => self.fetch_replica(&handle, target.node, mode),
        };
        match result {
            Ok(storage) => Ok(Access {
                handle,
                target,
                mode,
                storage,
            }),
            Err(e) => {
                debug!(handle = %handle.id(), ?mode, error = %e, "fetch failed");
                self.finish_access(&handle, target, mode, false);
                Err(e)
            },
        }
    }

    fn fetch_replica(
        &self,
        handle: &DataHandle,
        node: NodeId,
        mode: AccessMode,
    ) -> std::result::Result<Storage, AllocError> {
        let idx = node.index();
        let mut inner = handle.lock();
        loop {
            if inner.folding || inner.replicas[idx].fetching {
                handle.0.changed.wait(&mut inner);
                continue;
            }
            if !inner.redux.is_empty() {
                self.fold_into(handle, &mut inner, node)?;
                continue;
            }
            if inner.replicas[idx].storage.is_none() {
                inner.replicas[idx].fetching = true;
                let size = handle.size();
                let allocated = MutexGuard::unlocked(&mut inner, || self.allocate(handle.id(), node, size));
                inner.replicas[idx].fetching = false;
                handle.0.changed.notify_all();
                inner.replicas[idx].storage = Some(allocated?);
                continue;
            }

            if mode.reads() && !inner.replicas[idx].state.is_valid() {
                match self.select_source_locked(&inner, node) {
                    Some(src) => {
                        let s = src.index();
                        let (from, to) = match (&inner.replicas[s].storage, &inner.replicas[idx].storage) {
                            (Some(from), Some(to)) => (from.clone(), to.clone()),
                            _ => fatal("valid replica without storage", &dump(handle, &inner)),
                        };
                        inner.replicas[s].refcnt += 1;
                        inner.replicas[idx].fetching = true;
                        MutexGuard::unlocked(&mut inner, || self.transfers.copy(&from, &to));
                        inner.replicas[s].refcnt -= 1;
                        inner.replicas[idx].fetching = false;
                        if inner.replicas[s].state == ReplicaState::Owner {
                            inner.replicas[s].state = ReplicaState::Shared;
                        }
                        inner.replicas[idx].state = ReplicaState::Shared;
                        handle.0.changed.notify_all();
                    },
                    None => {
                        // Never written: the zeroed block is the content.
                        inner.replicas[idx].state = ReplicaState::Owner;
                    },
                }
            }

            if mode.is_exclusive() {
                for (i, replica) in inner.replicas.iter_mut().enumerate() {
                    replica.state = if i == idx {
                        ReplicaState::Owner
                    } else {
                        ReplicaState::Invalid
                    };
                }
            }

            inner.replicas[idx].refcnt += 1;
            verify(handle, &inner);
            let storage = match &inner.replicas[idx].storage {
                Some(storage) => storage.clone(),
                None => fatal("fetched replica without storage", &dump(handle, &inner)),
            };
            drop(inner);
            self.allocator.touch(&storage, handle.id().0);
            return Ok(storage);
        }
    }

    fn fetch_scratch(
        &self,
        handle: &DataHandle,
        target: AccessTarget,
    ) -> std::result::Result<Storage, AllocError> {
        let Some(worker) = target.worker else {
            fatal("scratch access without a worker", &format!("{handle:?}"));
        };
        if let Some(storage) = handle.lock().scratch.get(&worker) {
            return Ok(storage.clone());
        }
        let storage = self.allocate(handle.id(), target.node, handle.size())?;
        handle.lock().scratch.insert(worker, storage.clone());
        Ok(storage)
    }

    fn fetch_redux(
        &self,
        handle: &DataHandle,
        target: AccessTarget,
    ) -> std::result::Result<Storage, AllocError> {
        let Some(worker) = target.worker else {
            fatal("reduction access without a worker", &format!("{handle:?}"));
        };
        let ops = {
            let inner = handle.lock();
            if let Some(storage) = inner.redux.get(&worker) {
                return Ok(storage.clone());
            }
            match &inner.reduction {
                Some(ops) => ops.clone(),
                None => fatal("reduction access without methods", &dump(handle, &inner)),
            }
        };
        let storage = self.allocate(handle.id(), target.node, handle.size())?;
        ops.init_block(&storage, handle.layout());
        handle.lock().redux.insert(worker, storage.clone());
        trace!(handle = %handle.id(), %worker, "reduction contribution opened");
        Ok(storage)
    }

    /// Fold every pending contribution into a replica on `node`, which
    /// becomes the sole `Owner`.
    fn fold_into(
        &self,
        handle: &DataHandle,
        inner: &mut MutexGuard<'_, HandleInner>,
        node: NodeId,
    ) -> std::result::Result<(), AllocError> {
        let ops = match &inner.reduction {
            Some(ops) => ops.clone(),
            None => fatal("contributions without reduction methods", &dump(handle, inner)),
        };
        let idx = node.index();
        let layout = handle.layout();
        inner.folding = true;

        let dst = match inner.replicas[idx].storage.clone() {
            Some(storage) => storage,
            None => match MutexGuard::unlocked(inner, || self.allocate(handle.id(), node, layout.size())) {
                Ok(storage) => {
                    inner.replicas[idx].storage = Some(storage.clone());
                    storage
                },
                Err(e) => {
                    inner.folding = false;
                    handle.0.changed.notify_all();
                    return Err(e);
                },
            },
        };

        let in_place = inner.replicas[idx].state.is_valid();
        let base = if in_place {
            None
        } else {
            self.select_source_locked(inner, node)
                .and_then(|src| inner.replicas[src.index()].storage.clone())
        };
        let contributions: Vec<Storage> = inner.redux.drain().map(|(_, s)| s).collect();
        let folded = contributions.len();

        MutexGuard::unlocked(inner, || {
            match &base {
                Some(src) => self.transfers.copy(src, &dst),
                None if !in_place => ops.init_block(&dst, layout),
                None => {},
            }
            for contribution in &contributions {
                ops.fold(&dst, contribution, layout);
            }
            for contribution in contributions {
                self.allocator.free(contribution);
            }
        });

        for (i, replica) in inner.replicas.iter_mut().enumerate() {
            replica.state = if i == idx {
                ReplicaState::Owner
            } else {
                ReplicaState::Invalid
            };
        }
        inner.folding = false;
        verify(handle, inner);
        handle.0.changed.notify_all();
        debug!(handle = %handle.id(), %node, folded, "reduction folded");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sources, prediction, prefetch
    // ------------------------------------------------------------------

    /// Valid replica that is cheapest to copy to `dst`, lowest node id first
    /// on ties. `dst` itself wins when valid.
    pub fn select_source_node(
        &self,
        handle: &DataHandle,
        dst: NodeId,
    ) -> Option<NodeId> {
        let inner = handle.lock();
        self.select_source_locked(&inner, dst)
    }

    fn select_source_locked(
        &self,
        inner: &HandleInner,
        dst: NodeId,
    ) -> Option<NodeId> {
        let size = inner
            .replicas
            .iter()
            .find_map(|r| r.storage.as_ref().map(Storage::len))
            .unwrap_or(0);
        inner
            .replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state.is_valid() && r.storage.is_some())
            .map(|(i, _)| (NodeId(i), self.nodes.predict_transfer(NodeId(i), dst, size)))
            .min_by(|(a, ca), (b, cb)| ca.total_cmp(cb).then(a.cmp(b)))
            .map(|(n, _)| n)
    }

    /// Predicted microseconds to make `handle` usable in `mode` on `node`.
    pub fn predict_transfer(
        &self,
        handle: &DataHandle,
        node: NodeId,
        mode: AccessMode,
    ) -> f64 {
        if !mode.reads() {
            return 0.0;
        }
        let inner = handle.lock();
        if inner.replicas[node.index()].state.is_valid() {
            return 0.0;
        }
        match self.select_source_locked(&inner, node) {
            Some(src) => self.nodes.predict_transfer(src, node, handle.size()),
            None => 0.0,
        }
    }

    /// Start making a valid replica on `node` without holding it afterwards.
    ///
    /// Skipped when the handle is held in an exclusive mode, has requests
    /// queued, is already valid there or has nothing to copy. Returns whether
    /// a copy was made.
    pub fn prefetch(
        &self,
        handle: &DataHandle,
        node: NodeId,
    ) -> bool {
        if !self.nodes.is_valid_target(node) {
            return false;
        }
        {
            let mut inner = handle.lock();
            let replica = &inner.replicas[node.index()];
            if inner.lifecycle != Lifecycle::Registered
                || !inner.children.is_empty()
                || !inner.redux.is_empty()
                || replica.state.is_valid()
                || replica.fetching
                || !inner.has_valid_copy()
            {
                return false;
            }
            inner.busy_count += 1;
            if !try_grant(&mut inner, AccessMode::Read) {
                inner.busy_count -= 1;
                return false;
            }
        }
        let granted = Granted {
            handle: handle.clone(),
            target: AccessTarget::node(node),
            mode: AccessMode::Read,
        };
        match self.fetch(granted) {
            Ok(access) => {
                trace!(handle = %handle.id(), %node, "prefetched");
                self.release(access);
                true
            },
            Err(_) => false,
        }
    }

    /// Check the replica invariants of `handle`.
    pub fn check_invariants(
        &self,
        handle: &DataHandle,
    ) -> std::result::Result<(), String> {
        handle.lock().check_invariants()
    }

    // ------------------------------------------------------------------
    // Allocation and eviction
    // ------------------------------------------------------------------

    fn allocate(
        &self,
        owner: HandleId,
        node: NodeId,
        size: usize,
    ) -> std::result::Result<Storage, AllocError> {
        let storage = self.alloc_with_eviction(node, size)?;
        self.allocator.touch(&storage, owner.0);
        Ok(storage)
    }

    fn alloc_with_eviction(
        &self,
        node: NodeId,
        size: usize,
    ) -> std::result::Result<Storage, AllocError> {
        let mut attempts = 0;
        loop {
            match self.allocator.alloc(node, size) {
                Ok(storage) => return Ok(storage),
                Err(AllocError::OutOfMemory { .. }) if attempts < self.alloc_retries => {
                    attempts += 1;
                    if !self.evict_one(node) {
                        return Err(AllocError::OutOfMemory {
                            node,
                            requested: size,
                        });
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn evict_one(
        &self,
        node: NodeId,
    ) -> bool {
        let mut first = None;
        for _ in 0..EVICTION_SCAN_LIMIT {
            let Some(candidate) = self.allocator.evict_candidate(node) else {
                return false;
            };
            match first {
                None => first = Some(candidate.storage),
                Some(seen) if seen == candidate.storage => return false,
                Some(_) => {},
            }
            if self.try_evict(candidate) {
                return true;
            }
        }
        false
    }

    /// Free one replica block, writing it back home when it is the only
    /// valid copy. Home replicas, pinned replicas and per-worker blocks are
    /// never evicted.
    fn try_evict(
        &self,
        candidate: EvictionCandidate,
    ) -> bool {
        let shared = match self.registry.lock().get(&candidate.owner).and_then(Weak::upgrade) {
            Some(shared) => shared,
            None => return false,
        };
        let handle = DataHandle(shared);
        let idx = candidate.node.index();
        let mut inner = handle.lock();

        let resident = inner.replicas[idx]
            .storage
            .as_ref()
            .map(|s| s.id() == candidate.storage)
            .unwrap_or(false);
        if !resident
            || inner.lifecycle == Lifecycle::Destroyed
            || inner.folding
            || inner.replicas[idx].refcnt > 0
            || inner.replicas[idx].fetching
        {
            return false;
        }

        let state = inner.replicas[idx].state;
        let sole_copy = state.is_valid()
            && inner
                .replicas
                .iter()
                .enumerate()
                .all(|(i, r)| i == idx || !r.state.is_valid());

        if state.is_valid() && handle.home() == candidate.node {
            return false;
        }
        if !sole_copy {
            inner.replicas[idx].state = ReplicaState::Invalid;
            let block = inner.replicas[idx].storage.take();
            verify(&handle, &inner);
            drop(inner);
            if let Some(block) = block {
                self.allocator.free(block);
            }
            debug!(handle = %handle.id(), node = %candidate.node, ?state, "evicted");
            return true;
        }

        // Sole valid copy: write back home under an exclusive hold.
        if inner.refcnt > 0 || !inner.requests.is_empty() {
            return false;
        }
        inner.refcnt += 1;
        inner.busy_count += 1;
        inner.current_mode = Some(AccessMode::ReadWrite);
        let home = handle.home();
        let hidx = home.index();
        inner.replicas[hidx].fetching = true;
        let home_block = match inner.replicas[hidx].storage.clone() {
            Some(storage) => Some(storage),
            None => {
                let size = handle.size();
                match MutexGuard::unlocked(&mut inner, || self.allocator.alloc(home, size)) {
                    Ok(storage) => {
                        self.allocator.touch(&storage, candidate.owner);
                        inner.replicas[hidx].storage = Some(storage.clone());
                        Some(storage)
                    },
                    Err(_) => None,
                }
            },
        };
        let evicted = match (home_block, inner.replicas[idx].storage.clone()) {
            (Some(to), Some(from)) => {
                MutexGuard::unlocked(&mut inner, || self.transfers.copy(&from, &to));
                inner.replicas[hidx].state = ReplicaState::Owner;
                inner.replicas[idx].state = ReplicaState::Invalid;
                let block = inner.replicas[idx].storage.take();
                verify(&handle, &inner);
                block
            },
            _ => None,
        };
        inner.replicas[hidx].fetching = false;
        drop(inner);

        let done = evicted.is_some();
        if let Some(block) = evicted {
            self.allocator.free(block);
            debug!(handle = %handle.id(), node = %candidate.node, "evicted with write-back");
        }
        self.finish_access(&handle, AccessTarget::node(home), AccessMode::ReadWrite, false);
        done
    }
}

fn check_registered(
    handle: &DataHandle,
    inner: &HandleInner,
) -> std::result::Result<(), DataError> {
    if inner.lifecycle != Lifecycle::Registered {
        return Err(DataError::Unregistered(handle.id()));
    }
    if !inner.children.is_empty() {
        return Err(DataError::Partitioned(handle.id()));
    }
    Ok(())
}

fn compatible(
    inner: &HandleInner,
    mode: AccessMode,
) -> bool {
    inner.refcnt == 0 || (mode.is_shareable() && inner.current_mode == Some(mode))
}

/// Grant `mode` right away if nothing is queued and the holders agree.
fn try_grant(
    inner: &mut HandleInner,
    mode: AccessMode,
) -> bool {
    if mode == AccessMode::Scratch {
        return true;
    }
    if !inner.requests.is_empty() || !compatible(inner, mode) {
        return false;
    }
    inner.refcnt += 1;
    inner.current_mode = Some(mode);
    true
}

fn enqueue(
    inner: &mut HandleInner,
    priority: i32,
    mode: AccessMode,
    target: AccessTarget,
    waiter: Waiter,
) {
    let seq = inner.next_request_seq;
    inner.next_request_seq += 1;
    let pos = inner
        .requests
        .iter()
        .position(|r| r.priority < priority)
        .unwrap_or(inner.requests.len());
    inner.requests.insert(
        pos,
        AccessRequest {
            seq,
            priority,
            mode,
            target,
            waiter,
        },
    );
}

/// Pop every head request compatible with the current holders.
fn drain_grantable(inner: &mut HandleInner) -> Vec<AccessRequest> {
    let mut granted = Vec::new();
    while let Some(head) = inner.requests.front() {
        if !compatible(inner, head.mode) {
            break;
        }
        if let Some(request) = inner.requests.pop_front() {
            inner.refcnt += 1;
            inner.current_mode = Some(request.mode);
            granted.push(request);
        }
    }
    granted
}

fn take_if_dead(inner: &mut HandleInner) -> Option<Vec<Storage>> {
    if inner.lifecycle == Lifecycle::LazyUnregister && inner.busy_count == 0 {
        inner.lifecycle = Lifecycle::Destroyed;
        inner.seq.clear();
        Some(inner.take_all_storage())
    } else {
        None
    }
}

fn verify(
    handle: &DataHandle,
    inner: &HandleInner,
) {
    if let Err(e) = inner.check_invariants() {
        fatal(&format!("coherency invariant violated: {e}"), &dump(handle, inner));
    }
}

fn dump(
    handle: &DataHandle,
    inner: &HandleInner,
) -> String {
    format!("{handle:?}\n{inner:#?}")
}
