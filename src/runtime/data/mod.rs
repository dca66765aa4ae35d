//! Data handles and replicas
//!
//! A [`DataHandle`] names one logical buffer. It owns one [`Replica`] per
//! memory node, plus per-worker scratch and reduction blocks, all inside a
//! single header lock. The handle is reference counted; its node storage is
//! returned to the allocator only once `busy_count` has dropped to zero after
//! an unregistration request.
//!
//! - [`Layout`](layout::Layout) - shape and footprint of a buffer
//! - [`Filter`](partition::Filter) - how a handle is split into children
//! - [`ReplicaState`] - OWNER / SHARED / INVALID

pub mod layout;
pub mod partition;

pub use layout::{decode, encode, Element, Footprint, Layout};
pub use partition::Filter;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::runtime::coherency::{AccessMode, AccessRequest, ReductionOps};
use crate::runtime::memory::{NodeId, Storage};
use crate::runtime::task::SeqState;
use crate::runtime::worker::WorkerId;

/// Unique handle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Coherency state of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaState {
    /// Sole valid copy.
    Owner,
    /// One of several read-only valid copies.
    Shared,
    /// Stale.
    Invalid,
}

impl ReplicaState {
    /// Whether the replica holds usable data.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !matches!(self, ReplicaState::Invalid)
    }
}

/// The copy of a handle on one memory node.
#[derive(Debug)]
pub(crate) struct Replica {
    pub(crate) state: ReplicaState,
    /// `Some` once allocated.
    pub(crate) storage: Option<Storage>,
    /// Holders and in-flight copies pinning this replica.
    pub(crate) refcnt: usize,
    /// A transfer into this replica is in flight.
    pub(crate) fetching: bool,
}

impl Replica {
    fn empty() -> Self {
        Self {
            state: ReplicaState::Invalid,
            storage: None,
            refcnt: 0,
            fetching: false,
        }
    }
}

/// Registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Registered,
    /// Destroy as soon as `busy_count` reaches zero.
    LazyUnregister,
    /// A synchronous unregistration waits for `busy_count`.
    Unregistering,
    Destroyed,
}

/// State guarded by the header lock.
pub(crate) struct HandleInner {
    pub(crate) replicas: Vec<Replica>,
    pub(crate) scratch: HashMap<WorkerId, Storage>,
    /// Per-worker reduction contributions not yet folded.
    pub(crate) redux: HashMap<WorkerId, Storage>,
    pub(crate) reduction: Option<ReductionOps>,
    /// A reduction fold is in progress.
    pub(crate) folding: bool,
    /// Granted, unreleased accesses.
    pub(crate) refcnt: usize,
    /// Holders + queued requests + submitted jobs.
    pub(crate) busy_count: usize,
    pub(crate) current_mode: Option<AccessMode>,
    pub(crate) requests: VecDeque<AccessRequest>,
    pub(crate) next_request_seq: u64,
    pub(crate) sequential_consistency: bool,
    pub(crate) seq: SeqState,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) children: Vec<DataHandle>,
}

impl fmt::Debug for HandleInner {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("HandleInner")
            .field("states", &self.states())
            .field("refcnt", &self.refcnt)
            .field("busy_count", &self.busy_count)
            .field("current_mode", &self.current_mode)
            .field("queued", &self.requests.len())
            .field("lifecycle", &self.lifecycle)
            .field("children", &self.children.len())
            .finish()
    }
}

impl HandleInner {
    pub(crate) fn new(num_nodes: usize) -> Self {
        Self {
            replicas: (0..num_nodes).map(|_| Replica::empty()).collect(),
            scratch: HashMap::new(),
            redux: HashMap::new(),
            reduction: None,
            folding: false,
            refcnt: 0,
            busy_count: 0,
            current_mode: None,
            requests: VecDeque::new(),
            next_request_seq: 0,
            sequential_consistency: true,
            seq: SeqState::default(),
            lifecycle: Lifecycle::Registered,
            children: Vec::new(),
        }
    }

    /// Replica states in node order.
    pub(crate) fn states(&self) -> Vec<ReplicaState> {
        self.replicas.iter().map(|r| r.state).collect()
    }

    /// Check the mutual exclusion and read sharing invariants.
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        let owners = self
            .replicas
            .iter()
            .filter(|r| r.state == ReplicaState::Owner)
            .count();
        let shared = self
            .replicas
            .iter()
            .filter(|r| r.state == ReplicaState::Shared)
            .count();
        if owners > 1 {
            return Err(format!("{owners} OWNER replicas"));
        }
        if owners == 1 && shared > 0 {
            return Err(format!("OWNER replica next to {shared} SHARED"));
        }
        if let Some(i) = self
            .replicas
            .iter()
            .position(|r| r.state.is_valid() && r.storage.is_none())
        {
            return Err(format!("valid replica on node{i} without storage"));
        }
        Ok(())
    }

    /// Whether any replica holds valid data.
    pub(crate) fn has_valid_copy(&self) -> bool {
        self.replicas.iter().any(|r| r.state.is_valid())
    }

    /// Take every storage block still held.
    pub(crate) fn take_all_storage(&mut self) -> Vec<Storage> {
        let mut blocks: Vec<Storage> = self
            .replicas
            .iter_mut()
            .filter_map(|r| {
                r.state = ReplicaState::Invalid;
                r.storage.take()
            })
            .collect();
        blocks.extend(self.scratch.drain().map(|(_, s)| s));
        blocks.extend(self.redux.drain().map(|(_, s)| s));
        blocks
    }
}

/// Shared part of a handle.
pub(crate) struct HandleShared {
    pub(crate) id: HandleId,
    pub(crate) layout: Layout,
    pub(crate) home: NodeId,
    pub(crate) footprint: Footprint,
    pub(crate) parent: Option<Weak<HandleShared>>,
    pub(crate) inner: Mutex<HandleInner>,
    /// Signalled on every release, end of transfer and end of fold.
    pub(crate) changed: Condvar,
}

/// Logical identifier of one registered buffer.
#[derive(Clone)]
pub struct DataHandle(pub(crate) Arc<HandleShared>);

impl fmt::Debug for DataHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("DataHandle")
            .field("id", &self.0.id)
            .field("layout", &self.0.layout)
            .field("home", &self.0.home)
            .finish()
    }
}

impl PartialEq for DataHandle {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for DataHandle {}

impl DataHandle {
    pub(crate) fn new(
        id: HandleId,
        layout: Layout,
        home: NodeId,
        num_nodes: usize,
        parent: Option<&DataHandle>,
    ) -> Self {
        DataHandle(Arc::new(HandleShared {
            id,
            layout,
            home,
            footprint: layout.footprint(),
            parent: parent.map(|p| Arc::downgrade(&p.0)),
            inner: Mutex::new(HandleInner::new(num_nodes)),
            changed: Condvar::new(),
        }))
    }

    /// Handle id.
    #[inline]
    pub fn id(&self) -> HandleId {
        self.0.id
    }

    /// Buffer layout.
    #[inline]
    pub fn layout(&self) -> Layout {
        self.0.layout
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.layout.size()
    }

    /// Home memory node.
    #[inline]
    pub fn home(&self) -> NodeId {
        self.0.home
    }

    /// Content-layout hash.
    #[inline]
    pub fn footprint(&self) -> Footprint {
        self.0.footprint
    }

    /// Parent handle when this is a partition child.
    pub fn parent(&self) -> Option<DataHandle> {
        self.0.parent.as_ref().and_then(Weak::upgrade).map(DataHandle)
    }

    /// Children of a partitioned handle.
    pub fn children(&self) -> Vec<DataHandle> {
        self.lock().children.clone()
    }

    /// Enable or disable implicit ordering of accesses to this handle.
    pub fn set_sequential_consistency(
        &self,
        enabled: bool,
    ) {
        self.lock().sequential_consistency = enabled;
    }

    /// Whether implicit ordering is enabled.
    pub fn sequential_consistency(&self) -> bool {
        self.lock().sequential_consistency
    }

    /// Current replica states in node order.
    pub fn replica_states(&self) -> Vec<ReplicaState> {
        self.lock().states()
    }

    /// Point-in-time view of the coherency bookkeeping.
    pub fn snapshot(&self) -> HandleSnapshot {
        let inner = self.lock();
        HandleSnapshot {
            states: inner.states(),
            allocated: inner.replicas.iter().map(|r| r.storage.is_some()).collect(),
            refcnt: inner.refcnt,
            busy_count: inner.busy_count,
            queued: inner.requests.len(),
            current_mode: inner.current_mode,
            unregistered: inner.lifecycle != Lifecycle::Registered,
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.0.inner.lock()
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleShared> {
        Arc::downgrade(&self.0)
    }
}

/// Snapshot returned by [`DataHandle::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub states: Vec<ReplicaState>,
    pub allocated: Vec<bool>,
    pub refcnt: usize,
    pub busy_count: usize,
    pub queued: usize,
    pub current_mode: Option<AccessMode>,
    pub unregistered: bool,
}
