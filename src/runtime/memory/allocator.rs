//! Node-local storage allocation
//!
//! The allocator hands out [`Storage`] blocks on a given memory node and keeps
//! per-node least-recently-used bookkeeping so the coherency engine can ask
//! for eviction candidates when a node runs out of room.
//!
//! # Design Principles
//! - Simple trait: alloc / free / evict_candidate
//! - No coherency logic, just node memory
//! - Send + Sync for thread safety

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use super::{MemoryNodes, NodeId};
use crate::runtime::error::fatal;

/// Memory allocation error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Not enough memory left on the node
    #[error("out of memory on {node}: requested {requested} bytes")]
    OutOfMemory { node: NodeId, requested: usize },
    /// The node does not exist or is not addressable
    #[error("cannot allocate on {0}")]
    InvalidNode(NodeId),
}

/// Unique id of one storage block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u64);

/// A block of bytes living on one memory node.
///
/// Cloning shares the block. The inner lock only serialises raw byte access;
/// coherency decides who may touch the block at all.
#[derive(Clone)]
pub struct Storage {
    id: StorageId,
    node: NodeId,
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl fmt::Debug for Storage {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Storage")
            .field("id", &self.id.0)
            .field("node", &self.node)
            .field("len", &self.len())
            .finish()
    }
}

impl Storage {
    fn new(
        id: StorageId,
        node: NodeId,
        size: usize,
    ) -> Self {
        Self {
            id,
            node,
            bytes: Arc::new(RwLock::new(vec![0; size])),
        }
    }

    /// Storage id.
    #[inline]
    pub fn id(&self) -> StorageId {
        self.id
    }

    /// Node holding the block.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    /// Whether the block is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared byte access.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bytes.read()
    }

    /// Exclusive byte access.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.bytes.write()
    }

    /// Copy the whole content of `src` into this block.
    pub fn copy_from(
        &self,
        src: &Storage,
    ) {
        if Arc::ptr_eq(&self.bytes, &src.bytes) {
            return;
        }
        let from = src.read();
        let mut to = self.write();
        let n = from.len().min(to.len());
        to[..n].copy_from_slice(&from[..n]);
    }

    /// Whether both values share the same block.
    #[inline]
    pub fn same_block(
        &self,
        other: &Storage,
    ) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

/// A resident block the allocator would like to see evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub node: NodeId,
    pub storage: StorageId,
    /// Opaque tag of the data owning the block (a handle id).
    pub owner: u64,
}

/// Allocator / eviction collaborator used by the coherency engine.
pub trait NodeAllocator: Send + Sync + fmt::Debug {
    /// Allocate `size` zeroed bytes on `node`.
    fn alloc(
        &self,
        node: NodeId,
        size: usize,
    ) -> Result<Storage, AllocError>;

    /// Return a block to its node.
    fn free(
        &self,
        storage: Storage,
    );

    /// Least recently used evictable block on `node`.
    ///
    /// A returned candidate is rotated to the most-recent end so repeated
    /// calls walk through every resident block.
    fn evict_candidate(
        &self,
        node: NodeId,
    ) -> Option<EvictionCandidate>;

    /// Record that `owner` just used `storage`.
    fn touch(
        &self,
        storage: &Storage,
        owner: u64,
    ) {
        let _ = (storage, owner);
    }
}

#[derive(Debug, Default)]
struct NodeArena {
    capacity: Option<usize>,
    used: usize,
    /// Resident blocks, least recently used first.
    lru: IndexMap<StorageId, (usize, u64)>,
}

/// Allocator for simulated node memories.
///
/// Every node is backed by host bytes, with an optional capacity so
/// out-of-memory and eviction paths behave as on a real device.
#[derive(Debug)]
pub struct SimulatedAllocator {
    arenas: Vec<Mutex<NodeArena>>,
    addressable: Vec<bool>,
    next_id: AtomicU64,
    allocations: Vec<AtomicUsize>,
    frees: Vec<AtomicUsize>,
}

impl SimulatedAllocator {
    /// Create arenas for every registered node.
    pub fn new(nodes: &MemoryNodes) -> Self {
        let arenas = nodes
            .iter()
            .map(|n| {
                Mutex::new(NodeArena {
                    capacity: n.capacity,
                    ..NodeArena::default()
                })
            })
            .collect();
        Self {
            arenas,
            addressable: nodes.iter().map(|n| n.is_addressable()).collect(),
            next_id: AtomicU64::new(1),
            allocations: nodes.iter().map(|_| AtomicUsize::new(0)).collect(),
            frees: nodes.iter().map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Bytes currently allocated on `node`.
    pub fn used(
        &self,
        node: NodeId,
    ) -> usize {
        self.arenas.get(node.0).map(|a| a.lock().used).unwrap_or(0)
    }

    /// Blocks currently resident on `node`.
    pub fn resident(
        &self,
        node: NodeId,
    ) -> usize {
        self.arenas.get(node.0).map(|a| a.lock().lru.len()).unwrap_or(0)
    }

    /// Total successful allocations on `node`.
    pub fn allocations(
        &self,
        node: NodeId,
    ) -> usize {
        self.allocations
            .get(node.0)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Total frees on `node`.
    pub fn frees(
        &self,
        node: NodeId,
    ) -> usize {
        self.frees
            .get(node.0)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl NodeAllocator for SimulatedAllocator {
    fn alloc(
        &self,
        node: NodeId,
        size: usize,
    ) -> Result<Storage, AllocError> {
        if !self.addressable.get(node.0).copied().unwrap_or(false) {
            return Err(AllocError::InvalidNode(node));
        }
        let mut arena = self.arenas[node.0].lock();
        if let Some(capacity) = arena.capacity {
            if arena.used + size > capacity {
                return Err(AllocError::OutOfMemory {
                    node,
                    requested: size,
                });
            }
        }
        let id = StorageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        arena.used += size;
        arena.lru.insert(id, (size, 0));
        self.allocations[node.0].fetch_add(1, Ordering::SeqCst);
        Ok(Storage::new(id, node, size))
    }

    fn free(
        &self,
        storage: Storage,
    ) {
        let node = storage.node();
        let mut arena = self.arenas[node.0].lock();
        match arena.lru.shift_remove(&storage.id()) {
            Some((size, _)) => {
                arena.used -= size;
                self.frees[node.0].fetch_add(1, Ordering::SeqCst);
            },
            None => fatal(
                "storage freed twice",
                &format!("{storage:?} is not resident on {node}"),
            ),
        }
    }

    fn evict_candidate(
        &self,
        node: NodeId,
    ) -> Option<EvictionCandidate> {
        let mut arena = self.arenas.get(node.0)?.lock();
        let (id, entry) = arena.lru.shift_remove_index(0)?;
        arena.lru.insert(id, entry);
        Some(EvictionCandidate {
            node,
            storage: id,
            owner: entry.1,
        })
    }

    fn touch(
        &self,
        storage: &Storage,
        owner: u64,
    ) {
        let mut arena = self.arenas[storage.node().0].lock();
        if let Some((size, _)) = arena.lru.shift_remove(&storage.id()) {
            arena.lru.insert(storage.id(), (size, owner));
        }
    }
}
