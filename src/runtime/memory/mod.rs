//! Memory node registry
//!
//! Every address space the runtime can place data in is a memory node: host
//! RAM (always node 0), one node per accelerator, and optional disk nodes.
//! Nodes are immutable once registered. The bus table records, for every
//! ordered pair of nodes, the latency and bandwidth used to predict copies.

mod allocator;

pub use allocator::{AllocError, EvictionCandidate, NodeAllocator, SimulatedAllocator, Storage, StorageId};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::util::config::BusConfig;

/// Identifier of a memory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    /// Index into per-node tables.
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Host RAM is always registered first.
pub const HOST_NODE: NodeId = NodeId(0);

/// Kind of address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Main memory.
    HostRam,
    /// Memory attached to one accelerator.
    AcceleratorRam,
    /// Out-of-core storage. Never hosts a worker.
    Disk,
}

/// One registered address space.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    /// Capacity in bytes, `None` when unbounded.
    pub capacity: Option<usize>,
}

impl MemoryNode {
    /// Whether a codelet can address data placed on this node.
    #[inline]
    pub fn is_addressable(&self) -> bool {
        self.kind != NodeKind::Disk
    }
}

/// Latency and bandwidth of one directed link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BusLink {
    /// Fixed cost per transfer, in microseconds.
    pub latency_us: f64,
    /// Bytes per microsecond.
    pub bandwidth: f64,
}

impl BusLink {
    const LOCAL: BusLink = BusLink {
        latency_us: 0.0,
        bandwidth: f64::INFINITY,
    };

    /// Predicted time to move `size` bytes over this link.
    #[inline]
    pub fn predict(
        &self,
        size: usize,
    ) -> f64 {
        self.latency_us + size as f64 / self.bandwidth
    }

    /// Two hops routed through host RAM.
    fn chain(
        first: BusLink,
        second: BusLink,
    ) -> BusLink {
        BusLink {
            latency_us: first.latency_us + second.latency_us,
            bandwidth: first.bandwidth.min(second.bandwidth),
        }
    }
}

/// Process-wide (per runtime instance) table of memory nodes.
#[derive(Debug, Clone, Default)]
pub struct MemoryNodes {
    nodes: Vec<MemoryNode>,
    /// `links[src][dst]`
    links: Vec<Vec<BusLink>>,
}

impl MemoryNodes {
    /// Create a registry holding only host RAM.
    pub fn new(host_capacity: Option<usize>) -> Self {
        let mut nodes = Self::default();
        nodes.register(NodeKind::HostRam, "ram", host_capacity);
        nodes
    }

    /// Register a node. Links are filled by [`MemoryNodes::calibrate_bus`].
    pub fn register(
        &mut self,
        kind: NodeKind,
        name: impl Into<String>,
        capacity: Option<usize>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(MemoryNode {
            id,
            kind,
            name: name.into(),
            capacity,
        });
        for row in &mut self.links {
            row.push(BusLink::LOCAL);
        }
        self.links.push(vec![BusLink::LOCAL; self.nodes.len()]);
        id
    }

    /// Fill the bus table from the configured link characteristics.
    ///
    /// Host links are direct; accelerator-to-accelerator and disk traffic is
    /// routed through host RAM.
    pub fn calibrate_bus(
        &mut self,
        bus: &BusConfig,
    ) {
        let direct = |kind: NodeKind| match kind {
            NodeKind::HostRam => BusLink::LOCAL,
            NodeKind::AcceleratorRam => BusLink {
                latency_us: bus.accelerator_latency_us,
                bandwidth: bus.accelerator_bandwidth,
            },
            NodeKind::Disk => BusLink {
                latency_us: bus.disk_latency_us,
                bandwidth: bus.disk_bandwidth,
            },
        };

        let n = self.nodes.len();
        for src in 0..n {
            for dst in 0..n {
                let link = if src == dst {
                    BusLink::LOCAL
                } else {
                    let (a, b) = (self.nodes[src].kind, self.nodes[dst].kind);
                    match (a, b) {
                        (NodeKind::HostRam, other) => direct(other),
                        (other, NodeKind::HostRam) => direct(other),
                        _ => BusLink::chain(direct(a), direct(b)),
                    }
                };
                self.links[src][dst] = link;
            }
        }
    }

    /// Number of registered nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no node is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node.
    #[inline]
    pub fn get(
        &self,
        id: NodeId,
    ) -> Option<&MemoryNode> {
        self.nodes.get(id.0)
    }

    /// All nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryNode> {
        self.nodes.iter()
    }

    /// Whether `id` names a node that can hold addressable data.
    pub fn is_valid_target(
        &self,
        id: NodeId,
    ) -> bool {
        self.get(id).map(MemoryNode::is_addressable).unwrap_or(false)
    }

    /// Link from `src` to `dst`.
    #[inline]
    pub fn link(
        &self,
        src: NodeId,
        dst: NodeId,
    ) -> BusLink {
        self.links[src.0][dst.0]
    }

    /// Predicted copy time in microseconds.
    #[inline]
    pub fn predict_transfer(
        &self,
        src: NodeId,
        dst: NodeId,
        size: usize,
    ) -> f64 {
        if src == dst {
            return 0.0;
        }
        self.link(src, dst).predict(size)
    }
}
