//! Inter-node copies and their accounting.

use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::runtime::memory::{NodeId, Storage};

/// Counters for one directed link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkCounters {
    pub copies: usize,
    pub bytes: usize,
}

/// Every copy performed by the coherency engine.
#[derive(Debug, Default)]
pub struct TransferStats {
    links: Mutex<IndexMap<(NodeId, NodeId), LinkCounters>>,
    copies: AtomicUsize,
    bytes: AtomicUsize,
}

impl TransferStats {
    /// Copy `src` into `dst` and account for it.
    pub(crate) fn copy(
        &self,
        src: &Storage,
        dst: &Storage,
    ) {
        dst.copy_from(src);
        let bytes = src.len();
        debug!(src = %src.node(), dst = %dst.node(), bytes, "replica copy");
        self.record(src.node(), dst.node(), bytes);
    }

    fn record(
        &self,
        src: NodeId,
        dst: NodeId,
        bytes: usize,
    ) {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
        let mut links = self.links.lock();
        let entry = links.entry((src, dst)).or_default();
        entry.copies += 1;
        entry.bytes += bytes;
    }

    /// Total copies.
    #[inline]
    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Total copies between distinct nodes.
    pub fn cross_node_copies(&self) -> usize {
        self.links
            .lock()
            .iter()
            .filter(|((s, d), _)| s != d)
            .map(|(_, c)| c.copies)
            .sum()
    }

    /// Total bytes copied.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Copies from `src` to `dst`.
    pub fn between(
        &self,
        src: NodeId,
        dst: NodeId,
    ) -> usize {
        self.links
            .lock()
            .get(&(src, dst))
            .map(|c| c.copies)
            .unwrap_or(0)
    }

    /// Per-link counters in first-use order.
    pub fn snapshot(&self) -> Vec<((NodeId, NodeId), LinkCounters)> {
        self.links.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }
}
