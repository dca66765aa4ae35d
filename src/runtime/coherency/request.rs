//! Access modes, requests and grants
//!
//! An access goes through two steps. Arbitration yields a [`Granted`] token
//! once the handle's current holders are compatible with the requested mode;
//! fetching turns the token into an [`Access`] whose storage is coherent on
//! the target node. A request that cannot be arbitrated immediately is queued
//! on the handle and resolved by whichever thread releases the conflicting
//! holder, either through an [`AccessFuture`] or through a callback.

use std::fmt;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::runtime::data::{DataHandle, Element};
use crate::runtime::error::DataError;
use crate::runtime::memory::{NodeId, Storage};
use crate::runtime::task::BufferView;
use crate::runtime::worker::WorkerId;

/// How a job or application accesses a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AccessMode {
    Read,
    /// Overwrite without reading: no copy-in.
    Write,
    ReadWrite,
    /// Per-worker uninitialised block, outside coherency.
    Scratch,
    /// Per-worker contribution folded by the handle's reduction methods.
    Redux,
}

impl AccessMode {
    /// Whether prior content must be visible.
    #[inline]
    pub fn reads(&self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    /// Whether the access needs exclusive ownership of the main replicas.
    #[inline]
    pub fn is_exclusive(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }

    /// Whether concurrent holders of the same mode may share the handle.
    #[inline]
    pub fn is_shareable(&self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::Redux)
    }

    /// Whether the access is bound to a worker rather than a node replica.
    #[inline]
    pub fn is_per_worker(&self) -> bool {
        matches!(self, AccessMode::Scratch | AccessMode::Redux)
    }
}

/// Where an access lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessTarget {
    pub node: NodeId,
    /// Required for scratch and reduction accesses.
    pub worker: Option<WorkerId>,
}

impl AccessTarget {
    /// Access from outside any worker.
    #[inline]
    pub fn node(node: NodeId) -> Self {
        Self { node, worker: None }
    }

    /// Access on behalf of `worker`, attached to `node`.
    #[inline]
    pub fn worker(
        worker: WorkerId,
        node: NodeId,
    ) -> Self {
        Self {
            node,
            worker: Some(worker),
        }
    }
}

/// How a queued request is resolved.
pub(crate) enum Waiter {
    Future(oneshot::Sender<Granted>),
    Callback(Box<dyn FnOnce(Granted) + Send>),
}

/// A queued access waiting for incompatible holders to release.
pub(crate) struct AccessRequest {
    pub(crate) seq: u64,
    pub(crate) priority: i32,
    pub(crate) mode: AccessMode,
    pub(crate) target: AccessTarget,
    pub(crate) waiter: Waiter,
}

impl fmt::Debug for AccessRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("AccessRequest")
            .field("seq", &self.seq)
            .field("priority", &self.priority)
            .field("mode", &self.mode)
            .field("target", &self.target)
            .finish()
    }
}

/// Arbitration passed; the data still has to be fetched.
#[must_use = "a grant must be fetched or cancelled"]
#[derive(Debug)]
pub struct Granted {
    pub(crate) handle: DataHandle,
    pub(crate) target: AccessTarget,
    pub(crate) mode: AccessMode,
}

impl Granted {
    #[inline]
    pub fn handle(&self) -> &DataHandle {
        &self.handle
    }

    #[inline]
    pub fn target(&self) -> AccessTarget {
        self.target
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }
}

/// A fetched access: the storage is coherent on the target node.
#[must_use = "an access must be released"]
#[derive(Debug)]
pub struct Access {
    pub(crate) handle: DataHandle,
    pub(crate) target: AccessTarget,
    pub(crate) mode: AccessMode,
    pub(crate) storage: Storage,
}

impl Access {
    #[inline]
    pub fn handle(&self) -> &DataHandle {
        &self.handle
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Node holding the storage.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.storage.node()
    }

    /// Node-local storage.
    #[inline]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Open the storage as a kernel would see it.
    pub fn view(&self) -> BufferView<'_> {
        BufferView::open(&self.storage, self.handle.layout(), self.mode)
    }

    /// Copy of the raw content.
    pub fn bytes(&self) -> Vec<u8> {
        self.storage.read().clone()
    }

    /// Decoded content.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        crate::runtime::data::decode(&self.storage.read())
    }
}

/// Resolves once a queued request has been granted.
#[derive(Debug)]
pub struct AccessFuture {
    pub(crate) rx: oneshot::Receiver<Granted>,
    pub(crate) handle: DataHandle,
}

impl AccessFuture {
    /// Non-blocking poll.
    pub fn try_take(&mut self) -> Option<Result<Granted, DataError>> {
        match self.rx.try_recv() {
            Ok(granted) => Some(Ok(granted)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(DataError::Unregistered(self.handle.id())))
            },
        }
    }

    /// Block the calling thread until granted.
    pub fn wait(self) -> Result<Granted, DataError> {
        let id = self.handle.id();
        self.rx.blocking_recv().map_err(|_| DataError::Unregistered(id))
    }
}

/// The access could not be granted immediately.
#[derive(Debug)]
pub struct Pending(pub AccessFuture);
