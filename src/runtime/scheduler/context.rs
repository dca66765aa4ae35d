//! Scheduling contexts
//!
//! Contexts form a tree rooted at [`ROOT_CONTEXT`]. A child context schedules
//! on a subset of its parent's workers with its own policy instance. Deleted
//! contexts leave a tombstone so jobs still naming them resolve to the
//! nearest live ancestor.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{SchedCtxId, SchedulingPolicy, ROOT_CONTEXT};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::worker::WorkerId;
use crate::util::config::PolicyKind;

/// One scheduling domain.
pub struct SchedContext {
    id: SchedCtxId,
    name: String,
    parent: Option<SchedCtxId>,
    workers: Vec<WorkerId>,
    kind: PolicyKind,
    policy: Box<dyn SchedulingPolicy>,
}

impl fmt::Debug for SchedContext {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("SchedContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("workers", &self.workers)
            .field("policy", &self.kind)
            .finish()
    }
}

impl SchedContext {
    pub(crate) fn new(
        id: SchedCtxId,
        name: impl Into<String>,
        parent: Option<SchedCtxId>,
        workers: Vec<WorkerId>,
        kind: PolicyKind,
        policy: Box<dyn SchedulingPolicy>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            parent,
            workers,
            kind,
            policy,
        }
    }

    #[inline]
    pub fn id(&self) -> SchedCtxId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn parent(&self) -> Option<SchedCtxId> {
        self.parent
    }

    #[inline]
    pub fn workers(&self) -> &[WorkerId] {
        &self.workers
    }

    #[inline]
    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    #[inline]
    pub fn policy(&self) -> &dyn SchedulingPolicy {
        self.policy.as_ref()
    }

    #[inline]
    pub fn contains(
        &self,
        worker: WorkerId,
    ) -> bool {
        self.workers.contains(&worker)
    }
}

#[derive(Debug)]
struct Slot {
    parent: Option<SchedCtxId>,
    live: Option<Arc<SchedContext>>,
}

/// All contexts of one runtime.
#[derive(Debug)]
pub struct ContextRegistry {
    slots: RwLock<Vec<Slot>>,
}

impl ContextRegistry {
    /// Registry holding only `root`, which must carry [`ROOT_CONTEXT`].
    pub fn new(root: SchedContext) -> Self {
        debug_assert_eq!(root.id, ROOT_CONTEXT);
        Self {
            slots: RwLock::new(vec![Slot {
                parent: None,
                live: Some(Arc::new(root)),
            }]),
        }
    }

    /// Create a child of `parent` scheduling on `workers` with `policy`.
    ///
    /// The workers must be a non-empty subset of the parent's.
    pub fn create(
        &self,
        name: impl Into<String>,
        parent: SchedCtxId,
        workers: Vec<WorkerId>,
        kind: PolicyKind,
        policy: Box<dyn SchedulingPolicy>,
    ) -> Result<Arc<SchedContext>> {
        let name = name.into();
        let mut slots = self.slots.write();
        let parent_ctx = slots
            .get(parent.0)
            .and_then(|s| s.live.clone())
            .ok_or(RuntimeError::UnknownContext(parent))?;
        if workers.is_empty() {
            return Err(RuntimeError::InvalidTask(format!("context {name} has no worker")));
        }
        if let Some(w) = workers.iter().find(|w| !parent_ctx.contains(**w)) {
            return Err(RuntimeError::UnknownWorker(*w));
        }
        let id = SchedCtxId(slots.len());
        let ctx = Arc::new(SchedContext::new(id, name, Some(parent), workers, kind, policy));
        slots.push(Slot {
            parent: Some(parent),
            live: Some(ctx.clone()),
        });
        Ok(ctx)
    }

    /// Live context `id`.
    pub fn get(
        &self,
        id: SchedCtxId,
    ) -> Option<Arc<SchedContext>> {
        self.slots.read().get(id.0).and_then(|s| s.live.clone())
    }

    /// `id` if live, else its nearest live ancestor.
    pub fn resolve(
        &self,
        id: SchedCtxId,
    ) -> Option<Arc<SchedContext>> {
        let slots = self.slots.read();
        let mut current = Some(id);
        while let Some(cur) = current {
            let slot = slots.get(cur.0)?;
            if let Some(ctx) = &slot.live {
                return Some(ctx.clone());
            }
            current = slot.parent;
        }
        None
    }

    /// Parent of `id`, live or not.
    pub fn parent_of(
        &self,
        id: SchedCtxId,
    ) -> Option<SchedCtxId> {
        self.slots.read().get(id.0).and_then(|s| s.parent)
    }

    /// Remove a context, leaving a tombstone. The root cannot be removed.
    pub fn remove(
        &self,
        id: SchedCtxId,
    ) -> Result<Arc<SchedContext>> {
        if id == ROOT_CONTEXT {
            return Err(RuntimeError::UnknownContext(id));
        }
        self.slots
            .write()
            .get_mut(id.0)
            .and_then(|s| s.live.take())
            .ok_or(RuntimeError::UnknownContext(id))
    }

    /// Live contexts containing `worker`, most recently created first.
    pub fn containing(
        &self,
        worker: WorkerId,
    ) -> Vec<Arc<SchedContext>> {
        self.slots
            .read()
            .iter()
            .rev()
            .filter_map(|s| s.live.as_ref())
            .filter(|ctx| ctx.contains(worker))
            .cloned()
            .collect()
    }

    /// All live contexts in creation order.
    pub fn live(&self) -> Vec<Arc<SchedContext>> {
        self.slots
            .read()
            .iter()
            .filter_map(|s| s.live.clone())
            .collect()
    }
}
