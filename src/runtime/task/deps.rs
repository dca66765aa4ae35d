//! Implicit and explicit dependencies
//!
//! With sequential consistency, accesses to one handle form groups: a run of
//! `Read` accesses (or of `Redux` accesses) shares a group, every other mode
//! forms a group of one. A new group depends on every member of the previous
//! group; a new member of an existing shared group depends on what that group
//! depended on. `Scratch` accesses never take part.

use std::sync::{Arc, Weak};

use super::job::Job;
use crate::runtime::coherency::AccessMode;

/// Per-handle record of the latest submitted accesses.
#[derive(Debug, Default)]
pub struct SeqState {
    group_mode: Option<AccessMode>,
    group: Vec<Weak<Job>>,
    /// What the current group depends on.
    sync: Vec<Weak<Job>>,
}

impl SeqState {
    /// Record `job` accessing the handle in `mode` and return the jobs it
    /// must wait for.
    pub(crate) fn register(
        &mut self,
        job: &Arc<Job>,
        mode: AccessMode,
    ) -> Vec<Arc<Job>> {
        if mode == AccessMode::Scratch {
            return Vec::new();
        }

        let joins_group = mode.is_shareable() && self.group_mode == Some(mode);
        let predecessors = if joins_group {
            upgrade_all(&self.sync)
        } else {
            let previous = std::mem::take(&mut self.group);
            let preds = upgrade_all(&previous);
            self.sync = previous;
            self.group_mode = Some(mode);
            preds
        };

        self.group.retain(|w| w.strong_count() > 0);
        self.group.push(Arc::downgrade(job));
        predecessors
    }

    /// Forget all recorded accesses.
    pub(crate) fn clear(&mut self) {
        self.group_mode = None;
        self.group.clear();
        self.sync.clear();
    }
}

fn upgrade_all(jobs: &[Weak<Job>]) -> Vec<Arc<Job>> {
    jobs.iter().filter_map(Weak::upgrade).collect()
}

/// Make `succ` wait for `pred`. Returns `false` when `pred` already finished.
pub(crate) fn add_dependency(
    pred: &Arc<Job>,
    succ: &Arc<Job>,
) -> bool {
    if Arc::ptr_eq(pred, succ) {
        return false;
    }
    let mut dependents = pred.dependents.lock();
    if dependents.done {
        return false;
    }
    succ.add_pending();
    dependents.successors.push(succ.clone());
    true
}

/// Close `job`'s successor list and return it.
///
/// After this call no new edge can be attached to `job`.
pub(crate) fn finish(job: &Job) -> Vec<Arc<Job>> {
    let mut dependents = job.dependents.lock();
    dependents.done = true;
    std::mem::take(&mut dependents.successors)
}
