//! Job queues for the scheduling policies
//!
//! Multi-producer, multi-consumer ready queues, FIFO or priority-sorted.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::runtime::task::Job;

/// A thread-safe FIFO of ready jobs.
#[derive(Debug)]
pub struct JobQueue {
    inner: Arc<Mutex<VecDeque<Arc<Job>>>>,
}

impl JobQueue {
    /// Create a new empty queue.
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Push a job to the back of the queue.
    #[inline]
    pub fn push(
        &self,
        job: Arc<Job>,
    ) {
        self.inner.lock().push_back(job);
    }

    /// Push a job to the front of the queue.
    #[inline]
    pub fn push_front(
        &self,
        job: Arc<Job>,
    ) {
        self.inner.lock().push_front(job);
    }

    /// Pop the oldest job.
    #[inline]
    pub fn pop_front(&self) -> Option<Arc<Job>> {
        self.inner.lock().pop_front()
    }

    /// Pop the oldest job accepted by `pred`.
    pub fn pop_matching<F>(
        &self,
        mut pred: F,
    ) -> Option<Arc<Job>>
    where
        F: FnMut(&Job) -> bool,
    {
        let mut inner = self.inner.lock();
        let pos = inner.iter().position(|j| pred(j))?;
        inner.remove(pos)
    }

    /// Peek at the front job without removing it.
    #[inline]
    pub fn peek_front(&self) -> Option<Arc<Job>> {
        self.inner.lock().front().cloned()
    }

    /// Take every queued job, oldest first.
    pub fn drain(&self) -> Vec<Arc<Job>> {
        self.inner.lock().drain(..).collect()
    }

    /// Number of queued jobs.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Clone for JobQueue {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority-sorted job queue.
///
/// Higher priorities pop first; jobs of equal priority pop in push order.
#[derive(Debug)]
pub struct PriorityJobQueue {
    levels: Arc<Mutex<BTreeMap<Reverse<i32>, VecDeque<Arc<Job>>>>>,
}

impl PriorityJobQueue {
    pub fn new() -> Self {
        Self {
            levels: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Push a job at its own priority.
    pub fn push(
        &self,
        job: Arc<Job>,
    ) {
        self.levels
            .lock()
            .entry(Reverse(job.priority()))
            .or_default()
            .push_back(job);
    }

    /// Pop the highest priority job.
    pub fn pop(&self) -> Option<Arc<Job>> {
        self.pop_matching(|_| true)
    }

    /// Pop the highest priority job accepted by `pred`.
    pub fn pop_matching<F>(
        &self,
        mut pred: F,
    ) -> Option<Arc<Job>>
    where
        F: FnMut(&Job) -> bool,
    {
        let mut levels = self.levels.lock();
        let mut found = None;
        for (level, jobs) in levels.iter_mut() {
            if let Some(pos) = jobs.iter().position(|j| pred(j)) {
                found = Some((*level, jobs.remove(pos)));
                break;
            }
        }
        let (level, job) = found?;
        if levels.get(&level).map(VecDeque::is_empty).unwrap_or(false) {
            levels.remove(&level);
        }
        job
    }

    /// Take every queued job, highest priority first.
    pub fn drain(&self) -> Vec<Arc<Job>> {
        let mut levels = self.levels.lock();
        std::mem::take(&mut *levels)
            .into_values()
            .flatten()
            .collect()
    }

    /// Get total number of jobs.
    pub fn len(&self) -> usize {
        self.levels.lock().values().map(VecDeque::len).sum()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.levels.lock().is_empty()
    }
}

impl Default for PriorityJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for PriorityJobQueue {
    fn clone(&self) -> Self {
        Self {
            levels: self.levels.clone(),
        }
    }
}

/// Either queue kind, chosen by the policy variant.
#[derive(Debug, Clone)]
pub enum ReadyQueue {
    Fifo(JobQueue),
    Sorted(PriorityJobQueue),
}

impl ReadyQueue {
    pub fn new(sorted: bool) -> Self {
        if sorted {
            ReadyQueue::Sorted(PriorityJobQueue::new())
        } else {
            ReadyQueue::Fifo(JobQueue::new())
        }
    }

    pub fn push(
        &self,
        job: Arc<Job>,
    ) {
        match self {
            ReadyQueue::Fifo(q) => q.push(job),
            ReadyQueue::Sorted(q) => q.push(job),
        }
    }

    pub fn pop(&self) -> Option<Arc<Job>> {
        match self {
            ReadyQueue::Fifo(q) => q.pop_front(),
            ReadyQueue::Sorted(q) => q.pop(),
        }
    }

    pub fn pop_matching<F>(
        &self,
        pred: F,
    ) -> Option<Arc<Job>>
    where
        F: FnMut(&Job) -> bool,
    {
        match self {
            ReadyQueue::Fifo(q) => q.pop_matching(pred),
            ReadyQueue::Sorted(q) => q.pop_matching(pred),
        }
    }

    pub fn drain(&self) -> Vec<Arc<Job>> {
        match self {
            ReadyQueue::Fifo(q) => q.drain(),
            ReadyQueue::Sorted(q) => q.drain(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ReadyQueue::Fifo(q) => q.len(),
            ReadyQueue::Sorted(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
