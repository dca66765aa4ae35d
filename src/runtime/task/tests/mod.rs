//! Task 单元测试
//!
//! 测试作业校验、状态机、依赖计数和顺序一致性分组

use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::runtime::coherency::{AccessMode, CoherencyEngine};
use crate::runtime::data::{DataHandle, Layout};
use crate::runtime::error::RuntimeError;
use crate::runtime::memory::{MemoryNodes, SimulatedAllocator, HOST_NODE};
use crate::runtime::scheduler::ROOT_CONTEXT;
use crate::runtime::task::deps::{add_dependency, finish};
use crate::runtime::task::{BufferAccess, Codelet, Job, JobId, JobOutcome, JobState, SeqState, TaskBuilder};
use crate::runtime::worker::{WorkerArch, WorkerId};

fn engine() -> CoherencyEngine {
    let nodes = Arc::new(MemoryNodes::new(None));
    let alloc = Arc::new(SimulatedAllocator::new(&nodes));
    CoherencyEngine::new(nodes, alloc, 4)
}

fn handle(engine: &CoherencyEngine) -> DataHandle {
    engine
        .register(Layout::vector_of::<u32>(4), HOST_NODE, None)
        .unwrap()
}

fn noop() -> Arc<Codelet> {
    Arc::new(Codelet::new("noop").cpu(|_, _| Ok(())))
}

fn job_with(
    id: u64,
    codelet: Option<Arc<Codelet>>,
    buffers: SmallVec<[BufferAccess; 4]>,
) -> crate::runtime::error::Result<Arc<Job>> {
    Job::new(
        JobId(id),
        None,
        codelet,
        buffers,
        Vec::new(),
        0,
        ROOT_CONTEXT,
        None,
        None,
        false,
    )
}

fn control(id: u64) -> Arc<Job> {
    job_with(id, None, SmallVec::new()).unwrap()
}

fn access(
    handle: &DataHandle,
    mode: AccessMode,
) -> BufferAccess {
    BufferAccess {
        handle: handle.clone(),
        mode,
    }
}

#[cfg(test)]
mod job_tests {
    use super::*;

    #[test]
    fn test_default_names() {
        assert_eq!(control(7).name(), "control#7");
        let job = job_with(3, Some(noop()), SmallVec::new()).unwrap();
        assert_eq!(job.name(), "noop#3");
        assert_eq!(JobId(3).to_string(), "Job(3)");
    }

    #[test]
    fn test_control_job_rejects_buffers() {
        let engine = engine();
        let h = handle(&engine);
        let err = job_with(1, None, smallvec![access(&h, AccessMode::Read)]).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidTask(_)));
    }

    #[test]
    fn test_acquisition_may_carry_a_buffer() {
        let engine = engine();
        let h = handle(&engine);
        let job = Job::new(
            JobId(1),
            None,
            None,
            smallvec![access(&h, AccessMode::Read)],
            Vec::new(),
            0,
            ROOT_CONTEXT,
            None,
            None,
            true,
        )
        .unwrap();
        assert!(job.is_acquisition());
    }

    #[test]
    fn test_codelet_without_implementation() {
        let empty = Arc::new(Codelet::new("empty"));
        assert!(matches!(
            job_with(1, Some(empty), SmallVec::new()),
            Err(RuntimeError::InvalidTask(_))
        ));
    }

    #[test]
    fn test_buffer_count_must_match() {
        let engine = engine();
        let h = handle(&engine);
        let two = Arc::new(Codelet::new("two").nbuffers(2).cpu(|_, _| Ok(())));
        assert!(matches!(
            job_with(1, Some(two), smallvec![access(&h, AccessMode::Read)]),
            Err(RuntimeError::InvalidTask(_))
        ));
    }

    #[test]
    fn test_duplicate_handle_rejected() {
        let engine = engine();
        let h = handle(&engine);
        let err = job_with(
            1,
            Some(noop()),
            smallvec![access(&h, AccessMode::Read), access(&h, AccessMode::Write)],
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidTask(_)));
    }

    #[test]
    fn test_fetch_order_sorted_by_handle() {
        let engine = engine();
        let a = handle(&engine);
        let b = handle(&engine);
        let c = handle(&engine);
        let job = job_with(
            1,
            Some(noop()),
            smallvec![
                access(&c, AccessMode::Read),
                access(&a, AccessMode::Write),
                access(&b, AccessMode::Read)
            ],
        )
        .unwrap();
        assert_eq!(job.fetch_order(), &[1, 2, 0]);
        assert_eq!(job.buffers()[0].handle, c);
    }

    #[test]
    fn test_state_conversions() {
        for state in [
            JobState::Created,
            JobState::Submitted,
            JobState::Blocked,
            JobState::Ready,
            JobState::Scheduled,
            JobState::Executing,
            JobState::Completed,
            JobState::Aborted,
        ] {
            assert_eq!(JobState::from_u8(state.as_u8()), state);
        }
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Aborted.is_terminal());
        assert!(!JobState::Executing.is_terminal());
        assert!(JobState::Scheduled.is_runnable());
        assert!(!JobState::Blocked.is_runnable());
        assert!(!JobState::Aborted.is_runnable());
    }

    #[test]
    fn test_mark_terminal_once() {
        let job = control(1);
        assert_eq!(job.state(), JobState::Created);
        job.set_state(JobState::Executing);
        assert_eq!(job.mark_terminal(JobState::Completed), Some(JobState::Executing));
        assert_eq!(job.mark_terminal(JobState::Aborted), None);
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn test_outcome_set_once() {
        let job = control(1);
        assert!(job.outcome().is_none());
        job.set_outcome(JobOutcome::Failed(3));
        job.set_outcome(JobOutcome::Success);
        assert_eq!(job.outcome(), Some(&JobOutcome::Failed(3)));
        assert_eq!(job.wait_outcome(), &JobOutcome::Failed(3));
        assert!(!JobOutcome::Failed(3).is_success());
    }

    #[test]
    fn test_retries_counted() {
        let job = control(1);
        job.record_retry();
        job.record_retry();
        assert_eq!(job.retries(), 2);
    }
}

#[cfg(test)]
mod dependency_tests {
    use super::*;

    #[test]
    fn test_submission_guard() {
        let job = control(1);
        assert_eq!(job.pending_dependencies(), 1);
        assert!(job.on_dependency_satisfied());
    }

    #[test]
    fn test_edge_counts_until_finished() {
        let pred = control(1);
        let succ = control(2);
        assert!(add_dependency(&pred, &succ));
        assert_eq!(succ.pending_dependencies(), 2);

        let released = finish(&pred);
        assert_eq!(released.len(), 1);
        assert!(!released[0].on_dependency_satisfied());
        assert!(succ.on_dependency_satisfied());
    }

    #[test]
    fn test_no_edge_to_finished_or_self() {
        let pred = control(1);
        let succ = control(2);
        assert!(!add_dependency(&succ, &succ));
        finish(&pred);
        assert!(!add_dependency(&pred, &succ));
        assert_eq!(succ.pending_dependencies(), 1);
    }
}

#[cfg(test)]
mod seq_tests {
    use super::*;

    fn ids(jobs: Vec<Arc<Job>>) -> Vec<u64> {
        let mut ids: Vec<u64> = jobs.iter().map(|j| j.id().inner()).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_read_after_write() {
        let mut seq = SeqState::default();
        let w = control(1);
        let r = control(2);
        assert!(seq.register(&w, AccessMode::Write).is_empty());
        assert_eq!(ids(seq.register(&r, AccessMode::Read)), vec![1]);
    }

    #[test]
    fn test_readers_share_a_group() {
        let mut seq = SeqState::default();
        let w = control(1);
        let r1 = control(2);
        let r2 = control(3);
        let w2 = control(4);
        seq.register(&w, AccessMode::Write);
        assert_eq!(ids(seq.register(&r1, AccessMode::Read)), vec![1]);
        // A second reader waits for the writer, not for the first reader.
        assert_eq!(ids(seq.register(&r2, AccessMode::Read)), vec![1]);
        // The next writer waits for the whole read group.
        assert_eq!(ids(seq.register(&w2, AccessMode::ReadWrite)), vec![2, 3]);
    }

    #[test]
    fn test_writers_chain() {
        let mut seq = SeqState::default();
        let a = control(1);
        let b = control(2);
        let c = control(3);
        seq.register(&a, AccessMode::ReadWrite);
        assert_eq!(ids(seq.register(&b, AccessMode::ReadWrite)), vec![1]);
        assert_eq!(ids(seq.register(&c, AccessMode::Write)), vec![2]);
    }

    #[test]
    fn test_redux_group_then_reader() {
        let mut seq = SeqState::default();
        let a = control(1);
        let b = control(2);
        let r = control(3);
        assert!(seq.register(&a, AccessMode::Redux).is_empty());
        assert!(seq.register(&b, AccessMode::Redux).is_empty());
        assert_eq!(ids(seq.register(&r, AccessMode::Read)), vec![1, 2]);
    }

    #[test]
    fn test_scratch_is_ignored() {
        let mut seq = SeqState::default();
        let w = control(1);
        let s = control(2);
        let r = control(3);
        seq.register(&w, AccessMode::Write);
        assert!(seq.register(&s, AccessMode::Scratch).is_empty());
        assert_eq!(ids(seq.register(&r, AccessMode::Read)), vec![1]);
    }

    #[test]
    fn test_dropped_jobs_are_skipped() {
        let mut seq = SeqState::default();
        {
            let w = control(1);
            seq.register(&w, AccessMode::Write);
        }
        let r = control(2);
        assert!(seq.register(&r, AccessMode::Read).is_empty());
        seq.clear();
        let w = control(3);
        assert!(seq.register(&w, AccessMode::Write).is_empty());
    }
}

#[cfg(test)]
mod codelet_tests {
    use super::*;

    #[test]
    fn test_eligibility_by_arch() {
        let cl = Codelet::new("k").cpu(|_, _| Ok(())).cuda(|_, _| Ok(()));
        assert!(cl.can_run_on(WorkerArch::Cpu));
        assert!(cl.can_run_on(WorkerArch::Cuda));
        assert!(!cl.can_run_on(WorkerArch::OpenCl));
        assert_eq!(cl.implementations().len(), 2);
    }

    #[test]
    fn test_can_execute_filter() {
        let cl = Codelet::new("k")
            .cpu(|_, _| Ok(()))
            .cpu(|_, _| Ok(()))
            .can_execute(|_, i| i == 1);
        let eligible: Vec<usize> = cl.eligible(WorkerArch::Cpu).map(|(i, _)| i).collect();
        assert_eq!(eligible, vec![1]);
    }

    #[test]
    fn test_builder_collects_options() {
        let engine = engine();
        let h = handle(&engine);
        let b = TaskBuilder::new(&noop())
            .read_write(&h)
            .scalar_args(&[1u32, 2])
            .priority(5)
            .name("step")
            .on_worker(WorkerId(1));
        assert_eq!(b.buffers.len(), 1);
        assert_eq!(b.buffers[0].mode, AccessMode::ReadWrite);
        assert_eq!(b.args.len(), 8);
        assert_eq!(b.priority, 5);
        assert_eq!(b.name.as_deref(), Some("step"));
        assert_eq!(b.worker, Some(WorkerId(1)));
        assert_eq!(b.sched_ctx, ROOT_CONTEXT);
        assert!(TaskBuilder::control().codelet.is_none());
    }
}
