//! Scheduler 单元测试
//!
//! 测试就绪队列、中心队列策略、DMDA 放置和调度上下文

use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;

use crate::runtime::coherency::CoherencyEngine;
use crate::runtime::error::RuntimeError;
use crate::runtime::memory::{MemoryNodes, NodeId, NodeKind, SimulatedAllocator, HOST_NODE};
use crate::runtime::perfmodel::{HistoryModel, PerfModel};
use crate::runtime::scheduler::{
    build_policy, can_execute, eligible_implementations, select_candidate, Candidate, CentralPolicy,
    ContextRegistry, DmdaPolicy, Estimates, FitnessWeights, JobQueue, PolicyEnv, PriorityJobQueue, ReadyQueue,
    SchedContext, SchedCtxId, SchedulingPolicy, ROOT_CONTEXT,
};
use crate::runtime::task::{Codelet, Job, JobId};
use crate::runtime::worker::{WorkerArch, WorkerId, WorkerInfo};
use crate::util::config::{PolicyKind, SchedulerConfig};

/// Two CPU workers on the host and one CUDA worker on node 1.
struct Machine {
    workers: Vec<Arc<WorkerInfo>>,
    engine: CoherencyEngine,
    model: HistoryModel,
}

impl Machine {
    fn new() -> Self {
        let mut nodes = MemoryNodes::new(None);
        nodes.register(NodeKind::AcceleratorRam, "cuda0", None);
        let nodes = Arc::new(nodes);
        let alloc = Arc::new(SimulatedAllocator::new(&nodes));
        Self {
            workers: vec![
                Arc::new(WorkerInfo::new(WorkerId(0), WorkerArch::Cpu, HOST_NODE)),
                Arc::new(WorkerInfo::new(WorkerId(1), WorkerArch::Cpu, HOST_NODE)),
                Arc::new(WorkerInfo::new(WorkerId(2), WorkerArch::Cuda, NodeId(1))),
            ],
            engine: CoherencyEngine::new(nodes, alloc, 4),
            model: HistoryModel::new(1),
        }
    }

    fn env(
        &self,
        now_us: f64,
    ) -> PolicyEnv<'_> {
        PolicyEnv {
            workers: &self.workers,
            engine: &self.engine,
            model: &self.model,
            now_us,
        }
    }
}

fn job(
    id: u64,
    codelet: &Arc<Codelet>,
    priority: i32,
) -> Arc<Job> {
    Job::new(
        JobId(id),
        None,
        Some(codelet.clone()),
        SmallVec::new(),
        Vec::new(),
        priority,
        ROOT_CONTEXT,
        None,
        None,
        false,
    )
    .unwrap()
}

fn cpu_only() -> Arc<Codelet> {
    Arc::new(Codelet::new("cpu_only").cpu(|_, _| Ok(())))
}

fn cuda_only() -> Arc<Codelet> {
    Arc::new(Codelet::new("cuda_only").cuda(|_, _| Ok(())))
}

fn both() -> Arc<Codelet> {
    Arc::new(Codelet::new("both").cpu(|_, _| Ok(())).cuda(|_, _| Ok(())))
}

fn ids(jobs: &[Arc<Job>]) -> Vec<u64> {
    jobs.iter().map(|j| j.id().inner()).collect()
}

fn cold(
    worker: usize,
    ntasks: usize,
) -> Candidate {
    Candidate {
        worker: WorkerId(worker),
        implementation: 0,
        length_us: None,
        transfer_us: 0.0,
        energy: 0.0,
        exp_end: 0.0,
        ntasks,
    }
}

fn warm(
    worker: usize,
    length_us: f64,
    transfer_us: f64,
    exp_end: f64,
) -> Candidate {
    Candidate {
        worker: WorkerId(worker),
        implementation: 0,
        length_us: Some(length_us),
        transfer_us,
        energy: 0.0,
        exp_end,
        ntasks: 0,
    }
}

#[cfg(test)]
mod queue_tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let cl = cpu_only();
        let q = JobQueue::new();
        q.push(job(1, &cl, 0));
        q.push(job(2, &cl, 9));
        q.push_front(job(3, &cl, 0));
        assert_eq!(q.len(), 3);
        assert_eq!(q.peek_front().map(|j| j.id().inner()), Some(3));
        assert_eq!(ids(&q.drain()), vec![3, 1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_fifo_pop_matching() {
        let cl = cpu_only();
        let q = JobQueue::new();
        for id in 1..=4 {
            q.push(job(id, &cl, 0));
        }
        let even = q.pop_matching(|j| j.id().inner() % 2 == 0).unwrap();
        assert_eq!(even.id().inner(), 2);
        assert!(q.pop_matching(|j| j.id().inner() > 10).is_none());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_priority_then_fifo() {
        let cl = cpu_only();
        let q = PriorityJobQueue::new();
        q.push(job(1, &cl, 0));
        q.push(job(2, &cl, 5));
        q.push(job(3, &cl, 0));
        q.push(job(4, &cl, 5));
        q.push(job(5, &cl, -1));
        assert_eq!(q.pop().map(|j| j.id().inner()), Some(2));
        assert_eq!(ids(&q.drain()), vec![4, 1, 3, 5]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_priority_pop_matching_cleans_levels() {
        let cl = cpu_only();
        let q = PriorityJobQueue::new();
        q.push(job(1, &cl, 3));
        q.push(job(2, &cl, 1));
        let low = q.pop_matching(|j| j.priority() == 1).unwrap();
        assert_eq!(low.id().inner(), 2);
        assert_eq!(q.len(), 1);
        assert!(q.pop().is_some());
        assert!(q.is_empty());
    }

    #[test]
    fn test_ready_queue_variants() {
        let cl = cpu_only();
        let fifo = ReadyQueue::new(false);
        let sorted = ReadyQueue::new(true);
        for (id, prio) in [(1, 0), (2, 7)] {
            fifo.push(job(id, &cl, prio));
            sorted.push(job(id, &cl, prio));
        }
        assert_eq!(fifo.pop().map(|j| j.id().inner()), Some(1));
        assert_eq!(sorted.pop().map(|j| j.id().inner()), Some(2));
        assert_eq!(fifo.len(), 1);
        assert!(!sorted.is_empty());
    }
}

#[cfg(test)]
mod eligibility_tests {
    use super::*;

    #[test]
    fn test_eligible_implementations() {
        let m = Machine::new();
        let j = job(1, &both(), 0);
        assert_eq!(eligible_implementations(&j, &m.workers[0]).as_slice(), &[0]);
        assert_eq!(eligible_implementations(&j, &m.workers[2]).as_slice(), &[1]);
        assert!(can_execute(&j, &m.workers[2]));
        assert!(!can_execute(&job(2, &cuda_only(), 0), &m.workers[0]));
    }
}

#[cfg(test)]
mod central_tests {
    use super::*;

    fn policy(
        m: &Machine,
        p: CentralPolicy,
    ) -> CentralPolicy {
        p.add_workers(&[WorkerId(0), WorkerId(1), WorkerId(2)], &m.env(0.0));
        p
    }

    #[test]
    fn test_eager_pops_first_executable() {
        let m = Machine::new();
        let p = policy(&m, CentralPolicy::eager());
        assert_eq!(p.name(), "eager");
        p.push_task(job(1, &cuda_only(), 0), &m.env(0.0)).unwrap();
        p.push_task(job(2, &cpu_only(), 0), &m.env(0.0)).unwrap();
        assert_eq!(p.queued(), 2);

        let cpu = p.pop_task(WorkerId(0), &m.env(0.0)).unwrap();
        assert_eq!(cpu.id().inner(), 2);
        assert!(p.pop_task(WorkerId(1), &m.env(0.0)).is_none());
        let cuda = p.pop_task(WorkerId(2), &m.env(0.0)).unwrap();
        assert_eq!(cuda.id().inner(), 1);
    }

    #[test]
    fn test_prio_pops_highest_first() {
        let m = Machine::new();
        let p = policy(&m, CentralPolicy::prio());
        let cl = cpu_only();
        p.push_task(job(1, &cl, 1), &m.env(0.0)).unwrap();
        p.push_task(job(2, &cl, 4), &m.env(0.0)).unwrap();
        p.push_task(job(3, &cl, 4), &m.env(0.0)).unwrap();
        let order: Vec<u64> = std::iter::from_fn(|| p.pop_task(WorkerId(0), &m.env(0.0)))
            .map(|j| j.id().inner())
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_rejects_without_capable_worker() {
        let m = Machine::new();
        let p = CentralPolicy::eager();
        p.add_workers(&[WorkerId(0)], &m.env(0.0));
        let rejected = p.push_task(job(1, &cuda_only(), 0), &m.env(0.0)).unwrap_err();
        assert_eq!(rejected.job.id().inner(), 1);
        assert_eq!(p.queued(), 0);
    }

    #[test]
    fn test_last_worker_removal_returns_queue() {
        let m = Machine::new();
        let p = CentralPolicy::eager();
        p.add_workers(&[WorkerId(0), WorkerId(1)], &m.env(0.0));
        p.push_task(job(1, &cpu_only(), 0), &m.env(0.0)).unwrap();
        assert!(p.remove_workers(&[WorkerId(0)]).is_empty());
        assert_eq!(ids(&p.remove_workers(&[WorkerId(1)])), vec![1]);
        assert_eq!(p.queued(), 0);
    }

    #[test]
    fn test_build_policy_names() {
        let config = SchedulerConfig::default();
        assert_eq!(build_policy(PolicyKind::Eager, &config).name(), "eager");
        assert_eq!(build_policy(PolicyKind::Prio, &config).name(), "prio");
        assert_eq!(build_policy(PolicyKind::Dmda, &config).name(), "dmda");
        assert_eq!(build_policy(PolicyKind::Dmdas, &config).name(), "dmdas");
    }
}

#[cfg(test)]
mod select_tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_empty() {
        assert_eq!(select_candidate(&[], FitnessWeights::default(), 0.0), None);
    }

    #[test]
    fn test_cold_candidates_win() {
        let candidates = [warm(0, 1.0, 0.0, 0.0), cold(1, 3), cold(2, 1)];
        assert_eq!(select_candidate(&candidates, FitnessWeights::default(), 0.0), Some(2));
    }

    #[test]
    fn test_cold_tie_goes_to_lowest_worker() {
        let candidates = [cold(3, 0), cold(1, 0), cold(2, 0)];
        assert_eq!(select_candidate(&candidates, FitnessWeights::default(), 0.0), Some(1));
    }

    #[test]
    fn test_earliest_finish_wins() {
        // Worker 0 is busy until 100, worker 1 is free but slower.
        let candidates = [warm(0, 10.0, 0.0, 100.0), warm(1, 50.0, 0.0, 0.0)];
        assert_eq!(select_candidate(&candidates, FitnessWeights::default(), 0.0), Some(1));
    }

    #[test]
    fn test_transfer_penalty() {
        let candidates = [warm(0, 10.0, 30.0, 0.0), warm(1, 10.0, 0.0, 25.0)];
        // Finishes: 40 and 35; worker 1 is ahead on both terms.
        assert_eq!(select_candidate(&candidates, FitnessWeights::default(), 0.0), Some(1));
        let time_only = FitnessWeights {
            alpha: 1.0,
            beta: 0.0,
            gamma: 0.0,
        };
        let candidates = [warm(0, 10.0, 5.0, 0.0), warm(1, 10.0, 0.0, 10.0)];
        assert_eq!(select_candidate(&candidates, time_only, 0.0), Some(0));
    }

    #[test]
    fn test_finish_respects_now() {
        let c = warm(0, 10.0, 5.0, 0.0);
        assert_eq!(c.finish(100.0), 115.0);
        assert_eq!(cold(0, 0).finish(3.0), 3.0);
    }

    /// QuickCheck: with time as the only term, the earliest finish wins,
    /// ties going to the first candidate
    #[quickcheck]
    fn quickcheck_time_only_fitness_picks_earliest_finish(raw: Vec<(u16, u16, u16)>) -> TestResult {
        if raw.is_empty() {
            return TestResult::discard();
        }
        let candidates: Vec<Candidate> = raw
            .iter()
            .enumerate()
            .map(|(i, &(len, xfer, end))| warm(i, len as f64, xfer as f64, end as f64))
            .collect();
        let weights = FitnessWeights {
            alpha: 1.0,
            beta: 0.0,
            gamma: 0.0,
        };
        let Some(chosen) = select_candidate(&candidates, weights, 0.0) else {
            return TestResult::failed();
        };
        let best = candidates
            .iter()
            .map(|c| c.finish(0.0))
            .fold(f64::INFINITY, f64::min);
        let first_best = candidates.iter().position(|c| c.finish(0.0) == best);
        TestResult::from_bool(candidates[chosen].finish(0.0) == best && first_best == Some(chosen))
    }
}

#[cfg(test)]
mod dmda_tests {
    use super::*;

    fn dmda(m: &Machine) -> DmdaPolicy {
        let p = DmdaPolicy::new(FitnessWeights::default(), false, false);
        p.add_workers(&[WorkerId(0), WorkerId(1)], &m.env(0.0));
        p
    }

    #[test]
    fn test_cold_jobs_spread_over_workers() {
        let m = Machine::new();
        let p = dmda(&m);
        let cl = cpu_only();
        p.push_task(job(1, &cl, 0), &m.env(0.0)).unwrap();
        p.push_task(job(2, &cl, 0), &m.env(0.0)).unwrap();
        assert_eq!(p.queued_on(WorkerId(0)), 1);
        assert_eq!(p.queued_on(WorkerId(1)), 1);
        assert_eq!(p.estimates(WorkerId(0)).map(|e| e.ntasks), Some(1));
    }

    #[test]
    fn test_calibrated_jobs_balance_by_finish_time() {
        let m = Machine::new();
        let cl = cpu_only();
        let sample = job(0, &cl, 0);
        m.model
            .record_measurement("cpu_only", sample.footprint(), WorkerArch::Cpu, 0, Duration::from_micros(100));
        let p = dmda(&m);
        for id in 1..=4 {
            p.push_task(job(id, &cl, 0), &m.env(0.0)).unwrap();
        }
        assert_eq!(p.queued_on(WorkerId(0)), 2);
        assert_eq!(p.queued_on(WorkerId(1)), 2);
        let est = p.estimates(WorkerId(0)).unwrap();
        assert!((est.exp_end - 200.0).abs() < 1e-3);
        assert_eq!(est.ntasks, 2);
    }

    #[test]
    fn test_prediction_attached_and_consumed() {
        let m = Machine::new();
        let cl = cpu_only();
        let sample = job(0, &cl, 0);
        m.model
            .record_measurement("cpu_only", sample.footprint(), WorkerArch::Cpu, 0, Duration::from_micros(40));
        let p = dmda(&m);
        let j = job(1, &cl, 0);
        p.push_task(j.clone(), &m.env(0.0)).unwrap();
        let prediction = j.prediction();
        assert_eq!(prediction.implementation, Some(0));
        assert!((prediction.length_us - 40.0).abs() < 1e-3);

        let popped = p.pop_task(WorkerId(0), &m.env(10.0)).unwrap();
        assert_eq!(popped.id(), j.id());
        let est = p.estimates(WorkerId(0)).unwrap();
        assert!((est.exp_start - 50.0).abs() < 1e-3);
        assert!(est.exp_len.abs() < 1e-3);

        p.post_exec_hook(&popped, WorkerId(0), &m.env(45.0));
        let est = p.estimates(WorkerId(0)).unwrap();
        assert_eq!(est.ntasks, 0);
        assert!((est.exp_end - 45.0).abs() < 1e-3);
    }

    #[test]
    fn test_rejects_foreign_arch() {
        let m = Machine::new();
        let p = dmda(&m);
        assert!(p.push_task(job(1, &cuda_only(), 0), &m.env(0.0)).is_err());
        assert_eq!(p.queued(), 0);
    }

    #[test]
    fn test_sorted_queues_pop_by_priority() {
        let m = Machine::new();
        let p = DmdaPolicy::new(FitnessWeights::default(), true, false);
        p.add_workers(&[WorkerId(0)], &m.env(0.0));
        let cl = cpu_only();
        p.push_task(job(1, &cl, 0), &m.env(0.0)).unwrap();
        p.push_task(job(2, &cl, 9), &m.env(0.0)).unwrap();
        assert_eq!(p.pop_task(WorkerId(0), &m.env(0.0)).map(|j| j.id().inner()), Some(2));
    }

    #[test]
    fn test_remove_and_pop_every_task() {
        let m = Machine::new();
        let p = dmda(&m);
        let cl = cpu_only();
        for id in 1..=4 {
            p.push_task(job(id, &cl, 0), &m.env(0.0)).unwrap();
        }
        assert_eq!(p.remove_workers(&[WorkerId(1)]).len(), 2);
        assert_eq!(p.queued(), 2);
        assert_eq!(p.pop_every_task().len(), 2);
        assert_eq!(p.estimates(WorkerId(0)).map(|e| e.ntasks), Some(0));
        assert!(p.estimates(WorkerId(1)).is_none());
    }

    #[test]
    fn test_estimates_refresh_never_moves_back() {
        let mut est = Estimates {
            exp_start: 50.0,
            exp_len: 10.0,
            exp_end: 60.0,
            ntasks: 1,
        };
        est.refresh(20.0);
        assert_eq!(est.exp_start, 50.0);
        est.refresh(80.0);
        assert_eq!(est.exp_start, 80.0);
        assert_eq!(est.exp_end, 90.0);
    }
}

#[cfg(test)]
mod context_tests {
    use super::*;

    fn registry() -> ContextRegistry {
        let root = SchedContext::new(
            ROOT_CONTEXT,
            "root",
            None,
            vec![WorkerId(0), WorkerId(1), WorkerId(2)],
            PolicyKind::Eager,
            Box::new(CentralPolicy::eager()),
        );
        ContextRegistry::new(root)
    }

    #[test]
    fn test_create_child() {
        let reg = registry();
        let ctx = reg
            .create("gpu", ROOT_CONTEXT, vec![WorkerId(2)], PolicyKind::Prio, Box::new(CentralPolicy::prio()))
            .unwrap();
        assert_eq!(ctx.id(), SchedCtxId(1));
        assert_eq!(ctx.parent(), Some(ROOT_CONTEXT));
        assert_eq!(ctx.policy().name(), "prio");
        assert!(ctx.contains(WorkerId(2)));
        assert!(!ctx.contains(WorkerId(0)));
        assert_eq!(reg.live().len(), 2);
    }

    #[test]
    fn test_create_errors() {
        let reg = registry();
        let eager = || -> Box<dyn SchedulingPolicy> { Box::new(CentralPolicy::eager()) };
        assert!(matches!(
            reg.create("x", SchedCtxId(9), vec![WorkerId(0)], PolicyKind::Eager, eager()),
            Err(RuntimeError::UnknownContext(_))
        ));
        assert!(matches!(
            reg.create("x", ROOT_CONTEXT, Vec::new(), PolicyKind::Eager, eager()),
            Err(RuntimeError::InvalidTask(_))
        ));
        let child = reg
            .create("cpu", ROOT_CONTEXT, vec![WorkerId(0)], PolicyKind::Eager, eager())
            .unwrap();
        // A nested context only gets workers of its parent.
        assert!(matches!(
            reg.create("y", child.id(), vec![WorkerId(1)], PolicyKind::Eager, eager()),
            Err(RuntimeError::UnknownWorker(WorkerId(1)))
        ));
    }

    #[test]
    fn test_resolve_falls_back_to_ancestor() {
        let reg = registry();
        let eager = || -> Box<dyn SchedulingPolicy> { Box::new(CentralPolicy::eager()) };
        let a = reg
            .create("a", ROOT_CONTEXT, vec![WorkerId(0), WorkerId(1)], PolicyKind::Eager, eager())
            .unwrap();
        let b = reg
            .create("b", a.id(), vec![WorkerId(1)], PolicyKind::Eager, eager())
            .unwrap();
        reg.remove(a.id()).unwrap();
        assert!(reg.get(a.id()).is_none());
        assert_eq!(reg.resolve(b.id()).map(|c| c.id()), Some(b.id()));
        reg.remove(b.id()).unwrap();
        assert_eq!(reg.resolve(b.id()).map(|c| c.id()), Some(ROOT_CONTEXT));
        assert_eq!(reg.parent_of(b.id()), Some(a.id()));
        assert!(reg.resolve(SchedCtxId(42)).is_none());
    }

    #[test]
    fn test_remove_rules() {
        let reg = registry();
        assert!(matches!(reg.remove(ROOT_CONTEXT), Err(RuntimeError::UnknownContext(_))));
        let ctx = reg
            .create("c", ROOT_CONTEXT, vec![WorkerId(0)], PolicyKind::Eager, Box::new(CentralPolicy::eager()))
            .unwrap();
        assert!(reg.remove(ctx.id()).is_ok());
        assert!(reg.remove(ctx.id()).is_err());
    }

    #[test]
    fn test_containing_newest_first() {
        let reg = registry();
        let eager = || -> Box<dyn SchedulingPolicy> { Box::new(CentralPolicy::eager()) };
        let a = reg
            .create("a", ROOT_CONTEXT, vec![WorkerId(0)], PolicyKind::Eager, eager())
            .unwrap();
        let b = reg
            .create("b", ROOT_CONTEXT, vec![WorkerId(0), WorkerId(1)], PolicyKind::Eager, eager())
            .unwrap();
        let order: Vec<SchedCtxId> = reg.containing(WorkerId(0)).iter().map(|c| c.id()).collect();
        assert_eq!(order, vec![b.id(), a.id(), ROOT_CONTEXT]);
        let order: Vec<SchedCtxId> = reg.containing(WorkerId(2)).iter().map(|c| c.id()).collect();
        assert_eq!(order, vec![ROOT_CONTEXT]);
    }
}
