//! How codelet results, pinning and rejections reach the application.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use codelet_rt::{
    AccessMode, Codelet, JobOutcome, KernelError, PolicyKind, Runtime, RuntimeError, TaskBuilder, WorkerArch,
    WorkerId,
};

use crate::common::{config, increment, increment_cuda, runtime, thread_name};

#[test]
fn test_failure_reaches_callback_and_waiter() {
    let rt = runtime(1, 0, PolicyKind::Eager);
    let failing = Arc::new(Codelet::new("failing").cpu(|_, _| Err(KernelError::Failed(7))));
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let job = rt
        .submit(TaskBuilder::new(&failing).callback(move |outcome| *sink.lock() = Some(outcome.clone())))
        .unwrap();
    assert_eq!(job.wait().unwrap(), JobOutcome::Failed(7));
    assert_eq!(*seen.lock(), Some(JobOutcome::Failed(7)));
    assert_eq!(rt.stats().failed, 1);
}

#[test]
fn test_failed_job_still_releases_successors() {
    let rt = runtime(1, 0, PolicyKind::Eager);
    let h = rt.register_vector(&[0u32]).unwrap();
    let failing = Arc::new(Codelet::new("failing").nbuffers(1).cpu(|_, _| Err(KernelError::Failed(1))));
    rt.submit(TaskBuilder::new(&failing).read_write(&h)).unwrap();
    let next = rt.submit(TaskBuilder::new(&increment()).read_write(&h)).unwrap();
    assert!(next.wait().unwrap().is_success());
    assert_eq!(rt.unregister_vector::<u32>(&h).unwrap(), vec![1]);
}

#[test]
fn test_try_again_is_retried() {
    let rt = runtime(2, 0, PolicyKind::Dmda);
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let flaky = Arc::new(Codelet::new("flaky").cpu(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(KernelError::TryAgain)
        } else {
            Ok(())
        }
    }));
    let job = rt.submit(TaskBuilder::new(&flaky)).unwrap();
    assert_eq!(job.wait().unwrap(), JobOutcome::Success);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(job.job().retries(), 2);
    assert_eq!(rt.stats().retried, 2);
}

#[test]
fn test_pinned_jobs_run_on_their_worker() {
    let rt = runtime(3, 0, PolicyKind::Dmda);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let recorder = Arc::new(Codelet::new("recorder").cpu(move |_, _| {
        sink.lock().push(thread_name());
        Ok(())
    }));
    for _ in 0..5 {
        rt.submit(TaskBuilder::new(&recorder).on_worker(WorkerId(2))).unwrap();
    }
    rt.wait_for_all();
    assert_eq!(seen.lock().len(), 5);
    assert!(seen.lock().iter().all(|name| name == "codelet-cpu-2"));
    assert_eq!(rt.worker(WorkerId(2)).unwrap().executed(), 5);
}

#[test]
fn test_submission_rejections() {
    let rt = runtime(1, 1, PolicyKind::Eager);
    let cpu_only = Arc::new(Codelet::new("cpu_only").cpu(|_, _| Ok(())));
    let opencl_only = Arc::new(Codelet::new("opencl_only").opencl(|_, _| Ok(())));
    let cuda = rt.workers_of(WorkerArch::Cuda)[0];

    assert!(matches!(
        rt.submit(TaskBuilder::new(&cpu_only).on_worker(cuda)),
        Err(RuntimeError::Rejected { .. })
    ));
    assert!(matches!(
        rt.submit(TaskBuilder::new(&opencl_only)),
        Err(RuntimeError::Rejected { .. })
    ));
    assert!(matches!(
        rt.submit(TaskBuilder::new(&cpu_only).on_worker(WorkerId(9))),
        Err(RuntimeError::UnknownWorker(WorkerId(9)))
    ));
    let h = rt.register_vector(&[0u32]).unwrap();
    assert!(matches!(
        rt.submit(TaskBuilder::new(&increment()).read(&h).write(&h)),
        Err(RuntimeError::InvalidTask(_))
    ));
    assert!(matches!(
        rt.submit(TaskBuilder::new(&increment())),
        Err(RuntimeError::InvalidTask(_))
    ));
}

#[test]
fn test_implementation_matches_worker_arch() {
    let rt = runtime(1, 1, PolicyKind::Dmda);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (cpu_sink, cuda_sink) = (seen.clone(), seen.clone());
    let both = Arc::new(
        Codelet::new("both")
            .cpu(move |_, _| {
                cpu_sink.lock().push(("cpu", thread_name()));
                Ok(())
            })
            .cuda(move |_, _| {
                cuda_sink.lock().push(("cuda", thread_name()));
                Ok(())
            }),
    );
    let cuda = rt.workers_of(WorkerArch::Cuda)[0];
    rt.submit(TaskBuilder::new(&both).on_worker(WorkerId(0))).unwrap();
    rt.submit(TaskBuilder::new(&both).on_worker(cuda)).unwrap();
    rt.wait_for_all();

    let mut seen = seen.lock().clone();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("cpu", "codelet-cpu-0".to_string()),
            ("cuda", format!("codelet-cuda-{}", cuda.0)),
        ]
    );
}

#[test]
fn test_buffer_larger_than_every_node_is_rejected() {
    let mut cfg = config(1, 1, PolicyKind::Eager);
    cfg.memory.accelerator_capacity = Some(8);
    let rt = Runtime::new(cfg).unwrap();
    let h = rt.register_vector(&[0u32; 16]).unwrap();

    let job = rt.submit(TaskBuilder::new(&increment_cuda()).read_write(&h)).unwrap();
    match job.wait().unwrap() {
        JobOutcome::Rejected(reason) => assert!(reason.contains("exceed"), "{reason}"),
        other => panic!("expected a rejection, got {other:?}"),
    }
    assert_eq!(job.job().retries(), 0);
    assert_eq!(rt.stats().rejected, 1);

    // Nothing was written and the runtime still stops.
    assert_eq!(rt.unregister_vector::<u32>(&h).unwrap(), vec![0; 16]);
    rt.shutdown();
    assert_eq!(rt.pending_jobs(), 0);
}

#[test]
fn test_out_of_memory_requeues_are_bounded() {
    let mut cfg = config(1, 1, PolicyKind::Eager);
    cfg.memory.accelerator_capacity = Some(64);
    cfg.coherency.oom_requeues = 3;
    let rt = Runtime::new(cfg).unwrap();
    let cuda = rt.worker(rt.workers_of(WorkerArch::Cuda)[0]).unwrap().node;

    // A held replica cannot be evicted, so 48 of the 64 bytes stay taken.
    let big = rt.register_vector(&[1u32; 12]).unwrap();
    let held = rt.acquire_on(&big, cuda, AccessMode::Read).unwrap();
    let h = rt.register_vector(&[0u32; 8]).unwrap();

    let job = rt.submit(TaskBuilder::new(&increment_cuda()).read_write(&h)).unwrap();
    match job.wait().unwrap() {
        JobOutcome::Rejected(reason) => assert!(reason.contains("3 requeues"), "{reason}"),
        other => panic!("expected a rejection, got {other:?}"),
    }
    assert_eq!(job.job().retries(), 3);
    let stats = rt.stats();
    assert_eq!(stats.retried, 3);
    assert_eq!(stats.rejected, 1);

    rt.release(held);
    assert_eq!(rt.unregister_vector::<u32>(&h).unwrap(), vec![0; 8]);
    rt.wait_for_all();
}
