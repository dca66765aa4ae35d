//! Runtime shutdown: draining, aborting and refusing new work.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use codelet_rt::runtime::JobState;
use codelet_rt::{AccessMode, Codelet, JobOutcome, PolicyKind, RuntimeError, TaskBuilder};

use crate::common::{increment, runtime};

/// Sleeps `ms` milliseconds with its single buffer held.
fn nap(ms: u64) -> Arc<Codelet> {
    Arc::new(
        Codelet::new("nap")
            .nbuffers(1)
            .with_model(false)
            .cpu(move |_, _| {
                thread::sleep(Duration::from_millis(ms));
                Ok(())
            }),
    )
}

#[test]
fn test_queued_jobs_are_drained() {
    for policy in PolicyKind::ALL {
        let rt = runtime(2, 0, policy);
        let h = rt.register_variable(0u32).unwrap();
        let inc = increment();
        let jobs: Vec<_> = (0..20)
            .map(|_| rt.submit(TaskBuilder::new(&inc).read_write(&h)).unwrap())
            .collect();
        rt.shutdown();
        for job in &jobs {
            assert_eq!(job.wait().unwrap(), JobOutcome::Success, "{policy}");
        }
        let stats = rt.stats();
        assert_eq!(stats.completed, 20, "{policy}");
        assert_eq!(stats.aborted, 0, "{policy}");
    }
}

#[test]
fn test_jobs_made_ready_during_shutdown_still_run() {
    for policy in PolicyKind::ALL {
        let rt = runtime(2, 0, policy);
        let other = rt.register_variable(0u32).unwrap();
        let h = rt.register_variable(0u32).unwrap();

        // The short job lets its worker go idle while the long one still runs;
        // the job after the long one only becomes ready once shutdown began.
        let short = rt.submit(TaskBuilder::new(&nap(10)).read_write(&other)).unwrap();
        let long = rt.submit(TaskBuilder::new(&nap(100)).read_write(&h)).unwrap();
        let last = rt.submit(TaskBuilder::new(&increment()).read_write(&h)).unwrap();
        thread::sleep(Duration::from_millis(30));
        rt.shutdown();

        assert_eq!(short.wait().unwrap(), JobOutcome::Success, "{policy}");
        assert_eq!(long.wait().unwrap(), JobOutcome::Success, "{policy}");
        assert_eq!(last.wait().unwrap(), JobOutcome::Success, "{policy}");
        assert_eq!(rt.stats().aborted, 0, "{policy}");
    }
}

#[test]
fn test_blocked_jobs_are_aborted() {
    for policy in PolicyKind::ALL {
        let rt = runtime(2, 0, policy);
        let h = rt.register_vector(&[0u32; 2]).unwrap();
        let held = rt.acquire(&h, AccessMode::ReadWrite).unwrap();
        let blocked = rt.submit(TaskBuilder::new(&increment()).read_write(&h)).unwrap();

        rt.shutdown();
        assert_eq!(blocked.state(), JobState::Aborted, "{policy}");
        assert!(matches!(blocked.wait(), Err(RuntimeError::Aborted(_))), "{policy}");
        assert_eq!(rt.stats().aborted, 1, "{policy}");

        // The application still owns its access until it gives it back.
        rt.release(held);
        assert_eq!(blocked.try_outcome(), Some(JobOutcome::Aborted), "{policy}");
    }
}

#[test]
fn test_no_work_after_shutdown() {
    for policy in PolicyKind::ALL {
        let rt = runtime(2, 0, policy);
        let h = rt.register_vector(&[0u32]).unwrap();
        rt.shutdown();
        rt.shutdown();
        assert!(matches!(
            rt.submit(TaskBuilder::new(&increment()).read_write(&h)),
            Err(RuntimeError::ShuttingDown)
        ));
        assert!(matches!(rt.acquire(&h, AccessMode::Read), Err(RuntimeError::ShuttingDown)));
    }
}

#[test]
fn test_wait_for_all_after_shutdown_returns() {
    for policy in PolicyKind::ALL {
        let rt = runtime(2, 0, policy);
        let h = rt.register_vector(&[0u32]).unwrap();
        let held = rt.acquire(&h, AccessMode::ReadWrite).unwrap();
        rt.submit(TaskBuilder::new(&increment()).read_write(&h)).unwrap();
        rt.shutdown();
        // The aborted job no longer counts as pending.
        rt.wait_for_all();
        assert_eq!(rt.pending_jobs(), 0, "{policy}");
        rt.release(held);
    }
}
