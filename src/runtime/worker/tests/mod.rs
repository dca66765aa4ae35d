//! Worker 单元测试
//!
//! 测试工作线程描述、状态转换和唤醒信号

use std::sync::Arc;
use std::time::Duration;

use crate::runtime::memory::{NodeId, HOST_NODE};
use crate::runtime::worker::{WorkerArch, WorkerDescription, WorkerId, WorkerInfo, WorkerSignal, WorkerStatus};

#[cfg(test)]
mod info_tests {
    use super::*;

    #[test]
    fn test_name_from_arch_and_id() {
        let info = WorkerInfo::new(WorkerId(3), WorkerArch::Cuda, NodeId(1));
        assert_eq!(info.name, "cuda3");
        assert_eq!(info.status(), WorkerStatus::Idle);
        assert_eq!(info.executed(), 0);
        assert_eq!(info.pinned_queued(), 0);
        assert_eq!(WorkerId(3).to_string(), "worker3");
    }

    #[test]
    fn test_status_round_trip() {
        let info = WorkerInfo::new(WorkerId(0), WorkerArch::Cpu, HOST_NODE);
        for status in [
            WorkerStatus::Fetching,
            WorkerStatus::Executing,
            WorkerStatus::Releasing,
            WorkerStatus::ShuttingDown,
            WorkerStatus::Idle,
        ] {
            info.set_status(status);
            assert_eq!(info.status(), status);
        }
        info.record_executed();
        assert_eq!(info.executed(), 1);
    }

    #[test]
    fn test_description() {
        let info = WorkerInfo::new(WorkerId(1), WorkerArch::OpenCl, NodeId(2));
        let desc = WorkerDescription::from(&info);
        assert_eq!(desc.name, "opencl1");
        assert_eq!(desc.node, NodeId(2));
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"OpenCl\""));
    }
}

#[cfg(test)]
mod signal_tests {
    use super::*;

    #[test]
    fn test_notify_before_wait() {
        let signal = WorkerSignal::default();
        signal.notify();
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        // The flag is consumed.
        assert!(!signal.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_notify_from_other_thread() {
        let signal = Arc::new(WorkerSignal::default());
        let remote = signal.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.notify();
        });
        let mut woke = false;
        for _ in 0..100 {
            if signal.wait_timeout(Duration::from_millis(50)) {
                woke = true;
                break;
            }
        }
        t.join().unwrap();
        assert!(woke);
    }
}
