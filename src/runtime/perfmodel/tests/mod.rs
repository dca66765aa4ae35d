//! PerfModel 单元测试
//!
//! 测试历史模型的校准阈值、均值和能耗记录

use std::time::Duration;

use crate::runtime::data::{Footprint, Layout};
use crate::runtime::perfmodel::{HistoryModel, ModelKey, PerfModel};
use crate::runtime::worker::WorkerArch;

fn fp() -> Footprint {
    Layout::vector_of::<f32>(1024).footprint()
}

fn key(arch: WorkerArch) -> ModelKey {
    ModelKey {
        symbol: "scal".to_string(),
        footprint: fp(),
        arch,
        implementation: 0,
    }
}

#[cfg(test)]
mod history_tests {
    use super::*;

    #[test]
    fn test_uncalibrated_until_min_samples() {
        let model = HistoryModel::new(3);
        for _ in 0..2 {
            model.record_measurement("scal", fp(), WorkerArch::Cpu, 0, Duration::from_micros(100));
            assert_eq!(model.predict_length("scal", fp(), WorkerArch::Cpu, 0), None);
        }
        model.record_measurement("scal", fp(), WorkerArch::Cpu, 0, Duration::from_micros(100));
        let predicted = model.predict_length("scal", fp(), WorkerArch::Cpu, 0).unwrap();
        assert!((predicted.as_secs_f64() * 1e6 - 100.0).abs() < 1e-2);
    }

    #[test]
    fn test_mean_and_stddev() {
        let model = HistoryModel::new(1);
        for us in [10, 20, 30] {
            model.record_measurement("scal", fp(), WorkerArch::Cpu, 0, Duration::from_micros(us));
        }
        let entry = model.entry(&key(WorkerArch::Cpu)).unwrap();
        assert_eq!(entry.samples, 3);
        assert!((entry.mean_us - 20.0).abs() < 1e-9);
        assert!((entry.stddev_us() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_keys_are_independent() {
        let model = HistoryModel::new(1);
        model.record_measurement("scal", fp(), WorkerArch::Cuda, 0, Duration::from_micros(5));
        assert!(model.predict_length("scal", fp(), WorkerArch::Cuda, 0).is_some());
        assert!(model.predict_length("scal", fp(), WorkerArch::Cpu, 0).is_none());
        assert!(model.predict_length("scal", fp(), WorkerArch::Cuda, 1).is_none());
        assert!(model
            .predict_length("scal", Layout::vector_of::<f32>(2048).footprint(), WorkerArch::Cuda, 0)
            .is_none());
        assert!(model.predict_length("axpy", fp(), WorkerArch::Cuda, 0).is_none());
    }

    #[test]
    fn test_min_samples_at_least_one() {
        let model = HistoryModel::new(0);
        assert_eq!(model.min_samples(), 1);
        assert_eq!(HistoryModel::default().min_samples(), 10);
    }

    #[test]
    fn test_energy_history() {
        let model = HistoryModel::new(2);
        model.record_energy(key(WorkerArch::Cpu), 1.0);
        assert_eq!(model.predict_energy("scal", fp(), WorkerArch::Cpu, 0), None);
        model.record_energy(key(WorkerArch::Cpu), 3.0);
        assert_eq!(model.predict_energy("scal", fp(), WorkerArch::Cpu, 0), Some(2.0));
        // Energy samples do not calibrate the time prediction.
        assert_eq!(model.predict_length("scal", fp(), WorkerArch::Cpu, 0), None);
    }

    #[test]
    fn test_entries_sorted_and_clear() {
        let model = HistoryModel::new(1);
        model.record_measurement("b", fp(), WorkerArch::Cpu, 1, Duration::from_micros(1));
        model.record_measurement("a", fp(), WorkerArch::Cpu, 0, Duration::from_micros(1));
        model.record_measurement("b", fp(), WorkerArch::Cpu, 0, Duration::from_micros(1));
        let symbols: Vec<(String, usize)> = model
            .entries()
            .into_iter()
            .map(|(k, _)| (k.symbol, k.implementation))
            .collect();
        assert_eq!(
            symbols,
            vec![("a".to_string(), 0), ("b".to_string(), 0), ("b".to_string(), 1)]
        );
        model.clear();
        assert!(model.entries().is_empty());
    }
}
