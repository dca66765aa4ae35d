//! Performance model collaborator
//!
//! Schedulers ask a [`PerfModel`] how long a codelet implementation takes on
//! a worker architecture for a given buffer footprint. `None` means the model
//! is not calibrated for that combination yet.

mod history;

pub use history::{HistoryEntry, HistoryModel, ModelKey};

use std::fmt;
use std::time::Duration;

use crate::runtime::data::Footprint;
use crate::runtime::worker::WorkerArch;

/// Execution-time and energy predictor.
pub trait PerfModel: Send + Sync + fmt::Debug {
    /// Expected run time, `None` while uncalibrated.
    fn predict_length(
        &self,
        symbol: &str,
        footprint: Footprint,
        arch: WorkerArch,
        implementation: usize,
    ) -> Option<Duration>;

    /// Feed back one measured execution.
    fn record_measurement(
        &self,
        symbol: &str,
        footprint: Footprint,
        arch: WorkerArch,
        implementation: usize,
        measured: Duration,
    );

    /// Expected energy in joules.
    fn predict_energy(
        &self,
        symbol: &str,
        footprint: Footprint,
        arch: WorkerArch,
        implementation: usize,
    ) -> Option<f64> {
        let _ = (symbol, footprint, arch, implementation);
        None
    }
}

#[cfg(test)]
mod tests;
