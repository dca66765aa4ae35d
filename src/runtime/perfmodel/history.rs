//! In-memory history-based model.

use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::trace;

use super::PerfModel;
use crate::runtime::data::Footprint;
use crate::runtime::worker::WorkerArch;

/// What a history entry is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelKey {
    pub symbol: String,
    pub footprint: Footprint,
    pub arch: WorkerArch,
    pub implementation: usize,
}

/// Running statistics for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub samples: usize,
    /// Mean execution time, microseconds.
    pub mean_us: f64,
    /// Sum of squared deviations (Welford).
    m2: f64,
    pub energy_samples: usize,
    /// Mean energy, joules.
    pub mean_energy: f64,
}

impl HistoryEntry {
    fn push(
        &mut self,
        value_us: f64,
    ) {
        self.samples += 1;
        let delta = value_us - self.mean_us;
        self.mean_us += delta / self.samples as f64;
        self.m2 += delta * (value_us - self.mean_us);
    }

    fn push_energy(
        &mut self,
        joules: f64,
    ) {
        self.energy_samples += 1;
        self.mean_energy += (joules - self.mean_energy) / self.energy_samples as f64;
    }

    /// Sample standard deviation, microseconds.
    pub fn stddev_us(&self) -> f64 {
        if self.samples < 2 {
            return 0.0;
        }
        (self.m2 / (self.samples - 1) as f64).sqrt()
    }
}

/// Running mean per (symbol, footprint, arch, implementation).
///
/// A key answers predictions once it has `min_samples` measurements.
#[derive(Debug)]
pub struct HistoryModel {
    entries: RwLock<HashMap<ModelKey, HistoryEntry>>,
    min_samples: usize,
}

impl Default for HistoryModel {
    fn default() -> Self {
        Self::new(10)
    }
}

impl HistoryModel {
    pub fn new(min_samples: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            min_samples: min_samples.max(1),
        }
    }

    #[inline]
    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Entry for one key, calibrated or not.
    pub fn entry(
        &self,
        key: &ModelKey,
    ) -> Option<HistoryEntry> {
        self.entries.read().get(key).copied()
    }

    /// All entries, sorted by symbol then implementation.
    pub fn entries(&self) -> Vec<(ModelKey, HistoryEntry)> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        all.sort_by(|(a, _), (b, _)| {
            a.symbol
                .cmp(&b.symbol)
                .then(a.footprint.0.cmp(&b.footprint.0))
                .then(a.implementation.cmp(&b.implementation))
        });
        all
    }

    /// Record the energy of one execution.
    pub fn record_energy(
        &self,
        key: ModelKey,
        joules: f64,
    ) {
        self.entries.write().entry(key).or_default().push_energy(joules);
    }

    /// Drop every measurement.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn key(
        symbol: &str,
        footprint: Footprint,
        arch: WorkerArch,
        implementation: usize,
    ) -> ModelKey {
        ModelKey {
            symbol: symbol.to_string(),
            footprint,
            arch,
            implementation,
        }
    }
}

impl PerfModel for HistoryModel {
    fn predict_length(
        &self,
        symbol: &str,
        footprint: Footprint,
        arch: WorkerArch,
        implementation: usize,
    ) -> Option<Duration> {
        let key = Self::key(symbol, footprint, arch, implementation);
        let entries = self.entries.read();
        let entry = entries.get(&key)?;
        if entry.samples < self.min_samples {
            return None;
        }
        Some(Duration::from_secs_f64(entry.mean_us.max(0.0) / 1e6))
    }

    fn record_measurement(
        &self,
        symbol: &str,
        footprint: Footprint,
        arch: WorkerArch,
        implementation: usize,
        measured: Duration,
    ) {
        let key = Self::key(symbol, footprint, arch, implementation);
        let us = measured.as_secs_f64() * 1e6;
        let mut entries = self.entries.write();
        let entry = entries.entry(key).or_default();
        entry.push(us);
        trace!(symbol, ?arch, implementation, samples = entry.samples, mean_us = entry.mean_us, "measurement");
    }

    fn predict_energy(
        &self,
        symbol: &str,
        footprint: Footprint,
        arch: WorkerArch,
        implementation: usize,
    ) -> Option<f64> {
        let key = Self::key(symbol, footprint, arch, implementation);
        let entries = self.entries.read();
        let entry = entries.get(&key)?;
        if entry.energy_samples < self.min_samples {
            return None;
        }
        Some(entry.mean_energy)
    }
}
