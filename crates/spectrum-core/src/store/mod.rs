// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Spectrum state management.
//!
//! [`SpectrumStore`] turns the sweep stream into the curves a front end
//! displays: the primary curve (baseline-corrected, optionally smoothed),
//! the waterfall history, and the average and peak-hold curves. The last
//! three are computed on a background worker so ingestion never waits on
//! them.

mod history;
mod smoothing;
mod worker;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::{PeakClassifier, PeakRecord};
use crate::protocol::SweepRecord;
use crate::publish::{Curve, HistorySnapshot, Publisher, SpectrumEvent, Subscription};

pub use history::{HistoryView, RingHistory};
pub use smoothing::{SmoothingConfig, SmoothingKind};

use worker::{CurveJob, CurveWorker};

/// Store tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of sweeps kept for the waterfall.
    pub history_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
        }
    }
}

/// Non-fatal conditions raised while ingesting sweeps or loading a baseline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreWarning {
    #[error("bin count changed from {previous} to {current}, history reset")]
    BinCountChanged { previous: usize, current: usize },
    #[error("baseline has {baseline} bins but the spectrum has {bins}, baseline subtraction disabled")]
    BaselineMismatch { baseline: usize, bins: usize },
}

/// Errors loading or saving a curve file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("baseline file error: {0}")]
    BaselineIo(#[from] csv::Error),
    #[error("invalid baseline: {reason}")]
    BaselineValue { reason: String },
}

/// Live spectrum state.
///
/// Raw powers are kept in the history; the baseline is subtracted whenever
/// rows are read, so enabling or disabling it applies to every retained
/// sweep immediately.
pub struct SpectrumStore {
    smoothing: SmoothingConfig,
    baseline_enabled: bool,
    baseline: Option<Arc<[f32]>>,
    history: RingHistory,
    frequencies: Option<Arc<[f64]>>,
    primary: Option<Curve>,
    classifier: PeakClassifier,
    publisher: Publisher,
    worker: CurveWorker,
}

impl std::fmt::Debug for SpectrumStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumStore")
            .field("smoothing", &self.smoothing)
            .field("baseline_enabled", &self.baseline_enabled)
            .field("history_rows", &self.history.filled())
            .field("bin_count", &self.history.bin_count())
            .finish_non_exhaustive()
    }
}

impl SpectrumStore {
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self::with_publisher(config, Publisher::new())
    }

    /// Create a store that publishes through an existing publisher.
    #[must_use]
    pub fn with_publisher(config: StoreConfig, publisher: Publisher) -> Self {
        Self {
            smoothing: SmoothingConfig::default(),
            baseline_enabled: false,
            baseline: None,
            history: RingHistory::new(config.history_capacity),
            frequencies: None,
            primary: None,
            classifier: PeakClassifier::default(),
            worker: CurveWorker::spawn(publisher.clone()),
            publisher,
        }
    }

    /// Subscribe to every curve and history update.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    #[must_use]
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    #[must_use]
    pub fn smoothing(&self) -> SmoothingConfig {
        self.smoothing
    }

    /// Whether a matching baseline is loaded and being subtracted.
    #[must_use]
    pub fn baseline_active(&self) -> bool {
        self.baseline_enabled && self.baseline.is_some()
    }

    /// Ingest one sweep.
    ///
    /// Publishes the primary curve and the history before returning. The
    /// average and peak-hold curves follow from the background worker.
    pub fn update(&mut self, record: &SweepRecord) -> Vec<StoreWarning> {
        let mut warnings = Vec::new();
        let bins = record.len();

        if let Some(previous) = self.history.bin_count() {
            if previous != bins {
                warnings.push(StoreWarning::BinCountChanged {
                    previous,
                    current: bins,
                });
                self.worker.submit(CurveJob::Reset);
            }
        }
        if let Some(warning) = self.check_baseline(bins) {
            warnings.push(warning);
        }

        self.history.append(record.powers());
        let x = record.frequency_axis();
        self.frequencies = Some(Arc::clone(&x));

        let corrected: Arc<[f32]> = self.corrected(record.powers()).into();
        self.publish_primary(Arc::clone(&x), &corrected);
        self.publish_history();
        self.worker.submit(CurveJob::Update { x, y: corrected });

        for warning in &warnings {
            self.report(warning);
        }
        warnings
    }

    /// Change smoothing and recompute the curves from the retained history.
    pub fn set_smoothing(&mut self, enabled: bool, window: usize, kind: SmoothingKind) {
        let smoothing = SmoothingConfig {
            enabled,
            window,
            kind,
        };
        if smoothing == self.smoothing {
            return;
        }
        info!(
            "Smoothing {} (window {}, {})",
            if enabled { "enabled" } else { "disabled" },
            smoothing.effective_window(),
            kind.name()
        );
        self.smoothing = smoothing;
        self.recompute();
    }

    /// Enable or disable baseline subtraction, optionally loading a new
    /// reference from a CSV file.
    ///
    /// Without a path the previously loaded reference is kept. A reference
    /// whose length does not match the current sweeps is dropped and the
    /// mismatch returned.
    pub fn set_baseline(&mut self, enabled: bool, path: Option<&Path>) -> Result<Option<StoreWarning>, StoreError> {
        if let Some(path) = path {
            let reference = read_baseline_csv(path)?;
            info!("Loaded baseline with {} bins from {}", reference.len(), path.display());
            self.baseline = Some(reference.into());
        }
        Ok(self.apply_baseline(enabled))
    }

    /// Like [`set_baseline`](Self::set_baseline) with an in-memory reference curve.
    pub fn set_baseline_curve(&mut self, enabled: bool, reference: Vec<f32>) -> Option<StoreWarning> {
        self.baseline = Some(reference.into());
        self.apply_baseline(enabled)
    }

    /// Drop the history, every curve and the loaded baseline.
    pub fn reset(&mut self) {
        self.history.clear();
        self.frequencies = None;
        self.primary = None;
        self.baseline = None;
        self.worker.submit(CurveJob::Reset);
        debug!("Spectrum store reset");
    }

    /// Block until the average and peak-hold curves reflect every sweep
    /// ingested so far.
    ///
    /// Panics when called from within an async runtime; await
    /// [`flushed`](Self::flushed) there instead.
    pub fn flush(&self) {
        self.worker.flush();
    }

    /// Future that completes once the average and peak-hold curves reflect
    /// every sweep ingested before this call.
    ///
    /// The future does not borrow the store, so a lock around it can be
    /// released before awaiting.
    pub fn flushed(&self) -> impl Future<Output = ()> + Send + 'static {
        let ack = self.worker.barrier();
        async move {
            let _ = ack.await;
        }
    }

    /// Latest primary curve.
    #[must_use]
    pub fn primary(&self) -> Option<Curve> {
        self.primary.clone()
    }

    #[must_use]
    pub fn average(&self) -> Option<Curve> {
        self.worker.snapshot().average_curve()
    }

    #[must_use]
    pub fn peak_hold_max(&self) -> Option<Curve> {
        self.worker.snapshot().peak_max_curve()
    }

    #[must_use]
    pub fn peak_hold_min(&self) -> Option<Curve> {
        self.worker.snapshot().peak_min_curve()
    }

    /// Baseline-corrected copy of the waterfall history.
    #[must_use]
    pub fn history(&self) -> HistorySnapshot {
        let Some(frequencies) = self.frequencies.clone() else {
            return HistorySnapshot::default();
        };
        let bin_count = self.history.bin_count().unwrap_or(0);
        let mut data = self.history.valid_slice().to_flat_vec();
        if let Some(reference) = self.active_baseline() {
            for row in data.chunks_exact_mut(bin_count.max(1)) {
                subtract(row, reference);
            }
        }
        HistorySnapshot::new(frequencies, bin_count, data)
    }

    /// Classify the peaks of the latest primary curve.
    #[must_use]
    pub fn classify_peaks(&self) -> Vec<PeakRecord> {
        self.primary
            .as_ref()
            .map(|curve| self.classifier.classify(&curve.x, &curve.y))
            .unwrap_or_default()
    }

    /// Reference that currently applies to incoming sweeps.
    fn active_baseline(&self) -> Option<&[f32]> {
        if self.baseline_enabled {
            self.baseline.as_deref()
        } else {
            None
        }
    }

    fn corrected(&self, powers: &[f32]) -> Vec<f32> {
        let mut corrected = powers.to_vec();
        if let Some(reference) = self.active_baseline() {
            subtract(&mut corrected, reference);
        }
        corrected
    }

    /// Drop a loaded reference that does not match `bins`.
    fn check_baseline(&mut self, bins: usize) -> Option<StoreWarning> {
        let baseline = self.baseline.as_ref()?.len();
        if baseline == bins {
            return None;
        }
        self.baseline = None;
        Some(StoreWarning::BaselineMismatch { baseline, bins })
    }

    fn apply_baseline(&mut self, enabled: bool) -> Option<StoreWarning> {
        self.baseline_enabled = enabled;
        let warning = self
            .history
            .bin_count()
            .and_then(|bins| self.check_baseline(bins));
        if let Some(warning) = &warning {
            self.report(warning);
        }
        info!(
            "Baseline subtraction {}",
            if self.baseline_active() { "enabled" } else { "disabled" }
        );
        self.recompute();
        warning
    }

    /// Rebuild every curve from the retained history with the current settings.
    fn recompute(&mut self) {
        let (Some(x), Some(bin_count)) = (self.frequencies.clone(), self.history.bin_count()) else {
            return;
        };
        let Some(latest) = self.history.latest() else {
            return;
        };

        let corrected = self.corrected(latest);
        self.publish_primary(Arc::clone(&x), &corrected);

        let snapshot = self.history();
        self.publisher
            .publish(&SpectrumEvent::History(Arc::new(snapshot.clone())));
        self.worker.submit(CurveJob::Rebuild {
            x,
            bin_count,
            rows: snapshot.rows().flatten().copied().collect(),
        });
    }

    fn publish_primary(&mut self, x: Arc<[f64]>, corrected: &[f32]) {
        let y = self
            .smoothing
            .apply(corrected)
            .unwrap_or_else(|| corrected.to_vec());
        let curve = Curve::new(x, y);
        self.publisher.publish(&SpectrumEvent::Primary(curve.clone()));
        self.primary = Some(curve);
    }

    fn publish_history(&self) {
        self.publisher
            .publish(&SpectrumEvent::History(Arc::new(self.history())));
    }

    fn report(&self, warning: &StoreWarning) {
        warn!("{}", warning);
        self.publisher.publish(&SpectrumEvent::Log(warning.to_string()));
    }
}

fn subtract(row: &mut [f32], reference: &[f32]) {
    for (v, r) in row.iter_mut().zip(reference) {
        *v -= r;
    }
}

/// Read the power column of a `freq,db` CSV file with a header row.
pub fn read_baseline_csv(path: &Path) -> Result<Vec<f32>, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut powers = Vec::new();
    for row in reader.deserialize() {
        let (frequency, power): (f64, f32) = row?;
        if !frequency.is_finite() || !power.is_finite() {
            return Err(StoreError::BaselineValue {
                reason: format!("non-finite value at {frequency} MHz"),
            });
        }
        powers.push(power);
    }

    if powers.is_empty() {
        return Err(StoreError::BaselineValue {
            reason: format!("{} has no data rows", path.display()),
        });
    }
    Ok(powers)
}

/// Write `curve` as a `freq_MHz,power_dB` CSV file readable by [`read_baseline_csv`].
pub fn write_curve_csv(path: &Path, curve: &Curve) -> Result<(), StoreError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["freq_MHz", "power_dB"])?;
    for (frequency, power) in curve.x.iter().zip(curve.y.iter()) {
        writer.serialize((frequency, power))?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}
