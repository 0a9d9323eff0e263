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

//! Spectrum acquisition library for external SDR power-scanning tools.
//!
//! This library runs command-line acquisition tools such as `rtl_power`,
//! `hackrf_sweep`, `airspy_rx` and `soapy_power`, decodes their output into
//! frequency/power sweeps and maintains the curves a spectrum display needs.
//! Its layers can be used independently or composed together:
//!
//! - **Protocol layer**: Decoders for the four output framings
//!   (text CSV, length-prefixed binary, raw IQ with FFT, pipe binary)
//! - **Supervisor layer**: Backend process lifecycle, argument templating and
//!   output streaming
//! - **Store layer**: Primary, average and peak-hold curves, smoothing,
//!   baseline subtraction and the waterfall history
//! - **Classifier**: Peak detection with a coarse modulation guess
//!
//! # Quick Start
//!
//! Use the [`Analyzer`] type for full-stack operation:
//!
//! ```no_run
//! use spectrum_core::{AcquisitionConfig, Analyzer, AnalyzerConfig, SpectrumEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut analyzer = Analyzer::spawn(AnalyzerConfig::default());
//!     let mut events = analyzer.subscribe();
//!
//!     analyzer
//!         .start("rtl_power", &AcquisitionConfig::default())
//!         .await
//!         .expect("backend failed to start");
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             SpectrumEvent::Primary(curve) => println!("{} bins", curve.len()),
//!             SpectrumEvent::Finished { .. } | SpectrumEvent::Failed(_) => break,
//!             _ => {}
//!         }
//!     }
//!
//!     for peak in analyzer.classify_peaks() {
//!         println!("{:.3} MHz {}", peak.frequency_mhz, peak.signal_type);
//!     }
//! }
//! ```
//!
//! # Using Individual Layers
//!
//! ## Protocol Layer Only
//!
//! ```
//! use spectrum_core::protocol::{SweepDecoder, TextCsvDecoder};
//!
//! let mut decoder = TextCsvDecoder::new(0.0);
//! let line = b"2024-01-01, 12:00:00, 100000000, 100003000, 1000, 3, -50, -40, -45\n";
//! for record in decoder.feed(line).flatten() {
//!     println!("{} bins starting at {} MHz", record.len(), record.frequencies()[0]);
//! }
//! ```
//!
//! ## Store Layer Only
//!
//! ```
//! use spectrum_core::protocol::SweepRecord;
//! use spectrum_core::store::{SpectrumStore, StoreConfig};
//!
//! let mut store = SpectrumStore::new(StoreConfig::default());
//! let record = SweepRecord::new(vec![100.0, 100.1], vec![-50.0, -45.0]).unwrap();
//! store.update(&record);
//! store.flush();
//!
//! assert_eq!(store.peak_hold_max().unwrap().len(), 2);
//! ```

pub mod backend;
pub mod classifier;
pub mod dsp;
pub mod protocol;
pub mod publish;
pub mod store;
pub mod supervisor;

use std::path::Path;
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub use backend::{AcquisitionConfig, BackendInfo, BackendRegistry};
pub use classifier::{Modulation, PeakClassifier, PeakRecord};
pub use protocol::{Decoder, FrameFormat, ProtocolError, SweepDecoder, SweepRecord};
pub use publish::{Curve, HistorySnapshot, Publisher, SpectrumEvent, Subscription};
pub use store::{SmoothingConfig, SmoothingKind, SpectrumStore, StoreConfig, StoreError, StoreWarning};
pub use supervisor::{
    AcquisitionEvent, AcquisitionState, AcquisitionSupervisor, SessionError, StartupError, SupervisorConfig,
};

/// Configuration for the full-stack analyzer.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerConfig {
    /// Backend table. Defaults to the built-in backends.
    pub registry: BackendRegistry,
    /// Process supervision timeouts.
    pub supervisor: SupervisorConfig,
    /// Store tunables.
    pub store: StoreConfig,
    /// Initial smoothing settings.
    pub smoothing: SmoothingConfig,
}

/// Full-stack analyzer that wires the supervisor into the store.
///
/// Sweeps decoded by the supervisor are ingested by the store on a
/// background task; curve updates and session events reach subscribers
/// through one [`Publisher`].
pub struct Analyzer {
    supervisor: AcquisitionSupervisor,
    store: Arc<RwLock<SpectrumStore>>,
    publisher: Publisher,
    ingest: JoinHandle<()>,
}

impl std::fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyzer")
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl Analyzer {
    /// Spawn a new analyzer.
    ///
    /// Must be called from within a Tokio runtime. No backend runs until
    /// [`start`](Self::start) is called.
    #[must_use]
    pub fn spawn(config: AnalyzerConfig) -> Self {
        let publisher = Publisher::new();
        let mut store = SpectrumStore::with_publisher(config.store, publisher.clone());
        let smoothing = config.smoothing;
        store.set_smoothing(smoothing.enabled, smoothing.window, smoothing.kind);
        let store = Arc::new(RwLock::new(store));

        let (supervisor, events) = AcquisitionSupervisor::new(Arc::new(config.registry), config.supervisor);
        let ingest = tokio::spawn(ingest(events, Arc::clone(&store), publisher.clone()));

        Self {
            supervisor,
            store,
            publisher,
            ingest,
        }
    }

    /// Subscribe to curve, history and session events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    /// The backend table.
    #[must_use]
    pub fn registry(&self) -> &BackendRegistry {
        self.supervisor.registry()
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> AcquisitionState {
        self.supervisor.state()
    }

    /// Watch session state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<AcquisitionState> {
        self.supervisor.subscribe_state()
    }

    /// Launch `backend` with `config`.
    pub async fn start(&mut self, backend: &str, config: &AcquisitionConfig) -> Result<(), StartupError> {
        self.supervisor.start(backend, config).await
    }

    /// Stop the running session, if any.
    pub async fn stop(&mut self) {
        self.supervisor.stop().await;
    }

    /// Change smoothing and recompute every curve.
    pub fn set_smoothing(&self, enabled: bool, window: usize, kind: SmoothingKind) {
        if let Ok(mut store) = self.store.write() {
            store.set_smoothing(enabled, window, kind);
        }
    }

    /// Enable or disable baseline subtraction, optionally loading a
    /// reference curve from a CSV file.
    pub fn set_baseline(&self, enabled: bool, path: Option<&Path>) -> Result<Option<StoreWarning>, StoreError> {
        match self.store.write() {
            Ok(mut store) => store.set_baseline(enabled, path),
            Err(_) => Ok(None),
        }
    }

    /// Drop the history, every curve and the loaded baseline.
    pub fn reset(&self) {
        if let Ok(mut store) = self.store.write() {
            store.reset();
        }
    }

    /// Classify the peaks of the latest primary curve.
    #[must_use]
    pub fn classify_peaks(&self) -> Vec<PeakRecord> {
        self.store
            .read()
            .map(|s| s.classify_peaks())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn primary(&self) -> Option<Curve> {
        self.store.read().ok().and_then(|s| s.primary())
    }

    #[must_use]
    pub fn average(&self) -> Option<Curve> {
        self.store.read().ok().and_then(|s| s.average())
    }

    #[must_use]
    pub fn peak_hold_max(&self) -> Option<Curve> {
        self.store.read().ok().and_then(|s| s.peak_hold_max())
    }

    #[must_use]
    pub fn peak_hold_min(&self) -> Option<Curve> {
        self.store.read().ok().and_then(|s| s.peak_hold_min())
    }

    #[must_use]
    pub fn history(&self) -> HistorySnapshot {
        self.store.read().map(|s| s.history()).unwrap_or_default()
    }

    /// Wait until the average and peak-hold curves reflect every sweep
    /// ingested so far.
    pub async fn flush(&self) {
        let flushed = self.store.read().map(|s| s.flushed()).ok();
        if let Some(flushed) = flushed {
            flushed.await;
        }
    }

    /// Stop any session and wait for every queued sweep to be ingested.
    pub async fn shutdown(self) {
        let Self {
            mut supervisor,
            store,
            ingest,
            ..
        } = self;
        supervisor.stop().await;
        drop(supervisor);

        if ingest.await.is_err() {
            warn!("Ingest task ended abnormally");
        }
        let flushed = store.read().map(|s| s.flushed()).ok();
        if let Some(flushed) = flushed {
            flushed.await;
        }
        debug!("Analyzer shut down");
    }
}

/// Feed supervisor events into the store until the supervisor is dropped.
async fn ingest(
    mut events: mpsc::UnboundedReceiver<AcquisitionEvent>,
    store: Arc<RwLock<SpectrumStore>>,
    publisher: Publisher,
) {
    while let Some(event) = events.recv().await {
        match event {
            AcquisitionEvent::Sweep(record) => {
                if let Ok(mut store) = store.write() {
                    store.update(&record);
                }
            }
            AcquisitionEvent::Started { backend, command } => {
                info!("Acquisition started with {}", backend);
                publisher.publish(&SpectrumEvent::Log(format!("Started {backend}: {command}")));
            }
            AcquisitionEvent::Log(message) => {
                publisher.publish(&SpectrumEvent::Log(message));
            }
            AcquisitionEvent::Finished { stopped_by_user } => {
                publisher.publish(&SpectrumEvent::Finished { stopped_by_user });
            }
            AcquisitionEvent::Failed(error) => {
                publisher.publish(&SpectrumEvent::Failed(error.to_string()));
            }
        }
    }
    debug!("Ingest task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

    fn analyzer_with(name: &str, script: &str) -> Analyzer {
        let mut registry = BackendRegistry::empty();
        registry.register(BackendInfo::new(name, "sh", FrameFormat::TextCsv).with_args(["-c", script]));
        Analyzer::spawn(AnalyzerConfig {
            registry,
            ..Default::default()
        })
    }

    async fn until_end(sub: &mut Subscription) -> Vec<SpectrumEvent> {
        let mut events = Vec::new();
        loop {
            let event = timeout(EVENT_TIMEOUT, sub.recv())
                .await
                .expect("timed out waiting for event")
                .expect("publisher closed");
            let done = matches!(event, SpectrumEvent::Finished { .. } | SpectrumEvent::Failed(_));
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn test_sweeps_flow_into_store() {
        let mut analyzer = analyzer_with(
            "csv",
            "printf '0,0,100000000,0,1000,3,-50,-40,-45\\n0,0,100000000,0,1000,3,-60,-30,-55\\n'",
        );
        let mut sub = analyzer.subscribe();
        analyzer.start("csv", &AcquisitionConfig::default()).await.unwrap();

        let events = until_end(&mut sub).await;
        let primaries: Vec<&Curve> = events
            .iter()
            .filter_map(|e| match e {
                SpectrumEvent::Primary(curve) => Some(curve),
                _ => None,
            })
            .collect();
        assert_eq!(primaries.len(), 2);
        assert_eq!(&primaries[1].y[..], &[-60.0, -30.0, -55.0]);
        assert!(events.iter().any(|e| matches!(e, SpectrumEvent::History(h) if h.len() == 2)));
        assert!(matches!(
            events.last(),
            Some(SpectrumEvent::Finished { stopped_by_user: false })
        ));

        analyzer.flush().await;
        assert_eq!(&analyzer.peak_hold_max().unwrap().y[..], &[-50.0, -30.0, -45.0]);
        assert_eq!(&analyzer.peak_hold_min().unwrap().y[..], &[-60.0, -40.0, -55.0]);
        assert_eq!(analyzer.history().len(), 2);
        analyzer.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_is_published() {
        let mut analyzer = analyzer_with("broken", "sleep 0.2; exit 4");
        let mut sub = analyzer.subscribe();
        analyzer.start("broken", &AcquisitionConfig::default()).await.unwrap();

        let events = until_end(&mut sub).await;
        match events.last() {
            Some(SpectrumEvent::Failed(reason)) => assert!(reason.contains('4'), "{reason}"),
            other => panic!("unexpected final event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let mut analyzer = Analyzer::spawn(AnalyzerConfig::default());
        let result = analyzer.start("no_such_tool", &AcquisitionConfig::default()).await;
        assert!(matches!(result, Err(StartupError::UnknownBackend(_))));
        assert!(analyzer.classify_peaks().is_empty());
        assert!(analyzer.history().is_empty());
    }
}
