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

//! Background worker for the average and peak-hold curves.
//!
//! Jobs go through one unbounded queue with exactly one consumer thread, so
//! they are applied in the order they were enqueued and none is dropped.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::publish::{Curve, Publisher, SpectrumEvent};

/// Weight of the incoming sweep in the exponential moving average.
pub(crate) const AVERAGE_ALPHA: f32 = 0.1;

/// Work item for the curve worker.
#[derive(Debug)]
pub(crate) enum CurveJob {
    /// Fold one corrected power vector into the curves.
    Update { x: Arc<[f64]>, y: Arc<[f32]> },
    /// Recompute every curve from corrected history rows, oldest first.
    Rebuild {
        x: Arc<[f64]>,
        bin_count: usize,
        rows: Vec<f32>,
    },
    /// Forget every curve.
    Reset,
    /// Acknowledge once every earlier job has been applied.
    Barrier(oneshot::Sender<()>),
}

/// Average and peak-hold curves, all of the same length.
#[derive(Debug, Clone, Default)]
pub(crate) struct DerivedCurves {
    pub(crate) x: Option<Arc<[f64]>>,
    pub(crate) average: Option<Vec<f32>>,
    pub(crate) peak_hold_max: Option<Vec<f32>>,
    pub(crate) peak_hold_min: Option<Vec<f32>>,
}

impl DerivedCurves {
    fn clear(&mut self) {
        *self = Self::default();
    }

    /// Fold `y` in. A length change restarts every curve from `y`.
    fn fold(&mut self, x: Arc<[f64]>, y: &[f32]) {
        let same_width = self.average.as_ref().is_some_and(|a| a.len() == y.len());
        if !same_width {
            self.average = Some(y.to_vec());
            self.peak_hold_max = Some(y.to_vec());
            self.peak_hold_min = Some(y.to_vec());
            self.x = Some(x);
            return;
        }

        if let Some(average) = self.average.as_mut() {
            for (a, &v) in average.iter_mut().zip(y) {
                *a = (1.0 - AVERAGE_ALPHA) * *a + AVERAGE_ALPHA * v;
            }
        }
        if let Some(max) = self.peak_hold_max.as_mut() {
            for (m, &v) in max.iter_mut().zip(y) {
                *m = m.max(v);
            }
        }
        if let Some(min) = self.peak_hold_min.as_mut() {
            for (m, &v) in min.iter_mut().zip(y) {
                *m = m.min(v);
            }
        }
        self.x = Some(x);
    }

    pub(crate) fn average_curve(&self) -> Option<Curve> {
        Self::curve(self.x.as_ref(), self.average.as_ref())
    }

    pub(crate) fn peak_max_curve(&self) -> Option<Curve> {
        Self::curve(self.x.as_ref(), self.peak_hold_max.as_ref())
    }

    pub(crate) fn peak_min_curve(&self) -> Option<Curve> {
        Self::curve(self.x.as_ref(), self.peak_hold_min.as_ref())
    }

    fn curve(x: Option<&Arc<[f64]>>, y: Option<&Vec<f32>>) -> Option<Curve> {
        Some(Curve::new(Arc::clone(x?), y?.as_slice()))
    }
}

/// Handle to the curve worker thread.
///
/// Dropping the handle closes the queue and joins the thread after it has
/// drained the remaining jobs.
pub(crate) struct CurveWorker {
    tx: Option<mpsc::UnboundedSender<CurveJob>>,
    curves: Arc<Mutex<DerivedCurves>>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CurveWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurveWorker")
            .field("running", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}

impl CurveWorker {
    pub(crate) fn spawn(publisher: Publisher) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CurveJob>();
        let curves = Arc::new(Mutex::new(DerivedCurves::default()));
        let shared = Arc::clone(&curves);

        let handle = std::thread::Builder::new()
            .name("spectrum-curves".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    apply(&shared, &publisher, job);
                }
                debug!("Curve worker finished");
            });

        let (tx, handle) = match handle {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                warn!("Failed to start curve worker: {}", e);
                (None, None)
            }
        };

        Self { tx, curves, handle }
    }

    /// Queue `job` behind every job already enqueued.
    pub(crate) fn submit(&self, job: CurveJob) {
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                warn!("Curve worker is gone, dropping curve update");
            }
        }
    }

    /// Queue a barrier; the receiver completes once every job submitted
    /// before it has been applied.
    ///
    /// A closed queue drops the sender, which also completes the receiver.
    pub(crate) fn barrier(&self) -> oneshot::Receiver<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.submit(CurveJob::Barrier(ack_tx));
        ack_rx
    }

    /// Block until every job submitted so far has been applied.
    ///
    /// Panics when called from within an async runtime.
    pub(crate) fn flush(&self) {
        let _ = self.barrier().blocking_recv();
    }

    /// Copy of the curves as of the last applied job.
    pub(crate) fn snapshot(&self) -> DerivedCurves {
        self.curves.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Drop for CurveWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Curve worker panicked");
            }
        }
    }
}

fn apply(curves: &Mutex<DerivedCurves>, publisher: &Publisher, job: CurveJob) {
    let updated = match job {
        CurveJob::Update { x, y } => {
            let Ok(mut curves) = curves.lock() else { return };
            curves.fold(x, &y);
            curves.clone()
        }
        CurveJob::Rebuild { x, bin_count, rows } => {
            let Ok(mut curves) = curves.lock() else { return };
            curves.clear();
            for row in rows.chunks_exact(bin_count.max(1)) {
                curves.fold(Arc::clone(&x), row);
            }
            curves.clone()
        }
        CurveJob::Reset => {
            if let Ok(mut curves) = curves.lock() {
                curves.clear();
            }
            return;
        }
        CurveJob::Barrier(ack) => {
            let _ = ack.send(());
            return;
        }
    };

    if let Some(curve) = updated.average_curve() {
        publisher.publish(&SpectrumEvent::Average(curve));
    }
    if let Some(curve) = updated.peak_max_curve() {
        publisher.publish(&SpectrumEvent::PeakMax(curve));
    }
    if let Some(curve) = updated.peak_min_curve() {
        publisher.publish(&SpectrumEvent::PeakMin(curve));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(n: usize) -> Arc<[f64]> {
        (0..n).map(|i| 100.0 + i as f64 * 0.001).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_fold_average_and_peak_hold() {
        let mut curves = DerivedCurves::default();
        curves.fold(axis(2), &[-50.0, -40.0]);
        curves.fold(axis(2), &[-40.0, -60.0]);

        let average = curves.average.clone().unwrap();
        assert!((average[0] - -49.0).abs() < 1e-4);
        assert!((average[1] - -42.0).abs() < 1e-4);
        assert_eq!(curves.peak_hold_max, Some(vec![-40.0, -40.0]));
        assert_eq!(curves.peak_hold_min, Some(vec![-50.0, -60.0]));
    }

    #[test]
    fn test_worker_applies_jobs_in_order_and_publishes() {
        let publisher = Publisher::new();
        let mut sub = publisher.subscribe();
        let worker = CurveWorker::spawn(publisher);

        for value in [-10.0, -20.0, -30.0] {
            worker.submit(CurveJob::Update {
                x: axis(1),
                y: vec![value].into(),
            });
        }
        worker.flush();

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.peak_hold_max, Some(vec![-10.0]));
        assert_eq!(snapshot.peak_hold_min, Some(vec![-30.0]));

        let mut minima = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let SpectrumEvent::PeakMin(curve) = event {
                minima.push(curve.y[0]);
            }
        }
        assert_eq!(minima, vec![-10.0, -20.0, -30.0]);
    }

    #[test]
    fn test_rebuild_replaces_state() {
        let worker = CurveWorker::spawn(Publisher::new());
        worker.submit(CurveJob::Update {
            x: axis(2),
            y: vec![0.0, 0.0].into(),
        });
        worker.submit(CurveJob::Rebuild {
            x: axis(2),
            bin_count: 2,
            rows: vec![-5.0, -6.0, -7.0, -8.0],
        });
        worker.flush();

        let snapshot = worker.snapshot();
        assert_eq!(snapshot.peak_hold_max, Some(vec![-5.0, -6.0]));
        assert_eq!(snapshot.peak_hold_min, Some(vec![-7.0, -8.0]));

        worker.submit(CurveJob::Reset);
        worker.flush();
        assert!(worker.snapshot().average.is_none());
    }

    #[tokio::test]
    async fn test_barrier_completes_on_current_thread_runtime() {
        let worker = CurveWorker::spawn(Publisher::new());
        worker.submit(CurveJob::Update {
            x: axis(1),
            y: vec![-12.0].into(),
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), worker.barrier())
            .await
            .expect("barrier timed out")
            .expect("worker dropped the barrier");
        assert_eq!(worker.snapshot().peak_hold_max, Some(vec![-12.0]));
    }
}
