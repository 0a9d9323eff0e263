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

//! Observer list for published spectrum events.
//!
//! Every subscriber gets its own unbounded queue, so a slow subscriber never
//! blocks ingestion and never loses an event. Events of one kind reach each
//! subscriber exactly once, in the order they were published.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// An x/y curve: frequencies in MHz and powers in dB.
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    pub x: Arc<[f64]>,
    pub y: Arc<[f32]>,
}

impl Curve {
    #[must_use]
    pub fn new(x: Arc<[f64]>, y: impl Into<Arc<[f32]>>) -> Self {
        Self { x, y: y.into() }
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.y.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

/// Immutable copy of the waterfall history, oldest row first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistorySnapshot {
    frequencies: Arc<[f64]>,
    bin_count: usize,
    data: Vec<f32>,
}

impl HistorySnapshot {
    pub(crate) fn new(frequencies: Arc<[f64]>, bin_count: usize, data: Vec<f32>) -> Self {
        debug_assert!(bin_count == 0 || data.len() % bin_count == 0);
        Self {
            frequencies,
            bin_count,
            data,
        }
    }

    /// Frequency of each column in MHz.
    #[must_use]
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Number of columns.
    #[must_use]
    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.bin_count == 0 {
            0
        } else {
            self.data.len() / self.bin_count
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row `index`, counted from the oldest.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        if index >= self.len() {
            return None;
        }
        let start = index * self.bin_count;
        self.data.get(start..start + self.bin_count)
    }

    /// Rows from oldest to newest.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.bin_count.max(1))
    }

    /// Most recent row.
    #[must_use]
    pub fn latest(&self) -> Option<&[f32]> {
        self.len().checked_sub(1).and_then(|i| self.row(i))
    }
}

/// Events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum SpectrumEvent {
    /// The primary (smoothed, baseline-corrected) curve changed.
    Primary(Curve),
    /// The moving average changed.
    Average(Curve),
    /// The peak-hold maximum changed.
    PeakMax(Curve),
    /// The peak-hold minimum changed.
    PeakMin(Curve),
    /// The waterfall history changed.
    History(Arc<HistorySnapshot>),
    /// A non-fatal condition worth showing to the user.
    Log(String),
    /// The acquisition session ended normally.
    Finished { stopped_by_user: bool },
    /// The acquisition session failed.
    Failed(String),
}

#[derive(Debug, Default)]
struct Subscribers {
    next_id: u64,
    senders: Vec<(u64, mpsc::UnboundedSender<SpectrumEvent>)>,
}

/// Fan-out point for [`SpectrumEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct Publisher {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl Publisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    ///
    /// The subscriber receives every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = if let Ok(mut subscribers) = self.subscribers.lock() {
            let id = subscribers.next_id;
            subscribers.next_id += 1;
            subscribers.senders.push((id, tx));
            id
        } else {
            u64::MAX
        };

        Subscription {
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Deliver `event` to every live subscriber.
    pub fn publish(&self, event: &SpectrumEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers
                .senders
                .retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.senders.len()).unwrap_or(0)
    }
}

/// Cancellable subscription handle.
///
/// Dropping the handle (or calling [`cancel`](Self::cancel)) unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SpectrumEvent>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<SpectrumEvent> {
        self.rx.recv().await
    }

    /// Next queued event, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<SpectrumEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event from synchronous code.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<SpectrumEvent> {
        self.rx.blocking_recv()
    }

    /// Stop receiving events.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.senders.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(y: &[f32]) -> Curve {
        let x: Vec<f64> = (0..y.len()).map(|i| i as f64).collect();
        Curve::new(x.into(), y.to_vec())
    }

    #[test]
    fn test_each_subscriber_gets_every_event_in_order() {
        let publisher = Publisher::new();
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        for value in [1.0, 2.0, 3.0] {
            publisher.publish(&SpectrumEvent::Primary(curve(&[value])));
        }

        for sub in [&mut a, &mut b] {
            for expected in [1.0, 2.0, 3.0] {
                match sub.try_recv() {
                    Some(SpectrumEvent::Primary(c)) => assert_eq!(c.y[0], expected),
                    other => panic!("unexpected event {other:?}"),
                }
            }
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let publisher = Publisher::new();
        let first = publisher.subscribe();
        let second = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);

        drop(first);
        assert_eq!(publisher.subscriber_count(), 1);

        second.cancel();
        assert_eq!(publisher.subscriber_count(), 0);
        publisher.publish(&SpectrumEvent::Log("nobody listens".to_string()));
    }

    #[test]
    fn test_late_subscriber_sees_only_new_events() {
        let publisher = Publisher::new();
        publisher.publish(&SpectrumEvent::Log("early".to_string()));

        let mut sub = publisher.subscribe();
        publisher.publish(&SpectrumEvent::Log("late".to_string()));

        assert!(matches!(sub.try_recv(), Some(SpectrumEvent::Log(m)) if m == "late"));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_history_snapshot_rows() {
        let snapshot = HistorySnapshot::new(vec![1.0, 2.0].into(), 2, vec![-1.0, -2.0, -3.0, -4.0]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.row(0), Some(&[-1.0, -2.0][..]));
        assert_eq!(snapshot.latest(), Some(&[-3.0, -4.0][..]));
        assert!(snapshot.row(2).is_none());
        assert_eq!(snapshot.rows().count(), 2);

        let empty = HistorySnapshot::default();
        assert!(empty.is_empty());
        assert!(empty.latest().is_none());
        assert_eq!(empty.rows().count(), 0);
    }
}
