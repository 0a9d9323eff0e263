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

//! Fixed-capacity ring of power rows for the waterfall.

/// Circular buffer of power vectors.
///
/// Rows live in one flat `capacity * bin_count` allocation. The row width
/// is fixed by the first append; a row of a different width resets the
/// history to the new width.
#[derive(Debug, Clone)]
pub struct RingHistory {
    capacity: usize,
    bin_count: usize,
    data: Vec<f32>,
    /// Row the next append writes to.
    head: usize,
    filled: usize,
    counter: u64,
}

impl RingHistory {
    /// Create an empty history holding at most `capacity` rows (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            bin_count: 0,
            data: Vec::new(),
            head: 0,
            filled: 0,
            counter: 0,
        }
    }

    /// Maximum number of rows kept.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Row width, or `None` before the first append.
    #[must_use]
    pub fn bin_count(&self) -> Option<usize> {
        (!self.data.is_empty()).then_some(self.bin_count)
    }

    /// Number of valid rows, at most `capacity`.
    #[must_use]
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Total rows appended since the last reset.
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Append a row, overwriting the oldest one when full.
    ///
    /// Returns `true` if the row width differed from the stored width and
    /// the history was reset before appending.
    pub fn append(&mut self, row: &[f32]) -> bool {
        let reset = !self.data.is_empty() && row.len() != self.bin_count;
        if self.data.is_empty() || reset {
            self.clear();
            self.bin_count = row.len();
            self.data = vec![0.0; self.capacity * row.len()];
        }

        let start = self.head * self.bin_count;
        self.data[start..start + self.bin_count].copy_from_slice(row);
        self.head = (self.head + 1) % self.capacity;
        self.filled = (self.filled + 1).min(self.capacity);
        self.counter += 1;
        reset
    }

    /// Drop every row and forget the row width.
    pub fn clear(&mut self) {
        self.data = Vec::new();
        self.bin_count = 0;
        self.head = 0;
        self.filled = 0;
        self.counter = 0;
    }

    /// View of the `filled` valid rows, oldest first.
    #[must_use]
    pub fn valid_slice(&self) -> HistoryView<'_> {
        let width = self.bin_count;
        let (older, newer) = if self.filled < self.capacity {
            (&self.data[..self.filled * width], &self.data[..0])
        } else {
            let split = self.head * width;
            (&self.data[split..], &self.data[..split])
        };
        HistoryView {
            older,
            newer,
            bin_count: width,
        }
    }

    /// Most recently appended row.
    #[must_use]
    pub fn latest(&self) -> Option<&[f32]> {
        if self.filled == 0 {
            return None;
        }
        let row = (self.head + self.capacity - 1) % self.capacity;
        let start = row * self.bin_count;
        Some(&self.data[start..start + self.bin_count])
    }
}

/// Borrowed, ordered view of a [`RingHistory`]'s valid rows.
///
/// The ring may wrap, so the rows are stored as two contiguous runs.
#[derive(Debug, Clone, Copy)]
pub struct HistoryView<'a> {
    older: &'a [f32],
    newer: &'a [f32],
    bin_count: usize,
}

impl<'a> HistoryView<'a> {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.bin_count == 0 {
            0
        } else {
            (self.older.len() + self.newer.len()) / self.bin_count
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows from oldest to newest.
    pub fn rows(&self) -> impl Iterator<Item = &'a [f32]> {
        let width = self.bin_count.max(1);
        self.older.chunks_exact(width).chain(self.newer.chunks_exact(width))
    }

    /// Row-major copy of every row, oldest first.
    #[must_use]
    pub fn to_flat_vec(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.older.len() + self.newer.len());
        flat.extend_from_slice(self.older);
        flat.extend_from_slice(self.newer);
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(value: f32, width: usize) -> Vec<f32> {
        vec![value; width]
    }

    #[test]
    fn test_partial_fill_keeps_insertion_order() {
        let mut history = RingHistory::new(4);
        assert!(history.valid_slice().is_empty());
        assert!(history.latest().is_none());

        history.append(&row(1.0, 3));
        history.append(&row(2.0, 3));

        let view = history.valid_slice();
        assert_eq!(view.len(), 2);
        let firsts: Vec<f32> = view.rows().map(|r| r[0]).collect();
        assert_eq!(firsts, vec![1.0, 2.0]);
        assert_eq!(history.latest(), Some(&[2.0, 2.0, 2.0][..]));
    }

    #[test]
    fn test_overflow_keeps_last_capacity_rows() {
        let capacity = 5;
        for extra in 1..=7 {
            let mut history = RingHistory::new(capacity);
            let total = capacity + extra;
            for i in 0..total {
                #[allow(clippy::cast_precision_loss, reason = "small test counts")]
                let value = i as f32;
                history.append(&row(value, 2));
            }

            assert_eq!(history.filled(), capacity);
            assert_eq!(history.counter(), total as u64);

            let rows: Vec<f32> = history.valid_slice().rows().map(|r| r[0]).collect();
            #[allow(clippy::cast_precision_loss, reason = "small test counts")]
            let expected: Vec<f32> = (total - capacity..total).map(|i| i as f32).collect();
            assert_eq!(rows, expected, "extra = {extra}");
            assert_eq!(history.valid_slice().to_flat_vec().len(), capacity * 2);
        }
    }

    #[test]
    fn test_width_change_resets() {
        let mut history = RingHistory::new(3);
        assert!(!history.append(&row(1.0, 4)));
        assert!(!history.append(&row(2.0, 4)));
        assert_eq!(history.bin_count(), Some(4));

        assert!(history.append(&row(3.0, 2)));
        assert_eq!(history.bin_count(), Some(2));
        assert_eq!(history.filled(), 1);
        assert_eq!(history.counter(), 1);
        assert_eq!(history.latest(), Some(&[3.0, 3.0][..]));
    }

    #[test]
    fn test_clear() {
        let mut history = RingHistory::new(2);
        history.append(&row(1.0, 2));
        history.clear();

        assert!(history.is_empty());
        assert_eq!(history.bin_count(), None);
        assert!(!history.append(&row(5.0, 7)));
        assert_eq!(history.bin_count(), Some(7));
    }
}
