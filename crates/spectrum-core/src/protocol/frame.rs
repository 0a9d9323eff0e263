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

//! Growable byte accumulator with "take a frame, keep the remainder" semantics.

/// Byte accumulator shared by all decoders.
///
/// Consumed bytes are tracked with a cursor and only compacted away on the
/// next [`push`](Self::push), so each byte is moved at most once after it
/// has been consumed.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    cursor: usize,
}

impl FrameBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the end of the buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.cursor > 0 {
            self.buf.drain(..self.cursor);
            self.cursor = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Unconsumed bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.cursor..]
    }

    /// Number of unconsumed bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Whether every pushed byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look at the first `len` unconsumed bytes without consuming them.
    #[must_use]
    pub fn peek(&self, len: usize) -> Option<&[u8]> {
        self.as_slice().get(..len)
    }

    /// Take exactly `len` bytes if that many are buffered.
    ///
    /// Returns `None` and leaves the buffer untouched otherwise.
    pub fn try_take(&mut self, len: usize) -> Option<&[u8]> {
        if self.len() < len {
            return None;
        }
        let start = self.cursor;
        self.cursor += len;
        Some(&self.buf[start..start + len])
    }

    /// Take a frame whose length is decided by `frame_len`.
    ///
    /// The closure inspects the unconsumed bytes and returns the complete
    /// frame length, or `None` if the frame is not complete yet.
    pub fn try_take_with<F>(&mut self, frame_len: F) -> Option<&[u8]>
    where
        F: FnOnce(&[u8]) -> Option<usize>,
    {
        let len = frame_len(self.as_slice())?;
        self.try_take(len)
    }

    /// Drop `len` bytes (or everything buffered, if fewer).
    pub fn skip(&mut self, len: usize) {
        self.cursor += len.min(self.len());
    }

    /// Drop every buffered byte and return how many there were.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len();
        self.buf.clear();
        self.cursor = 0;
        dropped
    }
}
