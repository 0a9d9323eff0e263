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

//! Text CSV decoder for `rtl_power` output.
//!
//! Row format:
//! ```text
//! <date>, <time>, <hz_low>, <hz_high>, <hz_step>, <samples>, <db>, <db>, ...
//! ```
//!
//! Any other line (banners, tuner messages) is ignored.

use log::{debug, warn};

use super::{apply_lnb_offset, FrameBuffer, ProtocolError, SweepDecoder, SweepRecord, MAX_FRAME_BYTES};

/// Minimum number of fields in a data row.
const MIN_ROW_FIELDS: usize = 8;

/// Decoder for newline-delimited CSV sweep rows.
#[derive(Debug, Default)]
pub struct TextCsvDecoder {
    buffer: FrameBuffer,
    /// Leading pending bytes already searched without finding a newline.
    scanned: usize,
    lnb_lo_mhz: f64,
}

impl TextCsvDecoder {
    /// Create a decoder that adds `lnb_lo_mhz` to every frequency.
    #[must_use]
    pub fn new(lnb_lo_mhz: f64) -> Self {
        Self {
            buffer: FrameBuffer::new(),
            scanned: 0,
            lnb_lo_mhz,
        }
    }

    /// Length of the next complete line including its newline.
    ///
    /// Resumes the search where the previous call stopped, so a long line
    /// arriving in many chunks is scanned once.
    fn next_line_len(&mut self) -> Option<usize> {
        let pending = self.buffer.as_slice();
        match pending[self.scanned..].iter().position(|&b| b == b'\n') {
            Some(i) => {
                let len = self.scanned + i + 1;
                self.scanned = 0;
                Some(len)
            }
            None => {
                self.scanned = pending.len();
                None
            }
        }
    }
}

impl SweepDecoder for TextCsvDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.push(chunk);
    }

    fn next_record(&mut self) -> Result<Option<SweepRecord>, ProtocolError> {
        loop {
            let Some(line) = self.next_line_len().and_then(|len| self.buffer.try_take(len)) else {
                if self.buffer.len() > MAX_FRAME_BYTES {
                    self.scanned = 0;
                    let declared = self.buffer.clear();
                    return Err(ProtocolError::FrameTooLarge {
                        declared,
                        limit: MAX_FRAME_BYTES,
                    });
                }
                return Ok(None);
            };

            let line = String::from_utf8_lossy(line);
            if let Some(record) = parse_row(line.trim(), self.lnb_lo_mhz) {
                return Ok(Some(record));
            }
        }
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn finish(&mut self) -> usize {
        self.scanned = 0;
        self.buffer.clear()
    }
}

/// Whether the first field looks like a row marker (an integer, or a date such as `2024-01-01`).
fn is_row_marker(field: &str) -> bool {
    let digits: String = field.trim().chars().filter(|&c| c != '-').collect();
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Parse a single CSV line into a sweep, or `None` if it is not a valid data row.
fn parse_row(line: &str, lnb_lo_mhz: f64) -> Option<SweepRecord> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();

    if parts.len() < MIN_ROW_FIELDS || !is_row_marker(parts[0]) {
        return None;
    }

    let (Ok(low_hz), Ok(step_hz), Ok(num_steps)) = (
        parts[2].parse::<f64>(),
        parts[4].parse::<f64>(),
        parts[5].parse::<usize>(),
    ) else {
        warn!("Skipping malformed rtl_power row: {line}");
        return None;
    };

    let values = &parts[6..];
    if values.len() < num_steps {
        warn!(
            "Skipping rtl_power row: {} bins declared, {} present",
            num_steps,
            values.len()
        );
        return None;
    }

    let mut powers = Vec::with_capacity(num_steps);
    for value in &values[..num_steps] {
        match value.parse::<f32>() {
            Ok(db) => powers.push(db),
            Err(_) => {
                warn!("Skipping rtl_power row: invalid power value '{value}'");
                return None;
            }
        }
    }

    #[allow(clippy::cast_precision_loss, reason = "bin counts are far below 2^52")]
    let mut frequencies: Vec<f64> = (0..num_steps)
        .map(|i| (low_hz + i as f64 * step_hz) / 1e6)
        .collect();
    apply_lnb_offset(&mut frequencies, lnb_lo_mhz);

    debug!("rtl_power row: {} bins from {:.3} MHz", num_steps, low_hz / 1e6);
    Some(SweepRecord::from_parts(frequencies, powers))
}
