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

//! Decoder for the `soapy_power_bin` records read from a dedicated pipe.
//!
//! Header (big-endian):
//! ```text
//! offset  size  field
//!      0     8  time_start    (u64)
//!      8     8  time_stop     (u64)
//!     16     8  start_freq_hz (u64)
//!     24     8  stop_freq_hz  (u64)
//!     32     4  step_hz       (u32)
//!     36     4  sample_count  (u32)
//!     40     4  flags         (u32)
//!     44     4  reserved      (u32)
//!     48     4  width         (u32)
//!     52     4  height        (u32)
//!     56     4  padding
//!     60     n  sample_count little-endian float32 bins
//! ```

use log::{debug, trace};

use super::{mhz_axis, read_f32_le, FrameBuffer, ProtocolError, SweepDecoder, SweepRecord, MAX_FRAME_BYTES};

/// Size of the fixed record header, padding included.
pub const HEADER_LEN: usize = 60;

#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    time_start: u64,
    time_stop: u64,
    start_freq_hz: u64,
    stop_freq_hz: u64,
    step_hz: u32,
    sample_count: usize,
    flags: u32,
    width: u32,
    height: u32,
}

impl RecordHeader {
    fn parse(bytes: &[u8]) -> Self {
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_be_bytes(raw)
        };
        let u32_at = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        Self {
            time_start: u64_at(0),
            time_stop: u64_at(8),
            start_freq_hz: u64_at(16),
            stop_freq_hz: u64_at(24),
            step_hz: u32_at(32),
            sample_count: u32_at(36) as usize,
            flags: u32_at(40),
            width: u32_at(48),
            height: u32_at(52),
        }
    }

    fn payload_len(&self) -> usize {
        self.sample_count.saturating_mul(4)
    }
}

/// Decoder for big-endian header records with float32 payloads.
#[derive(Debug, Default)]
pub struct PipeBinaryDecoder {
    buffer: FrameBuffer,
    lnb_lo_mhz: f64,
}

impl PipeBinaryDecoder {
    /// Create a decoder that adds `lnb_lo_mhz` to every frequency.
    #[must_use]
    pub fn new(lnb_lo_mhz: f64) -> Self {
        Self {
            buffer: FrameBuffer::new(),
            lnb_lo_mhz,
        }
    }
}

impl SweepDecoder for PipeBinaryDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.push(chunk);
    }

    fn next_record(&mut self) -> Result<Option<SweepRecord>, ProtocolError> {
        loop {
            let Some(header) = self.buffer.peek(HEADER_LEN).map(RecordHeader::parse) else {
                return Ok(None);
            };

            let payload_len = header.payload_len();
            if payload_len > MAX_FRAME_BYTES {
                self.buffer.clear();
                return Err(ProtocolError::FrameTooLarge {
                    declared: payload_len,
                    limit: MAX_FRAME_BYTES,
                });
            }

            let Some(frame) = self.buffer.try_take(HEADER_LEN + payload_len) else {
                return Ok(None);
            };

            if header.sample_count == 0 {
                debug!("Skipping empty soapy_power record");
                continue;
            }

            trace!(
                "soapy_power record {}..{}: {} bins, step {} Hz, flags {:#x}, {}x{}",
                header.time_start,
                header.time_stop,
                header.sample_count,
                header.step_hz,
                header.flags,
                header.width,
                header.height
            );

            #[allow(clippy::cast_precision_loss, reason = "frequencies in Hz fit an f64 mantissa")]
            let frequencies = mhz_axis(
                header.start_freq_hz as f64,
                header.stop_freq_hz as f64,
                header.sample_count,
                self.lnb_lo_mhz,
            );
            let powers = read_f32_le(&frame[HEADER_LEN..], header.sample_count);
            return Ok(Some(SweepRecord::from_parts(frequencies, powers)));
        }
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn finish(&mut self) -> usize {
        self.buffer.clear()
    }
}
