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

//! Protocol layer for sweep decoding.
//!
//! Every supported acquisition tool writes its measurements in a different
//! framing. This module provides a trait-based abstraction over those
//! framings: each decoder accumulates raw bytes and yields complete
//! [`SweepRecord`]s as soon as enough data has arrived.
//!
//! Supported framings:
//! - Text CSV rows (`rtl_power`)
//! - Length-prefixed binary records (`hackrf_sweep -B`)
//! - Raw interleaved float32 IQ, transformed with an FFT (`airspy_rx`)
//! - Big-endian header records delivered over a pipe (`soapy_power_bin`)

mod frame;
mod length_prefixed;
mod pipe_binary;
mod raw_iq;
mod text_csv;

pub use frame::FrameBuffer;
pub use length_prefixed::LengthPrefixedDecoder;
pub use pipe_binary::PipeBinaryDecoder;
pub use raw_iq::RawIqDecoder;
pub use text_csv::TextCsvDecoder;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::AcquisitionConfig;

/// Hard cap on a single frame (or text line) a decoder is willing to buffer.
///
/// Headers declaring a payload below this size are treated as incomplete
/// until the bytes arrive; anything larger is rejected.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Errors that can occur while decoding a sweep stream.
///
/// None of these are fatal to a session: the offending bytes are dropped and
/// decoding continues with whatever follows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame declares {declared} bytes, limit is {limit}")]
    FrameTooLarge { declared: usize, limit: usize },

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("sweep has {frequencies} frequencies but {powers} powers")]
    LengthMismatch { frequencies: usize, powers: usize },
}

/// One complete frequency/power scan.
///
/// Frequencies are in MHz and ascending, powers in dB. Both sequences have
/// the same length and are immutable once the record is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepRecord {
    frequencies: Arc<[f64]>,
    powers: Arc<[f32]>,
    timestamp: DateTime<Utc>,
}

impl SweepRecord {
    /// Build a record, checking that both sequences have the same length.
    pub fn new(frequencies: Vec<f64>, powers: Vec<f32>) -> Result<Self, ProtocolError> {
        if frequencies.len() != powers.len() {
            return Err(ProtocolError::LengthMismatch {
                frequencies: frequencies.len(),
                powers: powers.len(),
            });
        }
        Ok(Self::from_parts(frequencies, powers))
    }

    pub(crate) fn from_parts(frequencies: Vec<f64>, powers: Vec<f32>) -> Self {
        debug_assert_eq!(frequencies.len(), powers.len());
        Self {
            frequencies: frequencies.into(),
            powers: powers.into(),
            timestamp: Utc::now(),
        }
    }

    /// Replace the capture timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Bin frequencies in MHz.
    #[must_use]
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Shared handle to the frequency axis.
    #[must_use]
    pub fn frequency_axis(&self) -> Arc<[f64]> {
        Arc::clone(&self.frequencies)
    }

    /// Bin powers in dB.
    #[must_use]
    pub fn powers(&self) -> &[f32] {
        &self.powers
    }

    /// When the record was decoded.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Number of bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.powers.len()
    }

    /// Whether the record has no bins.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.powers.is_empty()
    }
}

/// Closed set of wire framings understood by the decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameFormat {
    /// Newline-delimited CSV rows.
    TextCsv,
    /// 24-byte header followed by little-endian float32 bins.
    LengthPrefixedBinary,
    /// Interleaved float32 I/Q samples.
    RawIq,
    /// 60-byte big-endian header records read from a dedicated pipe.
    PipeBinary,
}

impl FrameFormat {
    /// Whether the backend writes its records to a dedicated pipe instead of stdout.
    #[must_use]
    pub const fn uses_pipe(self) -> bool {
        matches!(self, Self::PipeBinary)
    }

    /// Human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::TextCsv => "text-csv",
            Self::LengthPrefixedBinary => "length-prefixed-binary",
            Self::RawIq => "raw-iq",
            Self::PipeBinary => "pipe-binary",
        }
    }
}

/// Trait for sweep decoders.
///
/// A decoder owns the undecoded remainder of its input. Bytes are pushed in
/// arbitrary chunks and complete records are pulled out one at a time, so
/// the result never depends on where the chunk boundaries fall.
pub trait SweepDecoder {
    /// Append raw bytes to the undecoded remainder.
    fn push(&mut self, chunk: &[u8]);

    /// Decode the next complete record, if one is buffered.
    ///
    /// Returns `Ok(None)` when the buffered bytes do not yet form a complete
    /// frame. After an `Err`, the offending bytes have been dropped and the
    /// decoder is ready to continue.
    fn next_record(&mut self) -> Result<Option<SweepRecord>, ProtocolError>;

    /// Number of bytes buffered but not yet decoded.
    fn pending(&self) -> usize;

    /// Discard the remainder at end of stream and return how many bytes were dropped.
    fn finish(&mut self) -> usize;

    /// Push a chunk and iterate over every record it completes.
    fn feed(&mut self, chunk: &[u8]) -> Feed<'_, Self>
    where
        Self: Sized,
    {
        self.push(chunk);
        Feed { decoder: self }
    }
}

/// Lazy iterator over the records completed by one [`SweepDecoder::feed`] call.
#[derive(Debug)]
pub struct Feed<'a, D> {
    decoder: &'a mut D,
}

impl<D: SweepDecoder> Iterator for Feed<'_, D> {
    type Item = Result<SweepRecord, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_record().transpose()
    }
}

/// Decoder selected once at session start from the backend's framing.
#[derive(Debug)]
pub enum Decoder {
    TextCsv(TextCsvDecoder),
    LengthPrefixed(LengthPrefixedDecoder),
    RawIq(RawIqDecoder),
    PipeBinary(PipeBinaryDecoder),
}

impl Decoder {
    /// Create the decoder for `format`, configured from the session parameters.
    #[must_use]
    pub fn for_format(format: FrameFormat, config: &AcquisitionConfig) -> Self {
        match format {
            FrameFormat::TextCsv => Self::TextCsv(TextCsvDecoder::new(config.lnb_lo_mhz)),
            FrameFormat::LengthPrefixedBinary => {
                Self::LengthPrefixed(LengthPrefixedDecoder::new(config.lnb_lo_mhz))
            }
            FrameFormat::RawIq => Self::RawIq(RawIqDecoder::new(
                config.start_freq_mhz,
                config.sample_rate,
                raw_iq::DEFAULT_BLOCK_SIZE,
                config.lnb_lo_mhz,
            )),
            FrameFormat::PipeBinary => Self::PipeBinary(PipeBinaryDecoder::new(config.lnb_lo_mhz)),
        }
    }

    /// The framing this decoder handles.
    #[must_use]
    pub const fn format(&self) -> FrameFormat {
        match self {
            Self::TextCsv(_) => FrameFormat::TextCsv,
            Self::LengthPrefixed(_) => FrameFormat::LengthPrefixedBinary,
            Self::RawIq(_) => FrameFormat::RawIq,
            Self::PipeBinary(_) => FrameFormat::PipeBinary,
        }
    }
}

impl SweepDecoder for Decoder {
    fn push(&mut self, chunk: &[u8]) {
        match self {
            Self::TextCsv(d) => d.push(chunk),
            Self::LengthPrefixed(d) => d.push(chunk),
            Self::RawIq(d) => d.push(chunk),
            Self::PipeBinary(d) => d.push(chunk),
        }
    }

    fn next_record(&mut self) -> Result<Option<SweepRecord>, ProtocolError> {
        match self {
            Self::TextCsv(d) => d.next_record(),
            Self::LengthPrefixed(d) => d.next_record(),
            Self::RawIq(d) => d.next_record(),
            Self::PipeBinary(d) => d.next_record(),
        }
    }

    fn pending(&self) -> usize {
        match self {
            Self::TextCsv(d) => d.pending(),
            Self::LengthPrefixed(d) => d.pending(),
            Self::RawIq(d) => d.pending(),
            Self::PipeBinary(d) => d.pending(),
        }
    }

    fn finish(&mut self) -> usize {
        match self {
            Self::TextCsv(d) => d.finish(),
            Self::LengthPrefixed(d) => d.finish(),
            Self::RawIq(d) => d.finish(),
            Self::PipeBinary(d) => d.finish(),
        }
    }
}

/// Evenly spaced values from `start` to `stop` inclusive, like `numpy.linspace`.
pub(crate) fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            #[allow(clippy::cast_precision_loss, reason = "bin counts are far below 2^52")]
            let step = (stop - start) / (count - 1) as f64;
            #[allow(clippy::cast_precision_loss, reason = "bin counts are far below 2^52")]
            let mut values: Vec<f64> = (0..count).map(|i| start + step * i as f64).collect();
            // Pin the last value so rounding never overshoots the declared edge
            values[count - 1] = stop;
            values
        }
    }
}

/// Convert a Hz edge pair to an MHz axis with the LNB offset applied.
pub(crate) fn mhz_axis(start_hz: f64, stop_hz: f64, count: usize, lnb_lo_mhz: f64) -> Vec<f64> {
    let mut axis = linspace(start_hz / 1e6, stop_hz / 1e6, count);
    apply_lnb_offset(&mut axis, lnb_lo_mhz);
    axis
}

pub(crate) fn apply_lnb_offset(axis: &mut [f64], lnb_lo_mhz: f64) {
    if lnb_lo_mhz != 0.0 {
        for f in axis.iter_mut() {
            *f += lnb_lo_mhz;
        }
    }
}

/// Read `count` little-endian float32 values.
pub(crate) fn read_f32_le(bytes: &[u8], count: usize) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .take(count)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
