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

//! Raw IQ decoder for `airspy_rx` output.
//!
//! The tool streams interleaved little-endian float32 I/Q pairs with no
//! framing at all. Every `block_size` complete pairs are windowed, run
//! through a forward FFT and turned into one power sweep centred on the
//! tuned frequency.

use std::sync::Arc;

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::{apply_lnb_offset, FrameBuffer, ProtocolError, SweepDecoder, SweepRecord};
use crate::dsp::WindowFunction;

/// Bytes per interleaved I/Q pair.
pub const SAMPLE_PAIR_BYTES: usize = 8;

/// Number of I/Q pairs per FFT block.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Added to |X|² before taking the logarithm.
const POWER_EPSILON: f32 = 1e-10;

/// Decoder that turns a raw IQ stream into FFT power sweeps.
pub struct RawIqDecoder {
    buffer: FrameBuffer,
    block_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    frequencies: Vec<f64>,
    scratch: Vec<Complex<f32>>,
}

impl std::fmt::Debug for RawIqDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawIqDecoder")
            .field("block_size", &self.block_size)
            .field("pending", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl RawIqDecoder {
    /// Create a decoder for a stream tuned to `center_mhz` at `sample_rate` Hz.
    ///
    /// A `block_size` of zero is treated as one sample pair.
    #[must_use]
    pub fn new(center_mhz: f64, sample_rate: f64, block_size: usize, lnb_lo_mhz: f64) -> Self {
        let block_size = block_size.max(1);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(block_size);

        #[allow(clippy::cast_possible_truncation, reason = "window coefficients are in [0, 1]")]
        let window = WindowFunction::Hann
            .coefficients(block_size)
            .into_iter()
            .map(|w| w as f32)
            .collect();

        Self {
            buffer: FrameBuffer::new(),
            block_size,
            fft,
            window,
            frequencies: bin_frequencies(center_mhz, sample_rate, block_size, lnb_lo_mhz),
            scratch: Vec::with_capacity(block_size),
        }
    }

    /// Number of I/Q pairs per emitted sweep.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

/// Frequency of each shifted FFT bin, in MHz, ascending.
fn bin_frequencies(center_mhz: f64, sample_rate: f64, block_size: usize, lnb_lo_mhz: f64) -> Vec<f64> {
    #[allow(clippy::cast_precision_loss, reason = "block sizes are far below 2^52")]
    let bin_width_mhz = sample_rate / block_size as f64 / 1e6;
    let half = block_size / 2;

    #[allow(clippy::cast_precision_loss, reason = "block sizes are far below 2^52")]
    let mut axis: Vec<f64> = (0..block_size)
        .map(|k| center_mhz + (k as f64 - half as f64) * bin_width_mhz)
        .collect();
    apply_lnb_offset(&mut axis, lnb_lo_mhz);
    axis
}

impl SweepDecoder for RawIqDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.push(chunk);
    }

    fn next_record(&mut self) -> Result<Option<SweepRecord>, ProtocolError> {
        let Some(block) = self.buffer.try_take(self.block_size * SAMPLE_PAIR_BYTES) else {
            return Ok(None);
        };

        self.scratch.clear();
        self.scratch.extend(
            block
                .chunks_exact(SAMPLE_PAIR_BYTES)
                .zip(&self.window)
                .map(|(pair, &w)| {
                    let i = f32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
                    let q = f32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
                    Complex::new(i * w, q * w)
                }),
        );
        self.fft.process(&mut self.scratch);

        // Reorder so negative frequencies come first (fftshift)
        let n = self.block_size;
        let shift = n - n / 2;
        let powers = (0..n)
            .map(|k| {
                let bin = self.scratch[(k + shift) % n];
                10.0 * (bin.norm_sqr() + POWER_EPSILON).log10()
            })
            .collect();

        Ok(Some(SweepRecord::from_parts(self.frequencies.clone(), powers)))
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn finish(&mut self) -> usize {
        self.buffer.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(block_size: usize, blocks: usize, bin: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        #[allow(clippy::cast_precision_loss, reason = "test sizes are tiny")]
        for n in 0..block_size * blocks {
            let phase = 2.0 * std::f64::consts::PI * bin as f64 * n as f64 / block_size as f64;
            #[allow(clippy::cast_possible_truncation, reason = "test signal")]
            {
                bytes.extend_from_slice(&(phase.cos() as f32).to_le_bytes());
                bytes.extend_from_slice(&(phase.sin() as f32).to_le_bytes());
            }
        }
        bytes
    }

    #[test]
    fn test_one_record_per_block() {
        let mut decoder = RawIqDecoder::new(100.0, 2_500_000.0, 64, 0.0);
        let records: Vec<_> = decoder.feed(&tone(64, 3, 8)).map(Result::unwrap).collect();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].len(), 64);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_tone_lands_in_expected_bin() {
        let mut decoder = RawIqDecoder::new(100.0, 2_560_000.0, 64, 0.0);
        let records: Vec<_> = decoder.feed(&tone(64, 1, 8)).map(Result::unwrap).collect();
        let powers = records[0].powers();

        let peak = powers
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        // Bin 8 above DC, after shifting DC to index 32
        assert_eq!(peak, 40);
        assert!((records[0].frequencies()[peak] - 100.32).abs() < 1e-9);
    }

    #[test]
    fn test_axis_is_centered_and_ascending() {
        let decoder = RawIqDecoder::new(433.92, 2_500_000.0, 1024, 0.0);
        let axis = &decoder.frequencies;

        assert!((axis[512] - 433.92).abs() < 1e-9);
        assert!((axis[0] - (433.92 - 1.25)).abs() < 1e-9);
        assert!(axis.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_partial_samples_are_retained() {
        let block = tone(16, 1, 2);
        let mut decoder = RawIqDecoder::new(100.0, 2_500_000.0, 16, 0.0);

        assert_eq!(decoder.feed(&block[..block.len() - 5]).count(), 0);
        assert_eq!(decoder.pending(), block.len() - 5);
        assert_eq!(decoder.feed(&block[block.len() - 5..]).count(), 1);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let stream = tone(16, 2, 3);
        let mut whole = RawIqDecoder::new(100.0, 2_500_000.0, 16, 0.0);
        let expected: Vec<_> = whole.feed(&stream).map(Result::unwrap).collect();

        for split in 1..stream.len() {
            let mut decoder = RawIqDecoder::new(100.0, 2_500_000.0, 16, 0.0);
            let mut records: Vec<_> = decoder.feed(&stream[..split]).map(Result::unwrap).collect();
            records.extend(decoder.feed(&stream[split..]).map(Result::unwrap));

            assert_eq!(records.len(), expected.len(), "split at {split}");
            for (got, want) in records.iter().zip(&expected) {
                assert_eq!(got.frequencies(), want.frequencies());
                assert_eq!(got.powers(), want.powers());
            }
        }
    }
}
