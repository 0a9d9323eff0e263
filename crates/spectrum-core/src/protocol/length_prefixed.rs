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

//! Length-prefixed binary decoder for `hackrf_sweep -B` output.
//!
//! Record format (little-endian):
//! ```text
//! offset  size  field
//!      0     8  low_edge_hz   (u64)
//!      8     8  high_edge_hz  (u64)
//!     16     4  record_length (u32, payload bytes)
//!     20     4  reserved
//!     24     n  record_length / 4 float32 bins
//! ```

use log::debug;

use super::{mhz_axis, read_f32_le, FrameBuffer, ProtocolError, SweepDecoder, SweepRecord, MAX_FRAME_BYTES};

/// Size of the fixed record header.
pub const HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    low_edge_hz: u64,
    high_edge_hz: u64,
    record_length: usize,
}

impl RecordHeader {
    fn parse(bytes: &[u8]) -> Self {
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        Self {
            low_edge_hz: u64_at(0),
            high_edge_hz: u64_at(8),
            record_length: length as usize,
        }
    }
}

/// Decoder for length-prefixed float32 sweep records.
#[derive(Debug, Default)]
pub struct LengthPrefixedDecoder {
    buffer: FrameBuffer,
    lnb_lo_mhz: f64,
}

impl LengthPrefixedDecoder {
    /// Create a decoder that adds `lnb_lo_mhz` to every frequency.
    #[must_use]
    pub fn new(lnb_lo_mhz: f64) -> Self {
        Self {
            buffer: FrameBuffer::new(),
            lnb_lo_mhz,
        }
    }
}

impl SweepDecoder for LengthPrefixedDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.push(chunk);
    }

    fn next_record(&mut self) -> Result<Option<SweepRecord>, ProtocolError> {
        loop {
            let Some(header) = self.buffer.peek(HEADER_LEN).map(RecordHeader::parse) else {
                return Ok(None);
            };

            if header.record_length > MAX_FRAME_BYTES {
                // The header cannot be trusted, so nothing after it can be resynchronised
                self.buffer.clear();
                return Err(ProtocolError::FrameTooLarge {
                    declared: header.record_length,
                    limit: MAX_FRAME_BYTES,
                });
            }

            let Some(frame) = self.buffer.try_take(HEADER_LEN + header.record_length) else {
                return Ok(None);
            };
            let payload = &frame[HEADER_LEN..];

            if header.record_length % 4 != 0 {
                return Err(ProtocolError::Truncated {
                    expected: header.record_length.next_multiple_of(4),
                    actual: header.record_length,
                });
            }

            let count = header.record_length / 4;
            if count == 0 {
                debug!("Skipping empty hackrf_sweep record");
                continue;
            }

            #[allow(clippy::cast_precision_loss, reason = "frequencies in Hz fit an f64 mantissa")]
            let frequencies = mhz_axis(
                header.low_edge_hz as f64,
                header.high_edge_hz as f64,
                count,
                self.lnb_lo_mhz,
            );
            let powers = read_f32_le(payload, count);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_record(low: u64, high: u64, powers: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + powers.len() * 4);
        bytes.extend_from_slice(&low.to_le_bytes());
        bytes.extend_from_slice(&high.to_le_bytes());
        let length = u32::try_from(powers.len() * 4).unwrap();
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.extend_from_slice(&[0; 4]);
        for p in powers {
            bytes.extend_from_slice(&p.to_le_bytes());
        }
        bytes
    }

    fn collect(decoder: &mut LengthPrefixedDecoder, chunk: &[u8]) -> Vec<SweepRecord> {
        decoder.feed(chunk).map(Result::unwrap).collect()
    }

    #[test]
    fn test_decode_two_bin_record() {
        let mut decoder = LengthPrefixedDecoder::new(0.0);
        let records = collect(&mut decoder, &encode_record(100_000_000, 100_000_004, &[-30.0, -20.0]));

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].frequencies(), &[100.0, 100.000_004]);
        assert_eq!(records[0].powers(), &[-30.0, -20.0]);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let mut stream = encode_record(100_000_000, 105_000_000, &[-30.0, -20.0, -25.0, -40.0]);
        stream.extend(encode_record(105_000_000, 110_000_000, &[-35.0, -22.0, -21.0, -60.0]));

        let mut whole = LengthPrefixedDecoder::new(0.0);
        let expected = collect(&mut whole, &stream);
        assert_eq!(expected.len(), 2);

        for split in 1..stream.len() {
            let mut decoder = LengthPrefixedDecoder::new(0.0);
            let mut records = collect(&mut decoder, &stream[..split]);
            records.extend(collect(&mut decoder, &stream[split..]));

            assert_eq!(records.len(), 2, "split at {split}");
            for (got, want) in records.iter().zip(&expected) {
                assert_eq!(got.frequencies(), want.frequencies());
                assert_eq!(got.powers(), want.powers());
            }
        }
    }

    #[test]
    fn test_truncated_record_is_retained() {
        let record = encode_record(100_000_000, 100_000_004, &[-30.0, -20.0]);
        let truncated = &record[..record.len() - 3];

        let mut decoder = LengthPrefixedDecoder::new(0.0);
        assert!(collect(&mut decoder, truncated).is_empty());
        assert_eq!(decoder.pending(), truncated.len());

        let records = collect(&mut decoder, &record[record.len() - 3..]);
        assert_eq!(records.len(), 1);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&1u64.to_le_bytes());
        header.extend_from_slice(&2u64.to_le_bytes());
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        header.extend_from_slice(&[0; 4]);

        let mut decoder = LengthPrefixedDecoder::new(0.0);
        let results: Vec<_> = decoder.feed(&header).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ProtocolError::FrameTooLarge { .. })));
        assert_eq!(decoder.pending(), 0);

        // Decoding continues with the next well-formed record
        let records = collect(&mut decoder, &encode_record(1, 2, &[-1.0]));
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_unaligned_payload_is_dropped() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&6u32.to_le_bytes());
        bytes.extend_from_slice(&[0; 4]);
        bytes.extend_from_slice(&[0; 6]);
        bytes.extend(encode_record(1, 2, &[-7.0]));

        let mut decoder = LengthPrefixedDecoder::new(0.0);
        let results: Vec<_> = decoder.feed(&bytes).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(ProtocolError::Truncated { expected: 8, actual: 6 })));
        assert_eq!(results[1].as_ref().unwrap().powers(), &[-7.0]);
    }

    #[test]
    fn test_lnb_offset_applied() {
        let mut decoder = LengthPrefixedDecoder::new(9750.0);
        let records = collect(&mut decoder, &encode_record(1_000_000_000, 1_001_000_000, &[-1.0, -2.0]));
        assert_eq!(records[0].frequencies(), &[10_750.0, 10_751.0]);
    }
}
