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

//! Peak detection and best-effort signal classification.
//!
//! Peaks are local maxima of the primary curve that pass height, separation
//! and prominence filters. Each peak's occupied bandwidth is measured by
//! walking outwards until the power falls 30 dB below the peak, and a
//! modulation guess is made from simple statistics of the curve around it.
//! The decision tables are heuristics, not a certified classifier.

use std::fmt;

use num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;

/// Minimum peak height in dB.
pub const MIN_HEIGHT_DB: f32 = -60.0;
/// Minimum peak prominence in dB.
pub const MIN_PROMINENCE_DB: f32 = 5.0;
/// Minimum separation between peaks in bins.
pub const MIN_DISTANCE_BINS: usize = 10;
/// Drop below the peak that bounds its occupied bandwidth.
pub const BANDWIDTH_DROP_DB: f32 = 30.0;
/// Peaks narrower than this are noise-floor wiggle.
pub const MIN_BANDWIDTH_MHZ: f64 = 0.01;
/// Width of the analysis window around a peak, in bins.
pub const ANALYSIS_WINDOW_BINS: usize = 50;

const MIN_SEGMENT_LEN: usize = 10;
const MIN_ENTROPY_LEN: usize = 16;
const EPSILON: f64 = 1e-10;

/// Coarse modulation guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Modulation {
    #[serde(rename = "AM")]
    Am,
    #[serde(rename = "FM")]
    Fm,
    Digital,
    #[serde(rename = "FSK/PSK")]
    FskPsk,
    Unknown,
}

impl Modulation {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Am => "AM",
            Self::Fm => "FM",
            Self::Digital => "Digital",
            Self::FskPsk => "FSK/PSK",
            Self::Unknown => "Unknown",
        }
    }

    /// Human-readable signal type for this modulation at `bandwidth_mhz`.
    #[must_use]
    pub fn signal_type(self, bandwidth_mhz: f64) -> &'static str {
        match self {
            Self::Am => {
                if bandwidth_mhz < 0.01 {
                    "AM Narrowband (Aviation, Ham)"
                } else if bandwidth_mhz < 0.1 {
                    "AM Broadcast (MW/SW)"
                } else {
                    "AM Wideband"
                }
            }
            Self::Fm => {
                if bandwidth_mhz > 0.05 && bandwidth_mhz < 0.25 {
                    "FM Broadcast"
                } else if bandwidth_mhz < 0.03 {
                    "NBFM (Radio Amateur)"
                } else {
                    "Wide FM"
                }
            }
            Self::Digital => {
                if bandwidth_mhz < 0.02 {
                    "LoRa / Sigfox"
                } else if bandwidth_mhz < 0.2 {
                    "DMR / D-STAR / NXDN"
                } else if bandwidth_mhz < 1.0 {
                    "DAB / ATSC / DVB-T"
                } else {
                    "Wideband Digital"
                }
            }
            Self::FskPsk => {
                if bandwidth_mhz < 0.05 {
                    "AX.25 / RTTY / FSK"
                } else {
                    "PSK31 / QPSK"
                }
            }
            Self::Unknown => {
                if bandwidth_mhz < 0.01 {
                    "CW / Beacon"
                } else {
                    "Unknown Signal"
                }
            }
        }
    }
}

impl fmt::Display for Modulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One classified peak.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeakRecord {
    pub frequency_mhz: f64,
    pub amplitude_db: f32,
    /// Lower bandwidth bound in MHz.
    pub left_mhz: f64,
    /// Upper bandwidth bound in MHz.
    pub right_mhz: f64,
    pub bandwidth_mhz: f64,
    pub modulation: Modulation,
    pub signal_type: &'static str,
}

/// Statistics of the curve around a peak.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SegmentFeatures {
    variance: f64,
    zero_crossing_rate: f64,
    entropy: f64,
}

/// Peak finder and classifier with configurable thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakClassifier {
    pub min_height_db: f32,
    pub min_prominence_db: f32,
    pub min_distance_bins: usize,
    pub bandwidth_drop_db: f32,
    pub min_bandwidth_mhz: f64,
    pub analysis_window_bins: usize,
}

impl Default for PeakClassifier {
    fn default() -> Self {
        Self {
            min_height_db: MIN_HEIGHT_DB,
            min_prominence_db: MIN_PROMINENCE_DB,
            min_distance_bins: MIN_DISTANCE_BINS,
            bandwidth_drop_db: BANDWIDTH_DROP_DB,
            min_bandwidth_mhz: MIN_BANDWIDTH_MHZ,
            analysis_window_bins: ANALYSIS_WINDOW_BINS,
        }
    }
}

impl PeakClassifier {
    /// Find, measure and classify the peaks of a curve, in ascending frequency.
    #[must_use]
    pub fn classify(&self, x: &[f64], y: &[f32]) -> Vec<PeakRecord> {
        let n = x.len().min(y.len());
        let (x, y) = (&x[..n], &y[..n]);

        let mut planner = FftPlanner::new();
        self.find_peaks(y)
            .into_iter()
            .filter_map(|peak| {
                let (left, right) = self.bounds(y, peak);
                let bandwidth_mhz = if right > left { x[right] - x[left] } else { 0.0 };
                if bandwidth_mhz < self.min_bandwidth_mhz {
                    return None;
                }

                let modulation = self.modulation_at(y, peak, &mut planner);
                Some(PeakRecord {
                    frequency_mhz: x[peak],
                    amplitude_db: y[peak],
                    left_mhz: x[left],
                    right_mhz: x[right],
                    bandwidth_mhz,
                    modulation,
                    signal_type: modulation.signal_type(bandwidth_mhz),
                })
            })
            .collect()
    }

    /// Indices of the peaks passing every filter, ascending.
    ///
    /// Filters apply in order: height, then separation (taller peaks win),
    /// then prominence.
    #[must_use]
    pub fn find_peaks(&self, y: &[f32]) -> Vec<usize> {
        let candidates: Vec<usize> = local_maxima(y)
            .into_iter()
            .filter(|&i| y[i] >= self.min_height_db)
            .collect();

        select_by_distance(y, &candidates, self.min_distance_bins)
            .into_iter()
            .filter(|&i| prominence(y, i) >= self.min_prominence_db)
            .collect()
    }

    /// Walk out from `peak` while the power stays above the drop threshold.
    fn bounds(&self, y: &[f32], peak: usize) -> (usize, usize) {
        let threshold = y[peak] - self.bandwidth_drop_db;
        let mut left = peak;
        while left > 0 && y[left] > threshold {
            left -= 1;
        }
        let mut right = peak;
        while right + 1 < y.len() && y[right] > threshold {
            right += 1;
        }
        (left, right)
    }

    fn modulation_at(&self, y: &[f32], peak: usize, planner: &mut FftPlanner<f64>) -> Modulation {
        let half = self.analysis_window_bins / 2;
        let segment = &y[peak.saturating_sub(half)..(peak + half).min(y.len())];
        if segment.len() < MIN_SEGMENT_LEN {
            return Modulation::Unknown;
        }
        decide(&features(segment, planner))
    }
}

fn decide(f: &SegmentFeatures) -> Modulation {
    if f.variance > 15.0 && f.zero_crossing_rate > 0.3 {
        Modulation::Digital
    } else if f.variance > 8.0 && f.entropy > 2.0 {
        Modulation::Fm
    } else if f.variance < 5.0 && f.entropy < 1.5 {
        Modulation::Am
    } else if f.zero_crossing_rate > 0.4 {
        Modulation::FskPsk
    } else {
        Modulation::Unknown
    }
}

#[allow(clippy::cast_precision_loss, reason = "segment lengths are small")]
fn features(segment: &[f32], planner: &mut FftPlanner<f64>) -> SegmentFeatures {
    let n = segment.len();
    let values: Vec<f64> = segment.iter().map(|&v| f64::from(v)).collect();
    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;

    let crossings = segment
        .windows(2)
        .filter(|w| w[0].is_sign_negative() != w[1].is_sign_negative())
        .count();
    let zero_crossing_rate = crossings as f64 / (2 * n) as f64;

    let entropy = if n > MIN_ENTROPY_LEN {
        let mut spectrum: Vec<Complex<f64>> = values.iter().map(|v| Complex::new(v - mean, 0.0)).collect();
        planner.plan_fft_forward(n).process(&mut spectrum);

        let magnitudes: Vec<f64> = spectrum[..n / 2].iter().map(|c| c.norm()).collect();
        let total = magnitudes.iter().sum::<f64>() + EPSILON;
        -magnitudes
            .iter()
            .map(|m| {
                let p = m / total;
                p * (p + EPSILON).log2()
            })
            .sum::<f64>()
    } else {
        0.0
    };

    SegmentFeatures {
        variance,
        zero_crossing_rate,
        entropy,
    }
}

/// Local maxima, taking the middle of flat tops. Edges never qualify.
#[allow(clippy::float_cmp, reason = "flat tops are exact repeats")]
fn local_maxima(y: &[f32]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if y.len() < 3 {
        return peaks;
    }

    let last = y.len() - 1;
    let mut i = 1;
    while i < last {
        if y[i - 1] < y[i] {
            let mut ahead = i + 1;
            while ahead < last && y[ahead] == y[i] {
                ahead += 1;
            }
            if y[ahead] < y[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

/// Drop peaks closer than `distance` bins to a taller kept peak.
fn select_by_distance(y: &[f32], peaks: &[usize], distance: usize) -> Vec<usize> {
    if distance <= 1 || peaks.len() < 2 {
        return peaks.to_vec();
    }

    let mut keep = vec![true; peaks.len()];
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    // Stable sort, so equal heights favour the rightmost peak when walked in reverse
    order.sort_by(|&a, &b| y[peaks[a]].total_cmp(&y[peaks[b]]));

    for &j in order.iter().rev() {
        if !keep[j] {
            continue;
        }
        let mut k = j;
        while k > 0 && peaks[j] - peaks[k - 1] < distance {
            keep[k - 1] = false;
            k -= 1;
        }
        let mut k = j + 1;
        while k < peaks.len() && peaks[k] - peaks[j] < distance {
            keep[k] = false;
            k += 1;
        }
    }

    peaks
        .iter()
        .zip(keep)
        .filter_map(|(&p, kept)| kept.then_some(p))
        .collect()
}

/// Height of `peak` above the higher of the lowest points between it and
/// the nearest taller sample on either side.
fn prominence(y: &[f32], peak: usize) -> f32 {
    let height = y[peak];

    let mut left_min = height;
    for &v in y[..peak].iter().rev() {
        if v > height {
            break;
        }
        left_min = left_min.min(v);
    }

    let mut right_min = height;
    for &v in &y[peak + 1..] {
        if v > height {
            break;
        }
        right_min = right_min.min(v);
    }

    height - left_min.max(right_min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(n: usize, step_mhz: f64) -> Vec<f64> {
        (0..n).map(|i| 100.0 + i as f64 * step_mhz).collect()
    }

    /// Noise floor at -90 dB with triangular bumps of the given half-width.
    fn spectrum(n: usize, bumps: &[(usize, f32, usize)]) -> Vec<f32> {
        let mut y: Vec<f32> = vec![-90.0; n];
        for &(center, top, half_width) in bumps {
            for (i, v) in y.iter_mut().enumerate() {
                let d = center.abs_diff(i);
                if d <= half_width {
                    #[allow(clippy::cast_precision_loss, reason = "test data")]
                    let level = top - (top + 90.0) * d as f32 / half_width as f32;
                    *v = v.max(level);
                }
            }
        }
        y
    }

    #[test]
    fn test_local_maxima_plateau_midpoint() {
        let y = [0.0, 1.0, 3.0, 3.0, 3.0, 1.0, 0.0, 2.0, 2.0];
        // Trailing plateau runs into the edge and does not qualify
        assert_eq!(local_maxima(&y), vec![3]);
        assert_eq!(local_maxima(&[1.0, 0.0, 1.0]), Vec::<usize>::new());
    }

    #[test]
    fn test_height_filter() {
        let y = spectrum(200, &[(50, -30.0, 10), (150, -70.0, 10)]);
        let peaks = PeakClassifier::default().find_peaks(&y);
        assert_eq!(peaks, vec![50]);
    }

    #[test]
    fn test_distance_keeps_taller_peak() {
        let mut y = vec![-90.0f32; 100];
        y[40] = -20.0;
        y[45] = -10.0;
        y[70] = -30.0;
        let peaks = PeakClassifier::default().find_peaks(&y);
        assert_eq!(peaks, vec![45, 70]);
    }

    #[test]
    fn test_prominence_filter() {
        let mut y = vec![-40.0f32; 100];
        y[30] = -38.0;
        y[60] = -20.0;
        assert!((prominence(&y, 30) - 2.0).abs() < 1e-6);
        assert_eq!(PeakClassifier::default().find_peaks(&y), vec![60]);
    }

    #[test]
    fn test_bounds_and_bandwidth() {
        let y = spectrum(400, &[(200, -20.0, 20)]);
        let x = axis(400, 0.01);
        let peaks = PeakClassifier::default().classify(&x, &y);
        assert_eq!(peaks.len(), 1);

        let peak = &peaks[0];
        assert!((peak.frequency_mhz - 102.0).abs() < 1e-9);
        assert!((peak.amplitude_db - -20.0).abs() < 1e-6);
        // 70 dB over 20 bins drops 30 dB within 9 bins: the first sample at or below -50 dB
        assert!((peak.left_mhz - 101.91).abs() < 1e-9);
        assert!((peak.right_mhz - 102.09).abs() < 1e-9);
        assert!((peak.bandwidth_mhz - 0.18).abs() < 1e-9);
    }

    #[test]
    fn test_narrow_peak_discarded() {
        let y = spectrum(200, &[(100, -20.0, 3)]);
        let x = axis(200, 0.001);
        assert!(PeakClassifier::default().classify(&x, &y).is_empty());
    }

    #[test]
    fn test_decision_table() {
        let f = |variance, zero_crossing_rate, entropy| SegmentFeatures {
            variance,
            zero_crossing_rate,
            entropy,
        };
        assert_eq!(decide(&f(20.0, 0.35, 0.0)), Modulation::Digital);
        assert_eq!(decide(&f(10.0, 0.0, 2.5)), Modulation::Fm);
        assert_eq!(decide(&f(2.0, 0.0, 1.0)), Modulation::Am);
        assert_eq!(decide(&f(6.0, 0.45, 1.8)), Modulation::FskPsk);
        assert_eq!(decide(&f(6.0, 0.1, 1.8)), Modulation::Unknown);
    }

    #[test]
    fn test_signal_type_table() {
        assert_eq!(Modulation::Am.signal_type(0.005), "AM Narrowband (Aviation, Ham)");
        assert_eq!(Modulation::Am.signal_type(0.05), "AM Broadcast (MW/SW)");
        assert_eq!(Modulation::Fm.signal_type(0.2), "FM Broadcast");
        assert_eq!(Modulation::Fm.signal_type(0.02), "NBFM (Radio Amateur)");
        assert_eq!(Modulation::Fm.signal_type(0.04), "Wide FM");
        assert_eq!(Modulation::Digital.signal_type(1.5), "Wideband Digital");
        assert_eq!(Modulation::FskPsk.signal_type(0.01), "AX.25 / RTTY / FSK");
        assert_eq!(Modulation::Unknown.signal_type(0.5), "Unknown Signal");
    }

    #[test]
    fn test_flat_segment_features() {
        let mut planner = FftPlanner::new();
        let features = features(&[-50.0; 32], &mut planner);
        assert!(features.variance.abs() < 1e-12);
        assert!(features.zero_crossing_rate.abs() < 1e-12);
        assert!(features.entropy.abs() < 1e-6);
        assert_eq!(decide(&features), Modulation::Am);
    }

    #[test]
    fn test_short_segment_is_unknown() {
        let y = [-50.0, -40.0, -30.0, -40.0, -50.0];
        let classifier = PeakClassifier::default();
        let mut planner = FftPlanner::new();
        assert_eq!(classifier.modulation_at(&y, 2, &mut planner), Modulation::Unknown);
    }

    #[test]
    fn test_peak_record_serializes_labels() {
        let record = PeakRecord {
            frequency_mhz: 100.0,
            amplitude_db: -20.0,
            left_mhz: 99.9,
            right_mhz: 100.1,
            bandwidth_mhz: 0.2,
            modulation: Modulation::FskPsk,
            signal_type: Modulation::FskPsk.signal_type(0.2),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"modulation\":\"FSK/PSK\""));
        assert!(json.contains("PSK31 / QPSK"));
    }
}
