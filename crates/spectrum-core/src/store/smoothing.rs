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

//! Fixed-window smoothing filters for the primary curve.
//!
//! Two families are supported:
//! - Savitzky-Golay: a cubic least-squares fit over the window, evaluated at
//!   its centre. The first and last half-window points are taken from the
//!   fit over the first and last full window.
//! - Weighted moving average: the window function's coefficients, normalised
//!   to unit sum, convolved with the curve mirrored at both ends.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dsp::WindowFunction;

/// Highest polynomial order used by the Savitzky-Golay filter.
const SAVGOL_MAX_ORDER: usize = 3;

/// Smoothing filter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingKind {
    #[default]
    SavitzkyGolay,
    Rectangular,
    Hann,
    Hamming,
    Bartlett,
    Blackman,
}

impl SmoothingKind {
    /// All kinds, in display order.
    pub const ALL: [Self; 6] = [
        Self::SavitzkyGolay,
        Self::Rectangular,
        Self::Hann,
        Self::Hamming,
        Self::Bartlett,
        Self::Blackman,
    ];

    /// Window function for the moving-average kinds.
    #[must_use]
    pub const fn window(self) -> Option<WindowFunction> {
        match self {
            Self::SavitzkyGolay => None,
            Self::Rectangular => Some(WindowFunction::Rectangular),
            Self::Hann => Some(WindowFunction::Hann),
            Self::Hamming => Some(WindowFunction::Hamming),
            Self::Bartlett => Some(WindowFunction::Bartlett),
            Self::Blackman => Some(WindowFunction::Blackman),
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SavitzkyGolay => "savitzky_golay",
            Self::Rectangular => "rectangular",
            Self::Hann => "hann",
            Self::Hamming => "hamming",
            Self::Bartlett => "bartlett",
            Self::Blackman => "blackman",
        }
    }
}

impl FromStr for SmoothingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "savitzky_golay" | "savgol" => Ok(Self::SavitzkyGolay),
            "rectangular" | "boxcar" => Ok(Self::Rectangular),
            "hann" | "hanning" => Ok(Self::Hann),
            "hamming" => Ok(Self::Hamming),
            "bartlett" => Ok(Self::Bartlett),
            "blackman" => Ok(Self::Blackman),
            other => Err(format!("unknown smoothing kind '{other}'")),
        }
    }
}

/// Smoothing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub enabled: bool,
    /// Window length in bins. Even lengths are rounded up to the next odd one.
    pub window: usize,
    pub kind: SmoothingKind,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: 11,
            kind: SmoothingKind::SavitzkyGolay,
        }
    }
}

impl SmoothingConfig {
    /// Effective (odd) window length.
    #[must_use]
    pub fn effective_window(&self) -> usize {
        self.window | 1
    }

    /// Smooth `powers`, or `None` if smoothing is disabled or does not apply.
    ///
    /// Smoothing does not apply when the window is wider than the curve or
    /// too short to change it.
    #[must_use]
    pub fn apply(&self, powers: &[f32]) -> Option<Vec<f32>> {
        let window = self.effective_window();
        if !self.enabled || window < 3 || window > powers.len() {
            return None;
        }

        Some(match self.kind.window() {
            None => savitzky_golay(powers, window, SAVGOL_MAX_ORDER.min(window - 1)),
            Some(function) => weighted_average(powers, &function.coefficients(window)),
        })
    }
}

/// Savitzky-Golay filter with interpolated edges. Requires `3 <= window <= y.len()`, `window` odd.
fn savitzky_golay(y: &[f32], window: usize, order: usize) -> Vec<f32> {
    let half = window / 2;
    let fit = PolynomialFit::new(window, order);
    let center = fit.center_weights();

    let mut out = Vec::with_capacity(y.len());

    // Leading edge from the fit over the first window
    let head = fit.coefficients(&y[..window]);
    for i in 0..half {
        out.push(fit.evaluate(&head, i));
    }

    for i in half..y.len() - half {
        let acc: f64 = center
            .iter()
            .zip(&y[i - half..=i + half])
            .map(|(w, &v)| w * f64::from(v))
            .sum();
        #[allow(clippy::cast_possible_truncation, reason = "smoothed dB values fit in f32")]
        out.push(acc as f32);
    }

    let tail = fit.coefficients(&y[y.len() - window..]);
    for i in window - half..window {
        out.push(fit.evaluate(&tail, i));
    }

    out
}

/// Least-squares polynomial fit over a fixed window of equally spaced points.
///
/// Positions are scaled to [-1, 1] to keep the normal equations well
/// conditioned for wide windows.
struct PolynomialFit {
    /// Scaled position of each window point.
    positions: Vec<f64>,
    order: usize,
    /// Normal matrix AᵀA, row-major (order+1)².
    normal: Vec<f64>,
}

impl PolynomialFit {
    fn new(window: usize, order: usize) -> Self {
        let half = window / 2;
        #[allow(clippy::cast_precision_loss, reason = "window lengths are small")]
        let positions: Vec<f64> = (0..window)
            .map(|i| (i as f64 - half as f64) / half.max(1) as f64)
            .collect();

        let terms = order + 1;
        let mut normal = vec![0.0; terms * terms];
        for &t in &positions {
            let powers = monomials(t, order);
            for r in 0..terms {
                for c in 0..terms {
                    normal[r * terms + c] += powers[r] * powers[c];
                }
            }
        }

        Self {
            positions,
            order,
            normal,
        }
    }

    /// Convolution weights that evaluate the fit at the window centre.
    fn center_weights(&self) -> Vec<f64> {
        let mut unit = vec![0.0; self.order + 1];
        unit[0] = 1.0;
        let z = solve(&self.normal, &unit);
        self.positions
            .iter()
            .map(|&t| monomials(t, self.order).iter().zip(&z).map(|(a, b)| a * b).sum())
            .collect()
    }

    /// Polynomial coefficients fitting `values`.
    fn coefficients(&self, values: &[f32]) -> Vec<f64> {
        let mut rhs = vec![0.0; self.order + 1];
        for (&t, &v) in self.positions.iter().zip(values) {
            for (slot, p) in rhs.iter_mut().zip(monomials(t, self.order)) {
                *slot += p * f64::from(v);
            }
        }
        solve(&self.normal, &rhs)
    }

    /// Evaluate a fit at window index `index`.
    fn evaluate(&self, coefficients: &[f64], index: usize) -> f32 {
        let value: f64 = monomials(self.positions[index], self.order)
            .iter()
            .zip(coefficients)
            .map(|(p, c)| p * c)
            .sum();
        #[allow(clippy::cast_possible_truncation, reason = "smoothed dB values fit in f32")]
        let value = value as f32;
        value
    }
}

fn monomials(t: f64, order: usize) -> Vec<f64> {
    let mut powers = Vec::with_capacity(order + 1);
    let mut p = 1.0;
    for _ in 0..=order {
        powers.push(p);
        p *= t;
    }
    powers
}

/// Solve the square system `matrix * x = rhs` by Gaussian elimination with partial pivoting.
fn solve(matrix: &[f64], rhs: &[f64]) -> Vec<f64> {
    let n = rhs.len();
    let mut a = matrix.to_vec();
    let mut b = rhs.to_vec();

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i * n + col].abs().total_cmp(&a[j * n + col].abs()))
            .unwrap_or(col);
        if pivot != col {
            for k in 0..n {
                a.swap(col * n + k, pivot * n + k);
            }
            b.swap(col, pivot);
        }

        let diag = a[col * n + col];
        if diag.abs() < f64::EPSILON {
            continue;
        }
        for row in col + 1..n {
            let factor = a[row * n + col] / diag;
            for k in col..n {
                a[row * n + k] -= factor * a[col * n + k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let diag = a[row * n + row];
        if diag.abs() < f64::EPSILON {
            continue;
        }
        let known: f64 = (row + 1..n).map(|k| a[row * n + k] * x[k]).sum();
        x[row] = (b[row] - known) / diag;
    }
    x
}

/// Convolve with normalised `weights`, mirroring the curve at both ends.
fn weighted_average(y: &[f32], weights: &[f64]) -> Vec<f32> {
    let n = y.len();
    let half = weights.len() / 2;
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return y.to_vec();
    }

    let reflect = |j: isize| -> usize {
        #[allow(clippy::cast_possible_wrap, reason = "curve lengths are far below isize::MAX")]
        let last = n as isize - 1;
        let mirrored = if j < 0 {
            -j
        } else if j > last {
            2 * last - j
        } else {
            j
        };
        #[allow(clippy::cast_sign_loss, reason = "mirrored index is within 0..n")]
        let index = mirrored.clamp(0, last) as usize;
        index
    };

    (0..n)
        .map(|i| {
            #[allow(clippy::cast_possible_wrap, reason = "curve lengths are far below isize::MAX")]
            let first = i as isize - half as isize;
            let acc: f64 = weights
                .iter()
                .zip(first..)
                .map(|(w, j)| w * f64::from(y[reflect(j)]))
                .sum();
            #[allow(clippy::cast_possible_truncation, reason = "smoothed dB values fit in f32")]
            let value = (acc / total) as f32;
            value
        })
        .collect()
}
