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

//! Window functions shared by the IQ decoder and the smoothing filters.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Symmetric window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowFunction {
    /// w[n] = 1
    Rectangular,
    /// w[n] = 0.5 - 0.5*cos(2πn/(M-1))
    Hann,
    /// w[n] = 0.54 - 0.46*cos(2πn/(M-1))
    Hamming,
    /// w[n] = 1 - |2n/(M-1) - 1|
    Bartlett,
    /// w[n] = 0.42 - 0.5*cos(2πn/(M-1)) + 0.08*cos(4πn/(M-1))
    Blackman,
}

impl WindowFunction {
    /// Window coefficients w[n] for n = 0..length.
    #[must_use]
    pub fn coefficients(self, length: usize) -> Vec<f64> {
        if length <= 1 {
            return vec![1.0; length];
        }

        #[allow(clippy::cast_precision_loss, reason = "window lengths are small")]
        let span = (length - 1) as f64;

        (0..length)
            .map(|n| {
                #[allow(clippy::cast_precision_loss, reason = "window lengths are small")]
                let x = n as f64 / span;
                match self {
                    Self::Rectangular => 1.0,
                    Self::Hann => 0.5 - 0.5 * (2.0 * PI * x).cos(),
                    Self::Hamming => 0.54 - 0.46 * (2.0 * PI * x).cos(),
                    Self::Bartlett => 1.0 - (2.0 * x - 1.0).abs(),
                    Self::Blackman => 0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_are_symmetric_with_unit_center() {
        let length = 11;
        for window in [
            WindowFunction::Hann,
            WindowFunction::Hamming,
            WindowFunction::Bartlett,
            WindowFunction::Blackman,
        ] {
            let w = window.coefficients(length);
            assert_eq!(w.len(), length);
            assert!((w[0] - w[length - 1]).abs() < 1e-12, "{window:?}");
            assert!((w[length / 2] - 1.0).abs() < 1e-12, "{window:?}");
        }
    }

    #[test]
    fn test_hann_endpoints_are_zero() {
        let w = WindowFunction::Hann.coefficients(8);
        assert!(w[0].abs() < 1e-12);
        assert!(w[7].abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_lengths() {
        assert!(WindowFunction::Hann.coefficients(0).is_empty());
        assert_eq!(WindowFunction::Blackman.coefficients(1), vec![1.0]);
        assert!(WindowFunction::Rectangular.coefficients(5).iter().all(|&w| w == 1.0));
    }
}
