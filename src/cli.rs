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

//! Command-line arguments. Every setting is optional and overrides the
//! persisted configuration when given.

use std::path::PathBuf;

use clap::Parser;
use spectrum_core::SmoothingKind;

use crate::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "spectrum-analyzer", version, about = "Run an SDR power-scanning tool and track its spectrum")]
#[allow(clippy::struct_excessive_bools, reason = "independent command-line flags")]
pub struct Cli {
    // Backend
    /// Backend tool to run (see --list-backends)
    #[arg(short, long, help_heading = "Backend")]
    pub backend: Option<String>,

    /// List the available backends and exit
    #[arg(long, action, help_heading = "Backend")]
    pub list_backends: bool,

    // Acquisition
    /// Start frequency in MHz (tuned centre for IQ backends)
    #[arg(long, help_heading = "Acquisition")]
    pub start: Option<f64>,

    /// End frequency in MHz
    #[arg(long, help_heading = "Acquisition")]
    pub end: Option<f64>,

    /// Bin width in kHz
    #[arg(long, help_heading = "Acquisition")]
    pub step: Option<f64>,

    /// Receiver gain in dB
    #[arg(short, long, help_heading = "Acquisition")]
    pub gain: Option<f64>,

    /// Integration interval in seconds
    #[arg(long, help_heading = "Acquisition")]
    pub interval: Option<f64>,

    /// Device identifier (SoapySDR driver name)
    #[arg(long, help_heading = "Acquisition")]
    pub device: Option<String>,

    /// Sample rate in Hz
    #[arg(long, help_heading = "Acquisition")]
    pub sample_rate: Option<f64>,

    /// Frequency correction in ppm
    #[arg(long, allow_hyphen_values = true, help_heading = "Acquisition")]
    pub ppm: Option<i32>,

    /// LNA gain in dB
    #[arg(long, help_heading = "Acquisition")]
    pub lna_gain: Option<u32>,

    /// Filter bandwidth in Hz (0 for the tool's default)
    #[arg(long, help_heading = "Acquisition")]
    pub bandwidth: Option<f64>,

    /// LNB local oscillator offset in MHz
    #[arg(long, allow_hyphen_values = true, help_heading = "Acquisition")]
    pub lnb_lo: Option<f64>,

    // Processing
    /// Number of sweeps kept for the waterfall
    #[arg(long, help_heading = "Processing")]
    pub history_size: Option<usize>,

    /// Enable smoothing of the primary curve
    #[arg(long, action, conflicts_with = "no_smooth", help_heading = "Processing")]
    pub smooth: bool,

    /// Disable smoothing of the primary curve
    #[arg(long, action, help_heading = "Processing")]
    pub no_smooth: bool,

    /// Smoothing window length in bins
    #[arg(long, help_heading = "Processing")]
    pub smooth_window: Option<usize>,

    /// Smoothing filter (savitzky_golay, rectangular, hann, hamming, bartlett, blackman)
    #[arg(long, help_heading = "Processing")]
    pub smooth_kind: Option<SmoothingKind>,

    /// Baseline CSV file (freq,db with a header row) to subtract
    #[arg(long, help_heading = "Processing")]
    pub baseline: Option<PathBuf>,

    // Output
    /// Stop after this many seconds
    #[arg(long, help_heading = "Output")]
    pub duration: Option<u64>,

    /// Seconds between peak reports (0 disables them)
    #[arg(long, help_heading = "Output")]
    pub peak_interval: Option<u64>,

    /// Leave peaks weaker than this out of reports (dB)
    #[arg(long, allow_hyphen_values = true, help_heading = "Output")]
    pub min_peak_db: Option<f32>,

    /// Leave peaks narrower than this out of reports (MHz)
    #[arg(long, help_heading = "Output")]
    pub min_peak_width_mhz: Option<f64>,

    /// Print peak reports as JSON lines on stdout
    #[arg(long, action, help_heading = "Output")]
    pub json: bool,

    /// Write the average curve to this CSV file on exit
    #[arg(long, help_heading = "Output")]
    pub save_average: Option<PathBuf>,

    /// Store the merged settings as the new defaults
    #[arg(long, action, help_heading = "Output")]
    pub save_config: bool,
}

impl Cli {
    /// Overlay the given arguments on `config`.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(backend) = &self.backend {
            config.backend.clone_from(backend);
        }

        let acquisition = &mut config.acquisition;
        set(&mut acquisition.start_freq_mhz, self.start);
        set(&mut acquisition.end_freq_mhz, self.end);
        set(&mut acquisition.step_khz, self.step);
        set(&mut acquisition.gain, self.gain);
        set(&mut acquisition.interval_secs, self.interval);
        set(&mut acquisition.device, self.device.clone());
        set(&mut acquisition.sample_rate, self.sample_rate);
        set(&mut acquisition.ppm, self.ppm);
        set(&mut acquisition.lna_gain, self.lna_gain);
        set(&mut acquisition.bandwidth, self.bandwidth);
        set(&mut acquisition.lnb_lo_mhz, self.lnb_lo);

        set(&mut config.history_size, self.history_size);
        if self.smooth {
            config.smoothing.enabled = true;
        }
        if self.no_smooth {
            config.smoothing.enabled = false;
        }
        set(&mut config.smoothing.window, self.smooth_window);
        set(&mut config.smoothing.kind, self.smooth_kind);
        if let Some(path) = &self.baseline {
            config.baseline_file = Some(path.clone());
        }
        set(&mut config.peak_report_interval_secs, self.peak_interval);
        set(&mut config.min_peak_db, self.min_peak_db);
        set(&mut config.min_peak_width_mhz, self.min_peak_width_mhz);
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_only_given_values() {
        let cli = Cli::parse_from([
            "spectrum-analyzer",
            "--backend",
            "hackrf_sweep",
            "--start",
            "2400",
            "--end",
            "2500",
            "--lnb-lo",
            "-9750",
            "--smooth",
            "--smooth-kind",
            "hann",
        ]);

        let mut config = AppConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.backend, "hackrf_sweep");
        assert!((config.acquisition.start_freq_mhz - 2400.0).abs() < f64::EPSILON);
        assert!((config.acquisition.end_freq_mhz - 2500.0).abs() < f64::EPSILON);
        assert!((config.acquisition.lnb_lo_mhz + 9750.0).abs() < f64::EPSILON);
        assert!((config.acquisition.gain - 20.0).abs() < f64::EPSILON);
        assert!(config.smoothing.enabled);
        assert_eq!(config.smoothing.kind, SmoothingKind::Hann);
        assert_eq!(config.smoothing.window, 11);
    }

    #[test]
    fn test_peak_filter_overrides() {
        let cli = Cli::parse_from(["spectrum-analyzer", "--min-peak-db", "-70", "--min-peak-width-mhz", "0.2"]);
        let mut config = AppConfig::default();
        cli.apply(&mut config);
        assert!((config.min_peak_db + 70.0).abs() < f32::EPSILON);
        assert!((config.min_peak_width_mhz - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_smooth_flags_conflict() {
        assert!(Cli::try_parse_from(["spectrum-analyzer", "--smooth", "--no-smooth"]).is_err());
    }

    #[test]
    fn test_no_smooth_disables_persisted_smoothing() {
        let cli = Cli::parse_from(["spectrum-analyzer", "--no-smooth"]);
        let mut config = AppConfig::default();
        config.smoothing.enabled = true;
        cli.apply(&mut config);
        assert!(!config.smoothing.enabled);
    }
}
