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

//! Application configuration management.
//!
//! This module handles persistent configuration storage using TOML format:
//! the selected backend, the last acquisition settings, smoothing and
//! baseline preferences.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use spectrum_core::{AcquisitionConfig, SmoothingConfig};

const APP_NAME: &str = "spectrum-analyzer";
const CONFIG_NAME: &str = "config";

/// Default backend when none has been configured
pub const DEFAULT_BACKEND: &str = "rtl_power";

/// Application configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    /// Configuration schema version for migrations
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// Backend tool to launch
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Number of sweeps kept for the waterfall
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Baseline CSV file subtracted from every sweep when set
    #[serde(default)]
    pub baseline_file: Option<PathBuf>,

    /// Seconds between peak reports (0 disables them)
    #[serde(default = "default_peak_report_interval")]
    pub peak_report_interval_secs: u64,

    /// Peaks weaker than this are left out of reports (dB)
    #[serde(default = "default_min_peak_db")]
    pub min_peak_db: f32,

    /// Peaks narrower than this are left out of reports (MHz)
    #[serde(default = "default_min_peak_width_mhz")]
    pub min_peak_width_mhz: f64,

    /// Acquisition settings passed to the backend
    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    /// Primary curve smoothing
    #[serde(default)]
    pub smoothing: SmoothingConfig,
}

// Default value functions for serde
fn default_config_version() -> u32 {
    1
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_string()
}

fn default_history_size() -> usize {
    100
}

fn default_peak_report_interval() -> u64 {
    5
}

fn default_min_peak_db() -> f32 {
    -50.0
}

fn default_min_peak_width_mhz() -> f64 {
    0.01
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            backend: default_backend(),
            history_size: default_history_size(),
            baseline_file: None,
            peak_report_interval_secs: default_peak_report_interval(),
            min_peak_db: default_min_peak_db(),
            min_peak_width_mhz: default_min_peak_width_mhz(),
            acquisition: AcquisitionConfig::default(),
            smoothing: SmoothingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from disk, creating it with defaults on first run
    pub fn load() -> Result<Self, confy::ConfyError> {
        confy::load(APP_NAME, CONFIG_NAME)
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<(), confy::ConfyError> {
        confy::store(APP_NAME, CONFIG_NAME, self)
    }

    /// Get the config file path for display to user
    pub fn get_config_path() -> Result<PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"backend": "hackrf_sweep", "acquisition": {"start_freq_mhz": 400.0}}"#).unwrap();
        assert_eq!(config.backend, "hackrf_sweep");
        assert!((config.acquisition.start_freq_mhz - 400.0).abs() < f64::EPSILON);
        assert!((config.acquisition.end_freq_mhz - 200.0).abs() < f64::EPSILON);
        assert_eq!(config.config_version, 1);
        assert_eq!(config.history_size, 100);
        assert_eq!(config.peak_report_interval_secs, 5);
        assert!((config.min_peak_db + 50.0).abs() < f32::EPSILON);
        assert!((config.min_peak_width_mhz - 0.01).abs() < f64::EPSILON);
        assert!(!config.smoothing.enabled);
        assert_eq!(config.smoothing.window, 11);
        assert!(config.baseline_file.is_none());
    }

    #[test]
    fn test_roundtrip() {
        let mut config = AppConfig::default();
        config.smoothing.enabled = true;
        config.baseline_file = Some(PathBuf::from("/tmp/baseline.csv"));

        let json = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert!(back.smoothing.enabled);
        assert_eq!(back.baseline_file, config.baseline_file);
        assert_eq!(back.backend, DEFAULT_BACKEND);
    }
}
