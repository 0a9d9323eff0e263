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

//! Acquisition parameters and the registry of external backend tools.
//!
//! Each backend is an external program plus an argument template. The
//! template is a list of strings with `{name}` placeholders that are filled
//! from an [`AcquisitionConfig`] when a session starts.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::protocol::FrameFormat;
use crate::supervisor::StartupError;

/// Parameters for one scan session.
///
/// Created once per session by the caller and never changed while the
/// session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Start of the scanned range in MHz (the tuned centre for IQ backends).
    pub start_freq_mhz: f64,
    /// End of the scanned range in MHz.
    pub end_freq_mhz: f64,
    /// Bin width in kHz.
    pub step_khz: f64,
    /// Receiver gain in dB.
    pub gain: f64,
    /// Integration interval in seconds.
    pub interval_secs: f64,
    /// Device identifier (SoapySDR driver name).
    pub device: String,
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Frequency correction in parts per million.
    pub ppm: i32,
    /// LNA gain in dB (`hackrf_sweep` only).
    pub lna_gain: u32,
    /// Filter bandwidth in Hz, 0 for the tool's default.
    pub bandwidth: f64,
    /// LNB local oscillator offset in MHz, added to every decoded frequency.
    pub lnb_lo_mhz: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            start_freq_mhz: 100.0,
            end_freq_mhz: 200.0,
            step_khz: 100.0,
            gain: 20.0,
            interval_secs: 1.0,
            device: "rtlsdr".to_string(),
            sample_rate: 2_000_000.0,
            ppm: 0,
            lna_gain: 16,
            bandwidth: 0.0,
            lnb_lo_mhz: 0.0,
        }
    }
}

/// Description of one external acquisition tool.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendInfo {
    /// Registry key.
    pub name: String,
    /// Executable to spawn.
    pub program: String,
    /// Argument template with `{placeholder}` fields.
    pub args_template: Vec<String>,
    /// Arguments appended verbatim after the template.
    pub extra_args: Vec<String>,
    /// Wire framing of the tool's output.
    pub format: FrameFormat,
    /// Supported frequency range in MHz.
    pub hint_range_mhz: (f64, f64),
    /// Supported step sizes, for display.
    pub hint_step: String,
    /// Suggested receiver gain.
    pub default_gain: f64,
    /// Suggested LNA gain, for tools that have one.
    pub lna_gain_default: Option<u32>,
    /// Sample rate the tool always runs at, overriding the session's.
    pub fixed_sample_rate: Option<f64>,
    /// Device setup hints.
    pub help: String,
}

impl BackendInfo {
    /// A minimal entry running `program` with no arguments.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>, format: FrameFormat) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args_template: Vec::new(),
            extra_args: Vec::new(),
            format,
            hint_range_mhz: (0.0, 0.0),
            hint_step: String::new(),
            default_gain: 0.0,
            lna_gain_default: None,
            fixed_sample_rate: None,
            help: String::new(),
        }
    }

    /// Replace the argument template.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args_template = args.into_iter().map(Into::into).collect();
        self
    }

    /// Session parameters as the tool will actually run them.
    #[must_use]
    pub fn session_config(&self, config: &AcquisitionConfig) -> AcquisitionConfig {
        let mut effective = config.clone();
        if let Some(rate) = self.fixed_sample_rate {
            effective.sample_rate = rate;
        }
        effective
    }

    /// Fill the template from `config`.
    ///
    /// `fd` is the descriptor number the tool should write records to; it is
    /// required by templates containing `{fd}` and ignored otherwise.
    pub fn render_args(&self, config: &AcquisitionConfig, fd: Option<&str>) -> Result<Vec<String>, StartupError> {
        let mut args = Vec::with_capacity(self.args_template.len() + self.extra_args.len());
        for template in &self.args_template {
            args.push(self.render_one(template, config, fd)?);
        }
        args.extend(self.extra_args.iter().cloned());
        Ok(args)
    }

    fn render_one(&self, template: &str, config: &AcquisitionConfig, fd: Option<&str>) -> Result<String, StartupError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let Some(close) = rest[open..].find('}') else {
                return Err(self.template_error(template, "unterminated placeholder"));
            };
            let name = &rest[open + 1..open + close];
            let value = match name {
                "fd" => fd
                    .map(ToString::to_string)
                    .ok_or_else(|| self.template_error(template, "no output descriptor for {fd}"))?,
                _ => placeholder(config, name)
                    .ok_or_else(|| self.template_error(template, &format!("unknown placeholder {{{name}}}")))?,
            };
            out.push_str(&value);
            rest = &rest[open + close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn template_error(&self, template: &str, reason: &str) -> StartupError {
        StartupError::Template {
            backend: self.name.clone(),
            template: template.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn placeholder(config: &AcquisitionConfig, name: &str) -> Option<String> {
    fn show(value: impl Display) -> Option<String> {
        Some(value.to_string())
    }

    match name {
        "start" => show(config.start_freq_mhz),
        "end" => show(config.end_freq_mhz),
        "step" => show(config.step_khz),
        "gain" => show(config.gain),
        "interval" => show(config.interval_secs),
        "device" => show(&config.device),
        "sample_rate" => show(config.sample_rate),
        "ppm" => show(config.ppm),
        "lna_gain" => show(config.lna_gain),
        "bandwidth" => show(config.bandwidth),
        _ => None,
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

/// Read-only table of known backends, handed to the supervisor at construction.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    backends: Vec<BackendInfo>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl BackendRegistry {
    /// A registry with no entries.
    #[must_use]
    pub fn empty() -> Self {
        Self { backends: Vec::new() }
    }

    /// The four built-in tools.
    #[must_use]
    pub fn builtin() -> Self {
        let rtl_power = BackendInfo {
            hint_range_mhz: (24.0, 1766.0),
            hint_step: "1-2500 kHz".to_string(),
            default_gain: 30.0,
            help: "RTL-SDR: make sure the driver is installed.\n\
                   Run 'rtl_test' to check that the device works.\n\
                   The keenerd fork of rtl-sdr is recommended."
                .to_string(),
            ..BackendInfo::new("rtl_power", "rtl_power", FrameFormat::TextCsv).with_args([
                "-f",
                "{start}M:{end}M:{step}k",
                "-i",
                "{interval}",
                "-g",
                "{gain}",
                "-1",
                "-",
            ])
        };

        let hackrf_sweep = BackendInfo {
            hint_range_mhz: (0.0, 7250.0),
            hint_step: "100-5000 kHz".to_string(),
            default_gain: 20.0,
            lna_gain_default: Some(16),
            help: "Requires a HackRF One or compatible device.\n\
                   Check the firmware with 'hackrf_info'.\n\
                   Sweep mode scans at up to 8 GHz/s."
                .to_string(),
            ..BackendInfo::new("hackrf_sweep", "hackrf_sweep", FrameFormat::LengthPrefixedBinary).with_args([
                "-B",
                "-f",
                "{start}:{end}",
                "-w",
                "{step}000",
                "-g",
                "{gain}",
                "-l",
                "{lna_gain}",
            ])
        };

        let airspy_rx = BackendInfo {
            hint_range_mhz: (24.0, 1800.0),
            hint_step: "fixed 2.5 MHz".to_string(),
            default_gain: 15.0,
            fixed_sample_rate: Some(2_500_000.0),
            help: "Requires an Airspy Mini or Airspy R2.\n\
                   Install the airspy and airspyhf drivers.\n\
                   The capture always uses a fixed 2.5 MHz bandwidth."
                .to_string(),
            ..BackendInfo::new("airspy_rx", "airspy_rx", FrameFormat::RawIq).with_args([
                "-f",
                "{start}e6",
                "-s",
                "2500000",
                "-r",
                "/dev/stdout",
                "-g",
                "{gain}",
            ])
        };

        let soapy_power = BackendInfo {
            extra_args: strings(&["--even", "--fft-window", "boxcar", "--remove-dc"]),
            hint_range_mhz: (0.0, 7250.0),
            hint_step: "1-5000 kHz".to_string(),
            default_gain: 20.0,
            help: "Devices are driven through SoapySDR.\n\
                   Supported: RTL-SDR, HackRF, Airspy, SDRplay, LimeSDR, PlutoSDR, BladeRF.\n\
                   Install drivers with: sudo apt install soapysdr-module-<device>\n\
                   Tune frequency, gain and PPM correction as needed."
                .to_string(),
            ..BackendInfo::new("soapy_power", "soapy_power", FrameFormat::PipeBinary).with_args([
                "-f",
                "{start}M:{end}M",
                "-B",
                "{step}k",
                "-T",
                "{interval}",
                "-d",
                "{device}",
                "-r",
                "{sample_rate}",
                "-p",
                "{ppm}",
                "-F",
                "soapy_power_bin",
                "--output-fd",
                "{fd}",
            ])
        };

        Self {
            backends: vec![rtl_power, hackrf_sweep, airspy_rx, soapy_power],
        }
    }

    /// Add an entry, replacing any existing entry with the same name.
    pub fn register(&mut self, info: BackendInfo) {
        if let Some(existing) = self.backends.iter_mut().find(|b| b.name == info.name) {
            *existing = info;
        } else {
            self.backends.push(info);
        }
    }

    /// Look up a backend by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BackendInfo> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// All entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &BackendInfo> {
        self.backends.iter()
    }

    /// Names of all entries in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name.as_str()).collect()
    }
}
