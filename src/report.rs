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

//! Text output: peak reports and the backend listing.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use spectrum_core::{BackendRegistry, PeakRecord};

/// Minimum amplitude and width a peak needs to be reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakFilter {
    pub min_amplitude_db: f32,
    pub min_bandwidth_mhz: f64,
}

impl PeakFilter {
    /// Whether `peak` is strong and wide enough to report. Both bounds are inclusive.
    #[must_use]
    pub fn admits(&self, peak: &PeakRecord) -> bool {
        peak.amplitude_db >= self.min_amplitude_db && peak.bandwidth_mhz >= self.min_bandwidth_mhz
    }
}

/// One peak as a JSON line.
#[derive(Debug, Serialize)]
struct PeakLine<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    peak: &'a PeakRecord,
}

/// Report the classified peaks `filter` admits, either as a log table or
/// as JSON lines on stdout.
pub fn report_peaks(peaks: &[PeakRecord], filter: &PeakFilter, json: bool) {
    let peaks: Vec<PeakRecord> = peaks.iter().filter(|p| filter.admits(p)).cloned().collect();
    let peaks = peaks.as_slice();

    if json {
        let timestamp = Utc::now();
        for peak in peaks {
            match serde_json::to_string(&PeakLine { timestamp, peak }) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Failed to encode peak: {}", e),
            }
        }
        return;
    }

    if peaks.is_empty() {
        info!("No peaks detected");
        return;
    }

    info!("{} peak(s) detected", peaks.len());
    for line in peak_table(peaks) {
        info!("{}", line);
    }
}

fn peak_table(peaks: &[PeakRecord]) -> Vec<String> {
    let mut lines = vec![format!(
        "{:>12} {:>9} {:>12} {:>12} {:>10}  {:<8} {}",
        "Freq (MHz)", "Amp (dB)", "Left (MHz)", "Right (MHz)", "BW (MHz)", "Mod", "Type"
    )];
    lines.extend(peaks.iter().map(|p| {
        format!(
            "{:>12.4} {:>9.1} {:>12.4} {:>12.4} {:>10.4}  {:<8} {}",
            p.frequency_mhz, p.amplitude_db, p.left_mhz, p.right_mhz, p.bandwidth_mhz, p.modulation, p.signal_type
        )
    }));
    lines
}

/// Print the backend table to stdout.
pub fn print_backends(registry: &BackendRegistry) {
    for backend in registry.iter() {
        let (low, high) = backend.hint_range_mhz;
        println!("{} ({})", backend.name, backend.format.name());
        println!("  command: {} {}", backend.program, backend.args_template.join(" "));
        println!("  range:   {low}-{high} MHz");
        if !backend.hint_step.is_empty() {
            println!("  step:    {}", backend.hint_step);
        }
        println!("  gain:    {} dB", backend.default_gain);
        if let Some(rate) = backend.fixed_sample_rate {
            println!("  rate:    fixed {rate} S/s");
        }
        for line in backend.help.lines() {
            println!("  {line}");
        }
        println!();
    }
}
