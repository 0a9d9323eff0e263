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

mod cli;
mod config;
mod report;

use std::error::Error;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info, warn};
use spectrum_core::store::{write_curve_csv, StoreConfig};
use spectrum_core::{Analyzer, AnalyzerConfig, BackendRegistry, SpectrumEvent, SupervisorConfig};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::cli::Cli;
use crate::config::AppConfig;
use crate::report::PeakFilter;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    let registry = BackendRegistry::builtin();

    if args.list_backends {
        report::print_backends(&registry);
        return ExitCode::SUCCESS;
    }

    let mut app_config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load configuration, using defaults: {}", e);
            AppConfig::default()
        }
    };
    args.apply(&mut app_config);

    if args.save_config {
        match app_config.save() {
            Ok(()) => {
                if let Ok(path) = AppConfig::get_config_path() {
                    info!("Configuration saved to {}", path.display());
                }
            }
            Err(e) => warn!("Failed to save configuration: {}", e),
        }
    }

    match run(registry, &app_config, &args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(registry: BackendRegistry, app_config: &AppConfig, args: &Cli) -> Result<(), Box<dyn Error>> {
    let mut analyzer = Analyzer::spawn(AnalyzerConfig {
        registry,
        supervisor: SupervisorConfig::default(),
        store: StoreConfig {
            history_capacity: app_config.history_size,
        },
        smoothing: app_config.smoothing,
    });

    if let Some(path) = &app_config.baseline_file {
        if let Some(warning) = analyzer.set_baseline(true, Some(path.as_path()))? {
            warn!("{}", warning);
        }
    }

    let mut events = analyzer.subscribe();
    analyzer.start(&app_config.backend, &app_config.acquisition).await?;

    let report_period = Duration::from_secs(app_config.peak_report_interval_secs.max(1));
    let mut report_tick = interval_at(Instant::now() + report_period, report_period);
    report_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let reporting = app_config.peak_report_interval_secs > 0;
    let peak_filter = PeakFilter {
        min_amplitude_db: app_config.min_peak_db,
        min_bandwidth_mhz: app_config.min_peak_width_mhz,
    };

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut sweeps: u64 = 0;
    let mut failure = None;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping acquisition");
                break;
            }
            () = &mut deadline => {
                info!("Scan duration elapsed, stopping acquisition");
                break;
            }
            _ = report_tick.tick(), if reporting => {
                report::report_peaks(&analyzer.classify_peaks(), &peak_filter, args.json);
            }
            event = events.recv() => match event {
                Some(SpectrumEvent::Primary(curve)) => {
                    sweeps += 1;
                    debug!("Sweep {} with {} bins", sweeps, curve.len());
                }
                Some(SpectrumEvent::Log(message)) => info!("{}", message),
                Some(SpectrumEvent::Finished { stopped_by_user }) => {
                    if !stopped_by_user {
                        info!("Scan finished");
                    }
                    break;
                }
                Some(SpectrumEvent::Failed(reason)) => {
                    failure = Some(reason);
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    analyzer.stop().await;
    info!("Received {} sweeps", sweeps);
    report::report_peaks(&analyzer.classify_peaks(), &peak_filter, args.json);

    if let Some(path) = &args.save_average {
        analyzer.flush().await;
        match analyzer.average() {
            Some(curve) => {
                write_curve_csv(path, &curve)?;
                info!("Average curve written to {}", path.display());
            }
            None => warn!("No sweeps received, average curve not written"),
        }
    }

    analyzer.shutdown().await;

    match failure {
        Some(reason) => Err(format!("Acquisition failed: {reason}").into()),
        None => Ok(()),
    }
}
