// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: userspace CPU input boost daemon
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::ArgAction;
use clap::Parser;
use log::info;
use log::warn;
use scx_stats::prelude::*;

use scx_iboost::control_api::ControlApi;
use scx_iboost::cpufreq::PolicyUpdater;
use scx_iboost::cpufreq::SysfsCpufreq;
use scx_iboost::cpufreq::SysfsGovernor;
use scx_iboost::cpufreq::DEFAULT_SYSFS_ROOT;
use scx_iboost::display::detect_power_path;
use scx_iboost::display::DisplayWatcher;
use scx_iboost::display::DEFAULT_CLASS_ROOT;
use scx_iboost::input::InputMonitor;
use scx_iboost::input::DEFAULT_INPUT_DIR;
use scx_iboost::migration::TraceMigrationSource;
use scx_iboost::migration::DEFAULT_TRACEFS_ROOT;
use scx_iboost::stats;
use scx_iboost::BoostParams;
use scx_iboost::CpuBoost;

/// Raise per-CPU cpufreq floors on touch input, task migration and display
/// wake. The kernel governor keeps choosing the frequency; scx_iboost only
/// moves scaling_min_freq.
#[derive(Debug, Parser)]
#[command(name = "scx_iboost", version, disable_version_flag = true)]
struct Opts {
    /// Start with boosting enabled. Can be toggled at runtime through the
    /// control API.
    #[clap(long, default_value_t = true, action = ArgAction::Set)]
    enabled: bool,

    /// Input boost floor in kHz for CPU0 and for every other CPU.
    #[clap(long, num_args = 2, value_names = ["CPU0_KHZ", "OTHER_KHZ"], default_values_t = [1_190_400u32, 1_190_400])]
    ib_freqs: Vec<u32>,

    /// Input boost duration in milliseconds before scaling by online CPUs.
    #[clap(long, default_value = "40")]
    ib_duration_ms: u32,

    /// Migration boost duration in milliseconds. 0 disables migration boosts.
    #[clap(long, default_value = "0")]
    migration_boost_ms: u32,

    /// Task load in percent a migrating task must exceed with
    /// --load-based-syncs.
    #[clap(long, default_value = "15")]
    migration_load_threshold: u32,

    /// Gate migration boosts on task load.
    #[clap(long, action = ArgAction::SetTrue)]
    load_based_syncs: bool,

    /// cpufreq sysfs root.
    #[clap(long, default_value = DEFAULT_SYSFS_ROOT)]
    sysfs_root: PathBuf,

    /// Display power attribute to watch. Defaults to the first backlight
    /// bl_power, then fb0 blank.
    #[clap(long)]
    display_path: Option<PathBuf>,

    /// tracefs mount point.
    #[clap(long, default_value = DEFAULT_TRACEFS_ROOT)]
    tracefs_root: PathBuf,

    /// Directory holding evdev nodes.
    #[clap(long, default_value = DEFAULT_INPUT_DIR)]
    input_dir: PathBuf,

    /// Do not watch input devices.
    #[clap(long, action = ArgAction::SetTrue)]
    no_input: bool,

    /// Do not watch the display.
    #[clap(long, action = ArgAction::SetTrue)]
    no_display: bool,

    /// Do not read task migrations from tracefs.
    #[clap(long, action = ArgAction::SetTrue)]
    no_migration: bool,

    /// Also treat keyboards and mice as boost sources.
    #[clap(long, action = ArgAction::SetTrue)]
    input_all: bool,

    /// Serve the control API on 127.0.0.1:PORT.
    #[clap(long)]
    control_port: Option<u16>,

    /// Print statistics every N seconds.
    #[clap(long)]
    stats: Option<f64>,

    /// Print statistics of an already running instance every N seconds.
    /// Boosting is not started.
    #[clap(long)]
    monitor: Option<f64>,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,

    /// Print version and exit.
    #[clap(short = 'V', long, action = ArgAction::SetTrue)]
    version: bool,
}

impl Opts {
    fn params(&self) -> BoostParams {
        BoostParams {
            enabled: self.enabled,
            ib_freqs: [self.ib_freqs[0], self.ib_freqs[1]],
            ib_duration_ms: self.ib_duration_ms,
            migration_boost_ms: self.migration_boost_ms,
            migration_load_threshold: self.migration_load_threshold,
            load_based_syncs: self.load_based_syncs,
        }
    }
}

/// Start an optional component, logging instead of failing.
fn optional<T>(what: &str, start: impl FnOnce() -> Result<T>) -> Option<T> {
    match start() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("{} disabled: {:#}", what, e);
            None
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("{} {}", scx_iboost::BOOST_NAME, env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    let _ = lcfg.set_time_offset_to_local();
    simplelog::TermLogger::init(
        llv,
        lcfg.set_time_level(simplelog::LevelFilter::Error)
            .set_location_level(simplelog::LevelFilter::Off)
            .set_target_level(simplelog::LevelFilter::Off)
            .set_thread_level(simplelog::LevelFilter::Off)
            .build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if let Some(intv) = opts.monitor {
        return stats::monitor(Duration::from_secs_f64(intv), shutdown);
    }

    let params = opts.params();
    params.validate()?;
    info!("{} {} starting: {:?}", scx_iboost::BOOST_NAME, env!("CARGO_PKG_VERSION"), params);

    let sysfs = Arc::new(SysfsCpufreq::new(&opts.sysfs_root)?);
    let (governor, reeval_rx) = SysfsGovernor::new(sysfs.clone());
    let boost = CpuBoost::new(&params, Arc::new(governor), sysfs.clone())?;
    let updater = PolicyUpdater::start(boost.clone(), sysfs, reeval_rx)?;

    let input = if opts.no_input {
        None
    } else {
        optional("input boost", || {
            InputMonitor::start(boost.clone(), opts.input_dir.clone(), opts.input_all)
        })
    };

    let display_path = opts
        .display_path
        .clone()
        .or_else(|| detect_power_path(Path::new(DEFAULT_CLASS_ROOT)));
    let display = match display_path {
        Some(path) if !opts.no_display => {
            optional("display boost", || DisplayWatcher::start(boost.clone(), path))
        }
        None if !opts.no_display => {
            warn!("display boost disabled: no display power attribute found");
            None
        }
        _ => None,
    };

    let migration = if opts.no_migration {
        None
    } else {
        optional("migration boost", || {
            TraceMigrationSource::start(boost.clone(), opts.tracefs_root.clone())
        })
    };

    let control = match opts.control_port {
        Some(port) => optional("control API", || ControlApi::start(port, boost.clone())),
        None => None,
    };

    let stats_server = optional("stats server", || {
        StatsServer::new(stats::server_data()).launch()
    });
    let stats_channels = stats_server.as_ref().map(|s| s.channels());

    let stats_thread = opts.stats.map(|intv| {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            if let Err(e) = stats::monitor(Duration::from_secs_f64(intv), shutdown) {
                warn!("stats monitor thread finished because of an error {}", e);
            }
        })
    });

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
        if let Some((res_tx, req_rx)) = &stats_channels {
            while req_rx.try_recv().is_ok() {
                res_tx.send(boost.metrics())?;
            }
        }
    }
    info!("shutting down");

    drop(control);
    drop(migration);
    drop(display);
    drop(input);
    // Queues the final re-evaluations, which the updater applies before it exits.
    boost.shutdown();
    drop(updater);

    if let Some(handle) = stats_thread {
        let _ = handle.join();
    }
    drop(stats_server);
    Ok(())
}
