// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: display power watcher
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::boost::CpuBoost;

pub const DEFAULT_CLASS_ROOT: &str = "/sys/class";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `bl_power` and fb `blank` both report 0 for an unblanked display.
pub fn parse_power_state(raw: &str) -> Option<bool> {
    raw.trim().parse::<u32>().ok().map(|v| v == 0)
}

/// First backlight `bl_power`, else the fb0 `blank` attribute.
pub fn detect_power_path(class_root: &Path) -> Option<PathBuf> {
    let mut backlights: Vec<PathBuf> = fs::read_dir(class_root.join("backlight"))
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path().join("bl_power"))
        .filter(|p| p.is_file())
        .collect();
    backlights.sort();
    if let Some(path) = backlights.into_iter().next() {
        return Some(path);
    }

    let blank = class_root.join("graphics/fb0/blank");
    blank.is_file().then_some(blank)
}

fn read_state(path: &Path) -> Option<bool> {
    match fs::read_to_string(path) {
        Ok(raw) => parse_power_state(&raw),
        Err(e) => {
            debug!("display: {}: {}", path.display(), e);
            None
        }
    }
}

/// Polls a display power attribute and forwards edges to
/// [`CpuBoost::on_blank_changed`].
pub struct DisplayWatcher {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DisplayWatcher {
    pub fn start(boost: Arc<CpuBoost>, path: PathBuf) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        info!("display: watching {}", path.display());

        let handle = thread::Builder::new()
            .name("display-watch".into())
            .spawn(move || watch_loop(&boost, &path, &flag))
            .context("failed to spawn display watcher")?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for DisplayWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            for _ in 0..20 {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
            warn!("display: watcher did not exit within 2s, detaching");
        }
    }
}

fn watch_loop(boost: &CpuBoost, path: &Path, shutdown: &AtomicBool) {
    let mut last = read_state(path);
    // Starting with the screen off still has to gate migration boosts.
    if last == Some(false) {
        boost.on_blank_changed(false);
    }

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(POLL_INTERVAL);
        let Some(unblanked) = read_state(path) else {
            continue;
        };
        if last != Some(unblanked) {
            debug!("display: {}", if unblanked { "unblank" } else { "blank" });
            boost.on_blank_changed(unblanked);
            last = Some(unblanked);
        }
    }
}
