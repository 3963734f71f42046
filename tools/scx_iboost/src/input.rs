// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: evdev input monitor
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Watches touch input devices and reports activity to the engine.
//!
//! Matched by capability:
//! * multi-touch touchscreens: `EV_ABS` with `ABS_MT_POSITION_X` and `ABS_MT_POSITION_Y`
//! * touchpads: `BTN_TOUCH` with `ABS_X` and `ABS_Y`
//!
//! With `include_all`, keyboards and relative pointers are matched as well.

use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use evdev::{AbsoluteAxisType, Device, EventType, Key, RelativeAxisType};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use crate::boost::CpuBoost;

pub const DEFAULT_INPUT_DIR: &str = "/dev/input";

const EPOLL_TIMEOUT_MS: u16 = 100;
const RESCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Capabilities relevant for matching a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub has_abs: bool,
    pub has_mt_position: bool,
    pub has_btn_touch: bool,
    pub has_abs_xy: bool,
    pub keyboard: bool,
    pub pointer: bool,
}

impl DeviceCaps {
    pub fn of(dev: &Device) -> Self {
        let abs = dev.supported_absolute_axes();
        let has_abs_axis = |axis| abs.is_some_and(|a| a.contains(axis));
        let keys = dev.supported_keys();
        let rel = dev.supported_relative_axes();

        Self {
            has_abs: dev.supported_events().contains(EventType::ABSOLUTE),
            has_mt_position: has_abs_axis(AbsoluteAxisType::ABS_MT_POSITION_X)
                && has_abs_axis(AbsoluteAxisType::ABS_MT_POSITION_Y),
            has_btn_touch: keys.is_some_and(|k| k.contains(Key::BTN_TOUCH)),
            has_abs_xy: has_abs_axis(AbsoluteAxisType::ABS_X) && has_abs_axis(AbsoluteAxisType::ABS_Y),
            keyboard: keys.is_some_and(|k| k.contains(Key::KEY_A) && k.contains(Key::KEY_SPACE)),
            pointer: rel.is_some_and(|r| {
                r.contains(RelativeAxisType::REL_X) && r.contains(RelativeAxisType::REL_Y)
            }),
        }
    }

    pub fn is_touchscreen(&self) -> bool {
        self.has_abs && self.has_mt_position
    }

    pub fn is_touchpad(&self) -> bool {
        self.has_btn_touch && self.has_abs_xy
    }

    pub fn matches(&self, include_all: bool) -> bool {
        self.is_touchscreen() || self.is_touchpad() || (include_all && (self.keyboard || self.pointer))
    }
}

struct Devices {
    epoll: Epoll,
    by_fd: HashMap<RawFd, (PathBuf, Device)>,
    seen: HashSet<PathBuf>,
    include_all: bool,
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            let _ = libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

impl Devices {
    fn new(include_all: bool) -> Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("failed to create epoll")?,
            by_fd: HashMap::new(),
            seen: HashSet::new(),
            include_all,
        })
    }

    /// Open every not yet seen `event*` node under `dir` and keep the matching ones.
    fn scan(&mut self, dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_event = path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| name.starts_with("event"));
            if !is_event || !self.seen.insert(path.clone()) {
                continue;
            }
            let dev = match Device::open(&path) {
                Ok(dev) => dev,
                Err(e) => {
                    debug!("{}: {}", path.display(), e);
                    continue;
                }
            };
            if !DeviceCaps::of(&dev).matches(self.include_all) {
                continue;
            }
            if let Err(e) = self.add(path.clone(), dev) {
                warn!("{}: {:#}", path.display(), e);
            }
        }
    }

    fn add(&mut self, path: PathBuf, dev: Device) -> Result<()> {
        let fd = dev.as_raw_fd();
        set_nonblocking(fd);
        // SAFETY: fd belongs to `dev`, which stays in `by_fd` until the fd is
        // removed from the epoll set.
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
            .context("failed to add device to epoll")?;
        info!(
            "input: watching {} ({})",
            dev.name().unwrap_or("unknown"),
            path.display()
        );
        self.by_fd.insert(fd, (path, dev));
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) {
        if let Some((path, dev)) = self.by_fd.remove(&fd) {
            // SAFETY: `dev` still owns fd here.
            let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
            let _ = self.epoll.delete(bfd);
            info!("input: {} disconnected", path.display());
            self.seen.remove(&path);
            drop(dev);
        }
    }

    /// Drain pending events of one device. Returns whether any arrived.
    fn drain(&mut self, fd: RawFd) -> bool {
        let Some((_, dev)) = self.by_fd.get_mut(&fd) else {
            return false;
        };
        let fetched = match dev.fetch_events() {
            Ok(events) => Ok(events.count() > 0),
            Err(e) => Err(e),
        };
        match fetched {
            Ok(any) => any,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(e) => {
                debug!("input: read failed: {}", e);
                self.remove(fd);
                false
            }
        }
    }
}

/// Background thread turning input events into [`CpuBoost::on_input_activity`].
pub struct InputMonitor {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InputMonitor {
    pub fn start(boost: Arc<CpuBoost>, dir: PathBuf, include_all: bool) -> Result<Self> {
        let mut devices = Devices::new(include_all)?;
        devices.scan(&dir);
        if devices.by_fd.is_empty() {
            warn!("input: no matching devices under {} yet", dir.display());
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("input-monitor".into())
            .spawn(move || input_loop(&boost, &mut devices, &dir, &flag))
            .context("failed to spawn input monitor")?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for InputMonitor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn input_loop(boost: &CpuBoost, devices: &mut Devices, dir: &Path, shutdown: &AtomicBool) {
    let mut events = [EpollEvent::empty(); 16];
    let mut last_scan = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        if last_scan.elapsed() >= RESCAN_INTERVAL {
            last_scan = Instant::now();
            devices.scan(dir);
        }

        let n = match devices.epoll.wait(&mut events, Some(EPOLL_TIMEOUT_MS)) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("input: epoll_wait failed: {}", e);
                break;
            }
        };

        let mut activity = false;
        for ev in &events[..n] {
            let fd = ev.data() as RawFd;
            let flags = ev.events();
            if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                devices.remove(fd);
                continue;
            }
            activity |= devices.drain(fd);
        }
        if activity {
            boost.on_input_activity();
        }
    }
    debug!("input monitor stopped");
}
