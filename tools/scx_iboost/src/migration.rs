// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: task migration events from tracefs
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Reads `sched:sched_migrate_task` from `trace_pipe`.
//!
//! Lines look like
//! `  kworker/1:1-57  [001] d..2  412.3: sched_migrate_task: comm=foo pid=812 prio=120 orig_cpu=1 dest_cpu=3`.
//! Kernels carrying a task load field add `load=N`; without it the load is 0.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use crate::boost::{CpuBoost, MigrationEvent};

pub const DEFAULT_TRACEFS_ROOT: &str = "/sys/kernel/tracing";

const EVENT_ENABLE: &str = "events/sched/sched_migrate_task/enable";
const MARKER: &str = "sched_migrate_task:";
const EPOLL_TIMEOUT_MS: u16 = 100;

/// Parse one `trace_pipe` line. Same-CPU and foreign events yield `None`.
pub fn parse_migrate_line(line: &str) -> Option<MigrationEvent> {
    let (_, fields) = line.split_once(MARKER)?;
    // `comm=` may itself contain `key=value` lookalikes, so later fields win.
    let fields: HashMap<&str, &str> = fields
        .split_whitespace()
        .filter_map(|tok| tok.split_once('='))
        .collect();

    let src_cpu = fields.get("orig_cpu")?.parse().ok()?;
    let dest_cpu = fields.get("dest_cpu")?.parse().ok()?;
    if src_cpu == dest_cpu {
        return None;
    }
    let load = match fields.get("load") {
        Some(v) => v.parse().ok()?,
        None => 0,
    };
    Some(MigrationEvent {
        src_cpu,
        dest_cpu,
        load,
        tid: fields.get("pid").and_then(|v| v.parse().ok()),
    })
}

/// Accumulates raw pipe reads and yields complete lines.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    const MAX_PENDING: usize = 64 * 1024;

    fn push(&mut self, data: &[u8], mut on_line: impl FnMut(&str)) {
        self.pending.extend_from_slice(data);
        let Some(last_nl) = self.pending.iter().rposition(|&b| b == b'\n') else {
            if self.pending.len() > Self::MAX_PENDING {
                self.pending.clear();
            }
            return;
        };
        let rest = self.pending.split_off(last_nl + 1);
        for line in String::from_utf8_lossy(&self.pending).lines() {
            on_line(line);
        }
        self.pending = rest;
    }
}

/// Background reader feeding [`CpuBoost::on_migration`]. Enables the
/// tracepoint on start and disables it again on drop.
pub struct TraceMigrationSource {
    root: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TraceMigrationSource {
    pub fn start(boost: Arc<CpuBoost>, root: PathBuf) -> Result<Self> {
        set_event(&root, true)?;

        let pipe_path = root.join("trace_pipe");
        let pipe = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&pipe_path)
            .with_context(|| format!("failed to open {}", pipe_path.display()))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("migration-trace".into())
            .spawn(move || {
                if let Err(e) = read_loop(&boost, pipe, &flag) {
                    warn!("migration: reader stopped: {:#}", e);
                }
            })
            .context("failed to spawn migration reader")?;

        info!("migration: reading {}", pipe_path.display());
        Ok(Self {
            root,
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for TraceMigrationSource {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if let Err(e) = set_event(&self.root, false) {
            warn!("migration: {:#}", e);
        }
    }
}

fn set_event(root: &Path, on: bool) -> Result<()> {
    let path = root.join(EVENT_ENABLE);
    fs::write(&path, if on { "1" } else { "0" })
        .with_context(|| format!("failed to write {}", path.display()))
}

fn read_loop(boost: &CpuBoost, mut pipe: fs::File, shutdown: &AtomicBool) -> Result<()> {
    let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("failed to create epoll")?;
    epoll
        .add(pipe.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 0))
        .context("failed to add trace_pipe to epoll")?;

    let mut events = [EpollEvent::empty(); 1];
    let mut buf = vec![0u8; 16 * 1024];
    let mut lines = LineBuffer::default();

    while !shutdown.load(Ordering::Relaxed) {
        match epoll.wait(&mut events, Some(EPOLL_TIMEOUT_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("epoll_wait failed"),
        }

        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => lines.push(&buf[..n], |line| {
                    if let Some(ev) = parse_migrate_line(line) {
                        boost.on_migration(&ev);
                    }
                }),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read trace_pipe"),
            }
        }
    }
    debug!("migration reader stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stock_format() {
        let line = "  kworker/1:1-57  [001] d..2  412.310: sched_migrate_task: comm=foo pid=812 prio=120 orig_cpu=1 dest_cpu=3";
        assert_eq!(
            parse_migrate_line(line),
            Some(MigrationEvent {
                src_cpu: 1,
                dest_cpu: 3,
                load: 0,
                tid: Some(812),
            })
        );
    }

    #[test]
    fn parses_load_field() {
        let line = "x-1 [000] 1.0: sched_migrate_task: comm=a pid=2 prio=120 load=87 orig_cpu=0 dest_cpu=2";
        assert_eq!(parse_migrate_line(line).unwrap().load, 87);
    }

    #[test]
    fn later_fields_win_over_comm_lookalikes() {
        let line = "x-1 [000] 1.0: sched_migrate_task: comm=evil dest_cpu=9 pid=2 prio=120 orig_cpu=0 dest_cpu=2";
        assert_eq!(parse_migrate_line(line).unwrap().dest_cpu, 2);
    }

    #[test]
    fn rejects_other_and_same_cpu_events() {
        assert_eq!(parse_migrate_line("x-1 [000] 1.0: sched_switch: prev_comm=a"), None);
        assert_eq!(
            parse_migrate_line("x-1 [000] 1.0: sched_migrate_task: comm=a pid=2 orig_cpu=1 dest_cpu=1"),
            None
        );
        assert_eq!(
            parse_migrate_line("x-1 [000] 1.0: sched_migrate_task: comm=a pid=2 orig_cpu=1"),
            None
        );
    }

    #[test]
    fn line_buffer_splits_across_reads() {
        let mut lb = LineBuffer::default();
        let mut got = Vec::new();
        lb.push(b"first li", |l| got.push(l.to_string()));
        assert!(got.is_empty());
        lb.push(b"ne\nsecond\nthi", |l| got.push(l.to_string()));
        assert_eq!(got, vec!["first line", "second"]);
        lb.push(b"rd\n", |l| got.push(l.to_string()));
        assert_eq!(got.last().map(String::as_str), Some("third"));
    }
}
