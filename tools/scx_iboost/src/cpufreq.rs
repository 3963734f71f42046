// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: sysfs cpufreq backend and policy updater
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Governor side of the engine on a stock Linux cpufreq stack.
//!
//! The kernel governor keeps choosing frequencies. [`PolicyUpdater`] stands in
//! for the policy notifier: every re-evaluation request runs
//! [`CpuBoost::compute_floor`] and writes the result to `scaling_min_freq`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, trace, warn};

use crate::boost::CpuBoost;
use crate::cpu_list::parse_cpu_list;
use crate::governor::{CpuTopology, Governor, PolicyBounds};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/devices/system/cpu";

/// Upper bound on CPU ids accepted from sysfs lists.
const MAX_CPUS: usize = 8192;

/// How often the updater rescans the online mask.
const SCAN_INTERVAL: Duration = Duration::from_millis(100);

pub struct SysfsCpufreq {
    root: PathBuf,
    nr_possible: usize,
}

fn read_u32(path: &Path) -> Result<u32> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    raw.trim()
        .parse::<u32>()
        .with_context(|| format!("invalid value {:?} in {}", raw.trim(), path.display()))
}

impl SysfsCpufreq {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let possible = Self::read_list(&root.join("possible"))?;
        let nr_possible = possible.last().map_or(0, |last| last + 1);
        Ok(Self { root, nr_possible })
    }

    fn read_list(path: &Path) -> Result<Vec<usize>> {
        let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        parse_cpu_list(&raw, MAX_CPUS).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
    }

    fn cpufreq_dir(&self, cpu: usize) -> PathBuf {
        self.root.join(format!("cpu{}", cpu)).join("cpufreq")
    }

    pub fn policy(&self, cpu: usize) -> Result<PolicyBounds> {
        let dir = self.cpufreq_dir(cpu);
        let cur = read_u32(&dir.join("scaling_cur_freq"))
            .or_else(|_| read_u32(&dir.join("cpuinfo_cur_freq")))?;
        Ok(PolicyBounds {
            min: read_u32(&dir.join("scaling_min_freq"))?,
            max: read_u32(&dir.join("scaling_max_freq"))?,
            hw_min: read_u32(&dir.join("cpuinfo_min_freq"))?,
            cur,
        })
    }

    pub fn write_min_freq(&self, cpu: usize, khz: u32) -> Result<()> {
        let path = self.cpufreq_dir(cpu).join("scaling_min_freq");
        fs::write(&path, format!("{}\n", khz)).with_context(|| format!("failed to write {}", path.display()))
    }
}

impl CpuTopology for SysfsCpufreq {
    fn nr_possible(&self) -> usize {
        self.nr_possible
    }

    fn online_cpus(&self) -> Vec<usize> {
        match Self::read_list(&self.root.join("online")) {
            Ok(cpus) => cpus,
            Err(e) => {
                debug!("{:#}", e);
                // CPU0 cannot be offlined on the platforms this targets.
                vec![0]
            }
        }
    }
}

/// [`Governor`] backed by sysfs. Re-evaluation requests are queued to the
/// [`PolicyUpdater`].
pub struct SysfsGovernor {
    sysfs: Arc<SysfsCpufreq>,
    tx: Sender<usize>,
}

impl SysfsGovernor {
    pub fn new(sysfs: Arc<SysfsCpufreq>) -> (Self, Receiver<usize>) {
        let (tx, rx) = channel::unbounded();
        (Self { sysfs, tx }, rx)
    }
}

impl Governor for SysfsGovernor {
    fn policy(&self, cpu: usize) -> Result<PolicyBounds> {
        self.sysfs.policy(cpu)
    }

    fn request_reevaluation(&self, cpu: usize) {
        // Only fails once the updater is gone, at which point nobody cares.
        let _ = self.tx.send(cpu);
    }
}

/// Thread applying floors to sysfs on request and on CPU hotplug.
pub struct PolicyUpdater {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PolicyUpdater {
    pub fn start(boost: Arc<CpuBoost>, sysfs: Arc<SysfsCpufreq>, rx: Receiver<usize>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("policy-updater".into())
            .spawn(move || update_loop(&boost, &sysfs, &rx, &flag))
            .context("failed to spawn policy updater")?;
        info!("policy updater started");
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for PolicyUpdater {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("policy updater panicked");
            }
        }
    }
}

fn evaluate(boost: &CpuBoost, sysfs: &SysfsCpufreq, cpu: usize) {
    let bounds = match sysfs.policy(cpu) {
        Ok(b) => b,
        Err(e) => {
            debug!("CPU{}: no policy: {:#}", cpu, e);
            return;
        }
    };
    let floor = boost.compute_floor(cpu, &bounds);
    if floor == bounds.min {
        return;
    }
    trace!("CPU{}: min {} -> {}", cpu, bounds.min, floor);
    if let Err(e) = sysfs.write_min_freq(cpu, floor) {
        debug!("CPU{}: {:#}", cpu, e);
    }
}

fn update_loop(boost: &CpuBoost, sysfs: &SysfsCpufreq, rx: &Receiver<usize>, shutdown: &AtomicBool) {
    let mut online: BTreeSet<usize> = sysfs.online_cpus().into_iter().collect();
    for &cpu in &online {
        evaluate(boost, sysfs, cpu);
    }
    let mut last_scan = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        let mut batch = BTreeSet::new();
        match rx.recv_timeout(SCAN_INTERVAL) {
            Ok(cpu) => {
                batch.insert(cpu);
                batch.extend(rx.try_iter());
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_scan.elapsed() >= SCAN_INTERVAL {
            last_scan = Instant::now();
            let now: BTreeSet<usize> = sysfs.online_cpus().into_iter().collect();
            for &cpu in now.difference(&online) {
                debug!("CPU{} came online", cpu);
                boost.on_policy_start(cpu);
                batch.insert(cpu);
            }
            online = now;
        }

        for cpu in batch {
            evaluate(boost, sysfs, cpu);
        }
    }

    // Apply whatever the final stop-and-clear queued.
    let rest: BTreeSet<usize> = rx.try_iter().collect();
    for cpu in rest {
        evaluate(boost, sysfs, cpu);
    }
    info!("policy updater stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_cpu(root: &Path, cpu: usize, min: u32, max: u32, hw_min: u32, cur: u32) {
        let dir = root.join(format!("cpu{}", cpu)).join("cpufreq");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("scaling_min_freq"), format!("{}\n", min)).unwrap();
        fs::write(dir.join("scaling_max_freq"), format!("{}\n", max)).unwrap();
        fs::write(dir.join("cpuinfo_min_freq"), format!("{}\n", hw_min)).unwrap();
        fs::write(dir.join("scaling_cur_freq"), format!("{}\n", cur)).unwrap();
    }

    fn fake_tree(online: &str) -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("possible"), "0-3\n").unwrap();
        fs::write(tmp.path().join("online"), online).unwrap();
        for cpu in 0..4 {
            fake_cpu(tmp.path(), cpu, 300_000, 2_000_000, 300_000, 600_000);
        }
        tmp
    }

    #[test]
    fn reads_topology_and_policy() {
        let tmp = fake_tree("0-1\n");
        let sysfs = SysfsCpufreq::new(tmp.path()).unwrap();
        assert_eq!(sysfs.nr_possible(), 4);
        assert_eq!(sysfs.online_cpus(), vec![0, 1]);
        assert!(sysfs.is_online(1));
        assert!(!sysfs.is_online(2));
        assert_eq!(
            sysfs.policy(2).unwrap(),
            PolicyBounds {
                min: 300_000,
                max: 2_000_000,
                hw_min: 300_000,
                cur: 600_000,
            }
        );
    }

    #[test]
    fn cur_falls_back_to_cpuinfo() {
        let tmp = fake_tree("0\n");
        let dir = tmp.path().join("cpu1/cpufreq");
        fs::remove_file(dir.join("scaling_cur_freq")).unwrap();
        fs::write(dir.join("cpuinfo_cur_freq"), "999\n").unwrap();
        let sysfs = SysfsCpufreq::new(tmp.path()).unwrap();
        assert_eq!(sysfs.policy(1).unwrap().cur, 999);
    }

    #[test]
    fn missing_policy_is_an_error() {
        let tmp = fake_tree("0\n");
        let sysfs = SysfsCpufreq::new(tmp.path()).unwrap();
        assert!(sysfs.policy(7).is_err());
    }

    #[test]
    fn write_min_freq_round_trips() {
        let tmp = fake_tree("0\n");
        let sysfs = SysfsCpufreq::new(tmp.path()).unwrap();
        sysfs.write_min_freq(0, 1_190_400).unwrap();
        assert_eq!(sysfs.policy(0).unwrap().min, 1_190_400);
    }

    #[test]
    fn reevaluation_requests_reach_the_channel() {
        let tmp = fake_tree("0\n");
        let sysfs = Arc::new(SysfsCpufreq::new(tmp.path()).unwrap());
        let (gov, rx) = SysfsGovernor::new(sysfs);
        gov.request_reevaluation(2);
        gov.request_reevaluation(3);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![2, 3]);
    }
}
