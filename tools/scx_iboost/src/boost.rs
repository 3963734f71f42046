// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: boost arbitration engine
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The boost engine.
//!
//! Three triggers feed per-CPU state: input activity, task migration and
//! display unblank. The governor asks [`CpuBoost::compute_floor`] for the
//! floor of one CPU whenever it re-evaluates that CPU's policy. Precedence,
//! highest first:
//!
//! 1. display wake boost (floor = policy max)
//! 2. migration boost, when its frequency is above the floor so far
//! 3. input boost
//!
//! Timers expire each boost and then ask the governor to re-evaluate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use log::{debug, error, info, trace, warn};

use crate::config::{BoostParams, Tunables};
use crate::governor::{CpuTopology, Governor, PolicyBounds};
use crate::lock;
use crate::state::{AtomicFbBoost, BoostState, BoostStatus, CycleSnapshot, FbBoost, InputCycle};
use crate::stats::{Metrics, Stats};
use crate::sync_worker;
use crate::timer::{DelayedWork, TimerService};

/// Length of the display wake boost window and of its cooldown.
pub const FB_BOOST_MS: u64 = 900;

/// Extra time CPU0 stays boosted so it never restores ahead of a CPU admitted
/// late in the same cycle.
pub const IB_RESTORE_GRACE_MS: u64 = 10;

/// Number of timer pool threads.
const TIMER_WORKERS: usize = 2;

/// Input boost duration scaled down by the number of online CPUs.
pub fn adjusted_duration_ms(duration_ms: u64, nr_online: usize) -> u64 {
    duration_ms.saturating_mul(3) / (3 + nr_online as u64)
}

/// With a single CPU online a second one is expected to come up shortly, so
/// the cycle targets two CPUs.
pub fn cpus_to_boost(nr_online: usize) -> usize {
    if nr_online == 1 {
        2
    } else {
        1
    }
}

/// One cross-CPU task migration as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationEvent {
    pub src_cpu: usize,
    pub dest_cpu: usize,
    /// Task load in percent. Anything outside 0..=100 is invalid.
    pub load: i32,
    /// Thread that migrated, when known.
    pub tid: Option<i32>,
}

pub struct CpuBoost {
    pub(crate) gov: Arc<dyn Governor>,
    pub(crate) topo: Arc<dyn CpuTopology>,
    tunables: Tunables,
    pub(crate) stats: Stats,
    states: Vec<BoostState>,
    cycle: Mutex<InputCycle>,
    ib_running: AtomicBool,
    fb_boost: AtomicFbBoost,
    suspended: AtomicBool,
    input_boost_work: DelayedWork,
    fb_boost_work: DelayedWork,
    workers: Mutex<Vec<JoinHandle<()>>>,
    // Last so every DelayedWork above is gone before the pool stops.
    _timers: TimerService,
}

impl CpuBoost {
    /// Build the engine and start one migration sync worker per possible CPU.
    pub fn new(
        params: &BoostParams,
        gov: Arc<dyn Governor>,
        topo: Arc<dyn CpuTopology>,
    ) -> Result<Arc<Self>> {
        let nr_cpus = topo.nr_possible();
        if nr_cpus == 0 {
            bail!("no possible CPUs");
        }
        let timers = TimerService::new(crate::BOOST_NAME, TIMER_WORKERS)?;

        let boost = Arc::new_cyclic(|weak: &Weak<CpuBoost>| {
            let states = (0..nr_cpus)
                .map(|cpu| {
                    let w = weak.clone();
                    let restore = DelayedWork::new(&timers, &format!("ib_restore/{cpu}"), move || {
                        if let Some(b) = w.upgrade() {
                            b.input_restore(cpu);
                        }
                    });
                    let w = weak.clone();
                    let removal = DelayedWork::new(&timers, &format!("mig_boost_rem/{cpu}"), move || {
                        if let Some(b) = w.upgrade() {
                            b.migration_removal(cpu);
                        }
                    });
                    BoostState::new(cpu, restore, removal)
                })
                .collect();

            let w = weak.clone();
            let input_boost_work = DelayedWork::new(&timers, "ib_boost", move || {
                if let Some(b) = w.upgrade() {
                    b.input_boost_main();
                }
            });
            let w = weak.clone();
            let fb_boost_work = DelayedWork::new(&timers, "fb_boost", move || {
                if let Some(b) = w.upgrade() {
                    b.fb_boost_main();
                }
            });

            CpuBoost {
                gov,
                topo,
                tunables: Tunables::new(params),
                stats: Stats::default(),
                states,
                cycle: Mutex::new(InputCycle::default()),
                ib_running: AtomicBool::new(false),
                fb_boost: AtomicFbBoost::default(),
                suspended: AtomicBool::new(false),
                input_boost_work,
                fb_boost_work,
                workers: Mutex::new(Vec::new()),
                _timers: timers,
            }
        });

        for cpu in 0..nr_cpus {
            match sync_worker::spawn(&boost, cpu) {
                Ok(handle) => lock(&boost.workers).push(handle),
                Err(e) => {
                    boost.shutdown();
                    return Err(e);
                }
            }
        }

        info!(
            "{} engine ready: {} possible CPUs, {} online",
            crate::BOOST_NAME,
            nr_cpus,
            boost.topo.nr_online()
        );
        Ok(boost)
    }

    pub(crate) fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub(crate) fn state(&self, cpu: usize) -> Option<&BoostState> {
        self.states.get(cpu)
    }

    pub fn nr_cpus(&self) -> usize {
        self.states.len()
    }

    /// Floor for `cpu` given its current policy bounds.
    ///
    /// Never blocks for longer than a short critical section and may be
    /// called concurrently for any set of CPUs.
    pub fn compute_floor(&self, cpu: usize, bounds: &PolicyBounds) -> u32 {
        let t = &self.tunables;
        if !t.enabled() && bounds.min == bounds.hw_min {
            return bounds.min;
        }
        let Some(b) = self.states.get(cpu) else {
            return bounds.hw_min;
        };

        if self.fb_boost.load().is_on() {
            return bounds.max;
        }

        let mut floor = match b.status() {
            BoostStatus::Boost => bounds.max.min(t.ib_freq(cpu)),
            _ => bounds.hw_min,
        };

        if cpu != 0 {
            if let Some(f) = self.try_admit(b, bounds) {
                floor = f;
            }
        }

        let mig = b.migration_freq();
        if mig > floor {
            floor = bounds.max.min(mig);
        }
        floor
    }

    /// Admit a CPU into the running input cycle if it still has room and time.
    fn try_admit(&self, b: &BoostState, bounds: &PolicyBounds) -> Option<u32> {
        let mut cycle = lock(&self.cycle);
        if !self.tunables.enabled() {
            return None;
        }
        let remaining = cycle.remaining_ms(b.cpu)?;

        b.set_status(BoostStatus::Boost);
        cycle.admit(b.cpu);
        b.ib_restore_work.queue(Duration::from_millis(remaining));
        drop(cycle);

        Stats::inc(&self.stats.late_admissions);
        debug!("input boost: admitted CPU{} for {}ms", b.cpu, remaining);
        Some(bounds.max.min(self.tunables.ib_freq(b.cpu)))
    }

    /// Input activity from any matched device.
    pub fn on_input_activity(&self) {
        Stats::inc(&self.stats.input_triggers);
        if !self.tunables.enabled() || self.fb_boost.load().is_on() {
            return;
        }
        if self
            .ib_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.input_boost_work.queue(Duration::ZERO);
    }

    fn input_boost_main(&self) {
        let nr_online = self.topo.nr_online();
        {
            let mut cycle = lock(&self.cycle);
            if !self.tunables.enabled() {
                self.ib_running.store(false, Ordering::Release);
                return;
            }
            cycle.reset();
            cycle.nr_to_boost = cpus_to_boost(nr_online);
            cycle.adj_duration_ms = adjusted_duration_ms(self.tunables.ib_duration_ms(), nr_online);

            let cpu0 = &self.states[0];
            cpu0.set_status(BoostStatus::Boost);
            cycle.admit(0);
            cpu0.ib_restore_work
                .queue(Duration::from_millis(cycle.adj_duration_ms.saturating_add(IB_RESTORE_GRACE_MS)));
            cycle.start = Some(Instant::now());
            debug!(
                "input boost: {} online, targeting {} CPU(s) for {}ms",
                nr_online, cycle.nr_to_boost, cycle.adj_duration_ms
            );
        }
        Stats::inc(&self.stats.input_cycles);
        self.gov.request_reevaluation(0);
    }

    fn input_restore(&self, cpu: usize) {
        let b = &self.states[cpu];
        b.set_status(BoostStatus::Unboost);
        Stats::inc(&self.stats.input_restores);
        if self.topo.is_online(cpu) {
            self.gov.request_reevaluation(cpu);
        }

        if self.states.iter().all(|s| s.status() != BoostStatus::Boost) {
            self.ib_running.store(false, Ordering::Release);
            trace!("input boost: cycle finished");
        }
    }

    /// Display power edge. `unblanked` is true when the screen turned on.
    pub fn on_blank_changed(&self, unblanked: bool) {
        if !self.tunables.enabled() {
            return;
        }
        if !unblanked {
            self.suspended.store(true, Ordering::Release);
            return;
        }
        self.suspended.store(false, Ordering::Release);

        if self.fb_boost.transition(FbBoost::Off, FbBoost::Active) {
            Stats::inc(&self.stats.fb_boosts);
            debug!("display unblank: boosting all online CPUs");
            self.fb_boost_work.queue(Duration::ZERO);
        }
    }

    fn fb_boost_main(&self) {
        if self.tunables.enabled() && self.fb_boost.transition(FbBoost::Active, FbBoost::Cooldown) {
            self.reevaluate_online();
            self.fb_boost_work.queue(Duration::from_millis(FB_BOOST_MS));
        } else {
            self.fb_boost.store(FbBoost::Off);
            self.reevaluate_online();
        }
    }

    /// Task migration reported by the scheduler side.
    pub fn on_migration(&self, ev: &MigrationEvent) {
        let t = &self.tunables;
        if !t.enabled() || t.migration_boost_ms() == 0 {
            return;
        }
        if self.is_suspended() || self.fb_boost.load().is_on() {
            return;
        }

        let valid_load = (0..=100).contains(&ev.load);
        if t.load_based_syncs() {
            if !valid_load {
                error!("Invalid load: {}", ev.load);
                return;
            }
            if ev.load as u32 <= t.migration_load_threshold() {
                return;
            }
        }

        let Some(b) = self.states.get(ev.dest_cpu) else {
            return;
        };
        if ev.src_cpu >= self.states.len() {
            return;
        }
        let worker = b.worker_tid();
        if worker != 0 && ev.tid == Some(worker) {
            return;
        }

        debug!("Migration: CPU{} --> CPU{}", ev.src_cpu, ev.dest_cpu);
        let task_load = if valid_load { ev.load as u32 } else { 0 };
        Stats::inc(&self.stats.migration_requests);
        if !b.post_migration(ev.src_cpu, task_load) {
            Stats::inc(&self.stats.coalesced_wakes);
        }
    }

    fn migration_removal(&self, cpu: usize) {
        self.states[cpu].set_migration_freq(0);
        self.gov.request_reevaluation(cpu);
    }

    /// A CPU's policy (re)started, typically because it came online.
    pub fn on_policy_start(&self, cpu: usize) {
        if let Some(b) = self.states.get(cpu) {
            b.request_repin();
        }
    }

    pub fn set_enabled(&self, on: bool) {
        self.tunables.enabled.store(on, Ordering::Release);
        if !on {
            self.stop_and_clear();
        }
    }

    /// Cancel every timer and return all CPUs to their unboosted baseline.
    /// Idempotent. `suspended` is left as is since it tracks the display.
    pub fn stop_and_clear(&self) {
        self.input_boost_work.cancel_sync();
        lock(&self.cycle).reset();
        self.fb_boost.store(FbBoost::Off);
        self.fb_boost_work.cancel_sync();
        // A boost callback that entered cooldown before the store re-arms itself.
        self.fb_boost_work.cancel_sync();
        self.fb_boost.store(FbBoost::Off);

        for b in &self.states {
            b.clear_migration();
            b.mig_boost_rem.cancel_sync();
            b.ib_restore_work.cancel_sync();
        }
        // A restore or removal callback that was running may have raced the
        // cancel above, so clear once more after all of them have finished.
        for b in &self.states {
            b.set_migration_freq(0);
            b.set_status(BoostStatus::Unboost);
        }
        self.reevaluate_online();

        self.ib_running.store(false, Ordering::Release);
        Stats::inc(&self.stats.stop_and_clear);
        debug!("all boosts stopped");
    }

    fn reevaluate_online(&self) {
        for cpu in self.topo.online_cpus() {
            self.gov.request_reevaluation(cpu);
        }
    }

    /// Stop every boost and join the sync workers. The engine stays usable
    /// as a floor oracle but no longer applies migration boosts.
    pub fn shutdown(&self) {
        self.set_enabled(false);
        for b in &self.states {
            b.request_stop();
        }
        let handles: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("sync worker panicked");
            }
        }
    }

    pub fn status(&self, cpu: usize) -> Option<BoostStatus> {
        self.states.get(cpu).map(|b| b.status())
    }

    pub fn migration_freq(&self, cpu: usize) -> Option<u32> {
        self.states.get(cpu).map(|b| b.migration_freq())
    }

    pub fn restore_pending(&self, cpu: usize) -> bool {
        self.states.get(cpu).is_some_and(|b| b.restore_pending())
    }

    pub fn removal_pending(&self, cpu: usize) -> bool {
        self.states.get(cpu).is_some_and(|b| b.removal_pending())
    }

    pub fn fb_boost(&self) -> FbBoost {
        self.fb_boost.load()
    }

    pub fn fb_boost_pending(&self) -> bool {
        self.fb_boost_work.is_pending()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn input_boost_running(&self) -> bool {
        self.ib_running.load(Ordering::Acquire)
    }

    pub fn cycle(&self) -> CycleSnapshot {
        let c = lock(&self.cycle);
        CycleSnapshot {
            running: self.input_boost_running(),
            nr_boosted: c.nr_boosted,
            nr_to_boost: c.nr_to_boost,
            adj_duration_ms: c.adj_duration_ms,
        }
    }

    pub fn metrics(&self) -> Metrics {
        let s = &self.stats;
        let get = |c: &std::sync::atomic::AtomicU64| c.load(Ordering::Relaxed);
        Metrics {
            enabled: self.tunables.enabled().into(),
            fb_boost: self.fb_boost.load().is_on().into(),
            suspended: self.is_suspended().into(),
            boosted_cpus: self
                .states
                .iter()
                .filter(|b| b.status() == BoostStatus::Boost)
                .count() as u64,
            migration_floors: self.states.iter().filter(|b| b.migration_freq() != 0).count() as u64,
            input_triggers: get(&s.input_triggers),
            input_cycles: get(&s.input_cycles),
            late_admissions: get(&s.late_admissions),
            input_restores: get(&s.input_restores),
            fb_boosts: get(&s.fb_boosts),
            migration_requests: get(&s.migration_requests),
            coalesced_wakes: get(&s.coalesced_wakes),
            migration_boosts: get(&s.migration_boosts),
            sync_below_floor: get(&s.sync_below_floor),
            sync_offline: get(&s.sync_offline),
            sync_lookup_failures: get(&s.sync_lookup_failures),
            stop_and_clear: get(&s.stop_and_clear),
        }
    }
}
