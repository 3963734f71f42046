// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: per-CPU and per-cycle boost state
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::lock;
use crate::timer::DelayedWork;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BoostStatus {
    Unboost = 0,
    /// Only used by the framebuffer tri-state, never by a CPU.
    Waiting = 1,
    Boost = 2,
}

impl BoostStatus {
    fn from_raw(v: u8) -> Self {
        match v {
            1 => BoostStatus::Waiting,
            2 => BoostStatus::Boost,
            _ => BoostStatus::Unboost,
        }
    }
}

/// Display wake boost state. While not `Off`, every CPU is floored at its
/// policy maximum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FbBoost {
    Off = 0,
    Active = 1,
    Cooldown = 2,
}

impl FbBoost {
    fn from_raw(v: u8) -> Self {
        match v {
            1 => FbBoost::Active,
            2 => FbBoost::Cooldown,
            _ => FbBoost::Off,
        }
    }

    pub fn is_on(self) -> bool {
        self != FbBoost::Off
    }
}

#[derive(Debug, Default)]
pub(crate) struct AtomicFbBoost(AtomicU8);

impl AtomicFbBoost {
    pub(crate) fn load(&self) -> FbBoost {
        FbBoost::from_raw(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, v: FbBoost) {
        self.0.store(v as u8, Ordering::Release);
    }

    /// Returns true if the state moved from `current` to `new`.
    pub(crate) fn transition(&self, current: FbBoost, new: FbBoost) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Single-slot migration mailbox plus the worker's control flags. Newer
/// requests overwrite unconsumed ones.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    pub pending: bool,
    pub src_cpu: usize,
    pub task_load: u32,
    pub stop: bool,
    pub repin: bool,
}

/// Boost bookkeeping for one possible CPU.
pub struct BoostState {
    pub cpu: usize,
    status: AtomicU8,
    /// kHz; non-zero only while `mig_boost_rem` is armed.
    migration_freq: AtomicU32,
    pub(crate) mailbox: Mutex<Mailbox>,
    pub(crate) sync_wq: Condvar,
    being_woken: AtomicBool,
    worker_tid: AtomicI32,
    pub(crate) ib_restore_work: DelayedWork,
    pub(crate) mig_boost_rem: DelayedWork,
}

impl BoostState {
    pub(crate) fn new(cpu: usize, ib_restore_work: DelayedWork, mig_boost_rem: DelayedWork) -> Self {
        Self {
            cpu,
            status: AtomicU8::new(BoostStatus::Unboost as u8),
            migration_freq: AtomicU32::new(0),
            mailbox: Mutex::new(Mailbox::default()),
            sync_wq: Condvar::new(),
            being_woken: AtomicBool::new(false),
            worker_tid: AtomicI32::new(0),
            ib_restore_work,
            mig_boost_rem,
        }
    }

    pub fn status(&self) -> BoostStatus {
        BoostStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: BoostStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn migration_freq(&self) -> u32 {
        self.migration_freq.load(Ordering::Acquire)
    }

    pub(crate) fn set_migration_freq(&self, khz: u32) {
        self.migration_freq.store(khz, Ordering::Release);
    }

    pub(crate) fn worker_tid(&self) -> i32 {
        self.worker_tid.load(Ordering::Relaxed)
    }

    pub(crate) fn set_worker_tid(&self, tid: i32) {
        self.worker_tid.store(tid, Ordering::Relaxed);
    }

    pub fn restore_pending(&self) -> bool {
        self.ib_restore_work.is_pending()
    }

    pub fn removal_pending(&self) -> bool {
        self.mig_boost_rem.is_pending()
    }

    /// Publish a migration request and wake the sync worker. Returns false
    /// when the wake was coalesced into one already in flight.
    ///
    /// The wake flag is released right after notifying rather than when the
    /// worker consumes the request, so a request landing between the worker
    /// draining the mailbox and the flag release waits for the next wake.
    pub(crate) fn post_migration(&self, src_cpu: usize, task_load: u32) -> bool {
        {
            let mut mb = lock(&self.mailbox);
            mb.pending = true;
            mb.src_cpu = src_cpu;
            mb.task_load = task_load;
        }

        if self
            .being_woken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.sync_wq.notify_one();
            self.being_woken.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Drop any unconsumed request and the migration floor.
    pub(crate) fn clear_migration(&self) {
        let mut mb = lock(&self.mailbox);
        mb.pending = false;
        self.set_migration_freq(0);
    }

    pub(crate) fn request_repin(&self) {
        lock(&self.mailbox).repin = true;
        self.sync_wq.notify_one();
    }

    pub(crate) fn request_stop(&self) {
        lock(&self.mailbox).stop = true;
        self.sync_wq.notify_all();
    }
}

/// Bookkeeping for the input boost cycle currently running.
#[derive(Debug, Default)]
pub(crate) struct InputCycle {
    pub nr_boosted: usize,
    pub nr_to_boost: usize,
    pub adj_duration_ms: u64,
    pub start: Option<Instant>,
    pub admitted: Vec<usize>,
}

impl InputCycle {
    pub(crate) fn reset(&mut self) {
        self.nr_boosted = 0;
        self.nr_to_boost = 0;
        self.adj_duration_ms = 0;
        self.start = None;
        self.admitted.clear();
    }

    pub(crate) fn admit(&mut self, cpu: usize) {
        self.nr_boosted += 1;
        self.admitted.push(cpu);
    }

    /// Remaining boost time for a CPU admitted now, if it may still be admitted.
    pub(crate) fn remaining_ms(&self, cpu: usize) -> Option<u64> {
        if self.nr_boosted >= self.nr_to_boost || self.admitted.contains(&cpu) {
            return None;
        }
        let elapsed = self.start?.elapsed().as_millis() as u64;
        self.adj_duration_ms.checked_sub(elapsed).filter(|ms| *ms > 0)
    }
}

/// Point-in-time view of the input cycle, for tests and the control API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSnapshot {
    pub running: bool,
    pub nr_boosted: usize,
    pub nr_to_boost: usize,
    pub adj_duration_ms: u64,
}
