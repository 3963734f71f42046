// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: userspace CPU input boost
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Dynamic per-CPU minimum frequency boosting.
//!
//! The [`CpuBoost`] engine raises the cpufreq floor of individual CPUs in
//! response to three independent triggers: user input, task migration and
//! display wake. The frequency governor stays in charge of picking the actual
//! frequency; the engine only answers "what is the minimum right now" through
//! [`CpuBoost::compute_floor`].
//!
//! The adapters in [`cpufreq`], [`input`], [`display`] and [`migration`] wire
//! the engine to the Linux sysfs, evdev and tracefs interfaces.

pub mod boost;
pub mod config;
pub mod control_api;
pub mod cpu_list;
pub mod cpufreq;
pub mod display;
pub mod governor;
pub mod input;
pub mod migration;
pub mod state;
pub mod stats;
mod sync_worker;
pub mod timer;

pub use boost::CpuBoost;
pub use boost::MigrationEvent;
pub use config::BoostParams;
pub use config::Tunable;
pub use governor::CpuTopology;
pub use governor::Governor;
pub use governor::PolicyBounds;
pub use state::BoostStatus;
pub use state::FbBoost;
pub use stats::Metrics;

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

pub const BOOST_NAME: &str = "scx_iboost";

/// Lock a mutex, recovering the guard if a previous holder panicked. Every
/// mutex in this crate guards plain data that stays consistent across panics.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
