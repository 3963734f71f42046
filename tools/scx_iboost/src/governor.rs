// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: frequency governor and CPU topology seams
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::Result;
use serde::Serialize;

/// Current cpufreq policy bounds of one CPU, in kHz.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PolicyBounds {
    /// Currently applied minimum.
    pub min: u32,
    pub max: u32,
    /// Hardware minimum (cpuinfo_min_freq).
    pub hw_min: u32,
    pub cur: u32,
}

/// The frequency governor as seen by the boost engine.
pub trait Governor: Send + Sync {
    fn policy(&self, cpu: usize) -> Result<PolicyBounds>;

    /// Ask the governor to re-evaluate `cpu` soon. Must not block.
    fn request_reevaluation(&self, cpu: usize);
}

pub trait CpuTopology: Send + Sync {
    fn nr_possible(&self) -> usize;
    fn online_cpus(&self) -> Vec<usize>;

    fn is_online(&self, cpu: usize) -> bool {
        self.online_cpus().contains(&cpu)
    }

    fn nr_online(&self) -> usize {
        self.online_cpus().len()
    }
}
