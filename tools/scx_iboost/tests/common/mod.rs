// SPDX-License-Identifier: GPL-2.0
//
// Shared fixtures for the scx_iboost integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use scx_iboost::{BoostParams, CpuBoost, CpuTopology, Governor, PolicyBounds};

pub const MHZ: u32 = 1000;

pub fn bounds(max_mhz: u32, hw_min_mhz: u32, cur_mhz: u32) -> PolicyBounds {
    PolicyBounds {
        min: hw_min_mhz * MHZ,
        max: max_mhz * MHZ,
        hw_min: hw_min_mhz * MHZ,
        cur: cur_mhz * MHZ,
    }
}

/// In-memory cpufreq: per-CPU policy bounds, an online mask and a log of
/// re-evaluation requests.
pub struct FakePlatform {
    nr_possible: usize,
    online: Mutex<Vec<usize>>,
    policies: Mutex<HashMap<usize, PolicyBounds>>,
    reevaluations: Mutex<Vec<usize>>,
}

impl FakePlatform {
    pub fn new(nr_possible: usize, online: &[usize], default: PolicyBounds) -> Arc<Self> {
        Arc::new(Self {
            nr_possible,
            online: Mutex::new(online.to_vec()),
            policies: Mutex::new((0..nr_possible).map(|cpu| (cpu, default)).collect()),
            reevaluations: Mutex::new(Vec::new()),
        })
    }

    pub fn set_online(&self, online: &[usize]) {
        *self.online.lock().unwrap() = online.to_vec();
    }

    pub fn set_policy(&self, cpu: usize, bounds: PolicyBounds) {
        self.policies.lock().unwrap().insert(cpu, bounds);
    }

    pub fn bounds(&self, cpu: usize) -> PolicyBounds {
        self.policies.lock().unwrap()[&cpu]
    }

    pub fn take_reevaluations(&self) -> Vec<usize> {
        std::mem::take(&mut *self.reevaluations.lock().unwrap())
    }
}

impl Governor for FakePlatform {
    fn policy(&self, cpu: usize) -> Result<PolicyBounds> {
        self.policies
            .lock()
            .unwrap()
            .get(&cpu)
            .copied()
            .ok_or_else(|| anyhow!("no policy for cpu{}", cpu))
    }

    fn request_reevaluation(&self, cpu: usize) {
        self.reevaluations.lock().unwrap().push(cpu);
    }
}

impl CpuTopology for FakePlatform {
    fn nr_possible(&self) -> usize {
        self.nr_possible
    }

    fn online_cpus(&self) -> Vec<usize> {
        self.online.lock().unwrap().clone()
    }
}

pub fn engine(params: BoostParams, platform: &Arc<FakePlatform>) -> Arc<CpuBoost> {
    CpuBoost::new(&params, platform.clone(), platform.clone()).unwrap()
}

/// What the governor would apply to `cpu` right now.
pub fn floor(boost: &CpuBoost, platform: &FakePlatform, cpu: usize) -> u32 {
    boost.compute_floor(cpu, &platform.bounds(cpu))
}

pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
