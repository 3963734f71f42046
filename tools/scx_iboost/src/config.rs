// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: tunables and their key-value surface
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::boost::CpuBoost;

/// Startup values of every tunable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoostParams {
    pub enabled: bool,
    /// Input boost floor for CPU0 and for every other CPU, in kHz.
    pub ib_freqs: [u32; 2],
    pub ib_duration_ms: u32,
    /// 0 disables migration boosting.
    pub migration_boost_ms: u32,
    pub migration_load_threshold: u32,
    pub load_based_syncs: bool,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            enabled: true,
            ib_freqs: [1_190_400, 1_190_400],
            ib_duration_ms: 40,
            migration_boost_ms: 0,
            migration_load_threshold: 15,
            load_based_syncs: false,
        }
    }
}

impl BoostParams {
    /// Same rules as runtime writes through [`CpuBoost::write_tunable`],
    /// except that `migration_boost_ms` may start at 0 to keep migration
    /// boosting off until it is configured.
    pub fn validate(&self) -> Result<()> {
        if self.ib_freqs.contains(&0) {
            bail!("ib_freqs must be non-zero");
        }
        if self.ib_duration_ms == 0 {
            bail!("ib_duration_ms must be non-zero");
        }
        if self.migration_load_threshold == 0 {
            bail!("migration_load_threshold must be non-zero");
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct Tunables {
    pub enabled: AtomicBool,
    pub ib_freqs: [AtomicU32; 2],
    pub ib_duration_ms: AtomicU32,
    pub migration_boost_ms: AtomicU32,
    pub migration_load_threshold: AtomicU32,
    pub load_based_syncs: AtomicBool,
}

impl Tunables {
    pub(crate) fn new(p: &BoostParams) -> Self {
        Self {
            enabled: AtomicBool::new(p.enabled),
            ib_freqs: [AtomicU32::new(p.ib_freqs[0]), AtomicU32::new(p.ib_freqs[1])],
            ib_duration_ms: AtomicU32::new(p.ib_duration_ms),
            migration_boost_ms: AtomicU32::new(p.migration_boost_ms),
            migration_load_threshold: AtomicU32::new(p.migration_load_threshold),
            load_based_syncs: AtomicBool::new(p.load_based_syncs),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Input boost frequency for `cpu`: index 0 for CPU0, 1 for the rest.
    pub(crate) fn ib_freq(&self, cpu: usize) -> u32 {
        self.ib_freqs[(cpu != 0) as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn ib_duration_ms(&self) -> u64 {
        self.ib_duration_ms.load(Ordering::Relaxed).into()
    }

    pub(crate) fn migration_boost_ms(&self) -> u64 {
        self.migration_boost_ms.load(Ordering::Relaxed).into()
    }

    pub(crate) fn migration_load_threshold(&self) -> u32 {
        self.migration_load_threshold.load(Ordering::Relaxed)
    }

    pub(crate) fn load_based_syncs(&self) -> bool {
        self.load_based_syncs.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> BoostParams {
        BoostParams {
            enabled: self.enabled(),
            ib_freqs: [self.ib_freq(0), self.ib_freq(1)],
            ib_duration_ms: self.ib_duration_ms.load(Ordering::Relaxed),
            migration_boost_ms: self.migration_boost_ms.load(Ordering::Relaxed),
            migration_load_threshold: self.migration_load_threshold(),
            load_based_syncs: self.load_based_syncs(),
        }
    }
}

/// Keys of the runtime configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tunable {
    Enabled,
    IbFreqs,
    IbDurationMs,
    LoadBasedSyncs,
    MigrationBoostMs,
    MigrationLoadThreshold,
}

impl Tunable {
    pub const ALL: [Tunable; 6] = [
        Tunable::Enabled,
        Tunable::IbFreqs,
        Tunable::IbDurationMs,
        Tunable::LoadBasedSyncs,
        Tunable::MigrationBoostMs,
        Tunable::MigrationLoadThreshold,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Tunable::Enabled => "enabled",
            Tunable::IbFreqs => "ib_freqs",
            Tunable::IbDurationMs => "ib_duration_ms",
            Tunable::LoadBasedSyncs => "load_based_syncs",
            Tunable::MigrationBoostMs => "migration_boost_ms",
            Tunable::MigrationLoadThreshold => "migration_load_threshold",
        }
    }
}

impl fmt::Display for Tunable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tunable {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Tunable::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| anyhow!("unknown tunable {:?}", s))
    }
}

fn parse_uint<T: FromStr>(value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("invalid value {:?}", value.trim()))
}

fn parse_nonzero<T>(value: &str) -> Result<T>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let v = parse_uint::<T>(value)?;
    if v == T::default() {
        bail!("value must be non-zero");
    }
    Ok(v)
}

fn parse_freqs(value: &str) -> Result<[u32; 2]> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    let [f0, f1] = fields.as_slice() else {
        bail!("expected two frequencies, got {}", fields.len());
    };
    let freqs = [parse_uint::<u32>(f0)?, parse_uint::<u32>(f1)?];
    if freqs.contains(&0) {
        bail!("frequencies must be non-zero");
    }
    Ok(freqs)
}

impl CpuBoost {
    pub fn read_tunable(&self, key: Tunable) -> String {
        let t = self.tunables();
        match key {
            Tunable::Enabled => (t.enabled() as u32).to_string(),
            Tunable::IbFreqs => format!("{} {}", t.ib_freq(0), t.ib_freq(1)),
            Tunable::IbDurationMs => t.ib_duration_ms().to_string(),
            Tunable::LoadBasedSyncs => (t.load_based_syncs() as u32).to_string(),
            Tunable::MigrationBoostMs => t.migration_boost_ms().to_string(),
            Tunable::MigrationLoadThreshold => t.migration_load_threshold().to_string(),
        }
    }

    /// Validate and apply one tunable. On error the previous value is kept.
    pub fn write_tunable(&self, key: Tunable, value: &str) -> Result<()> {
        self.apply_tunable(key, value).map_err(|e| {
            warn!("rejected {}={:?}: {:#}", key, value.trim(), e);
            e
        })
    }

    fn apply_tunable(&self, key: Tunable, value: &str) -> Result<()> {
        let t = self.tunables();
        match key {
            Tunable::Enabled => {
                let on = parse_uint::<u32>(value)? != 0;
                self.set_enabled(on);
            }
            Tunable::IbFreqs => {
                let [f0, f1] = parse_freqs(value)?;
                t.ib_freqs[0].store(f0, Ordering::Relaxed);
                t.ib_freqs[1].store(f1, Ordering::Relaxed);
            }
            Tunable::IbDurationMs => {
                t.ib_duration_ms.store(parse_nonzero(value)?, Ordering::Relaxed);
            }
            Tunable::LoadBasedSyncs => {
                let on = parse_uint::<u32>(value)? != 0;
                t.load_based_syncs.store(on, Ordering::Relaxed);
            }
            Tunable::MigrationBoostMs => {
                t.migration_boost_ms.store(parse_nonzero(value)?, Ordering::Relaxed);
            }
            Tunable::MigrationLoadThreshold => {
                t.migration_load_threshold
                    .store(parse_nonzero(value)?, Ordering::Relaxed);
            }
        }
        info!("{} = {}", key, self.read_tunable(key));
        Ok(())
    }

    pub fn params(&self) -> BoostParams {
        self.tunables().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunable_names_round_trip() {
        for t in Tunable::ALL {
            assert_eq!(t.name().parse::<Tunable>().unwrap(), t);
        }
        assert!("ib_freq".parse::<Tunable>().is_err());
    }

    #[test]
    fn freqs_need_two_nonzero_values() {
        assert_eq!(parse_freqs("1190400 800000").unwrap(), [1_190_400, 800_000]);
        assert_eq!(parse_freqs("  5 6\n").unwrap(), [5, 6]);
        assert!(parse_freqs("1190400").is_err());
        assert!(parse_freqs("1 2 3").is_err());
        assert!(parse_freqs("0 1190400").is_err());
        assert!(parse_freqs("abc 1").is_err());
    }

    #[test]
    fn nonzero_rejects_zero_and_garbage() {
        assert_eq!(parse_nonzero::<u32>("40\n").unwrap(), 40);
        assert!(parse_nonzero::<u32>("0").is_err());
        assert!(parse_nonzero::<u32>("-3").is_err());
        assert!(parse_nonzero::<u32>("").is_err());
        assert!(parse_nonzero::<u32>("4294967296").is_err());
    }

    #[test]
    fn default_params_are_valid() {
        assert!(BoostParams::default().validate().is_ok());
        let bad = BoostParams {
            ib_duration_ms: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn snapshot_matches_params() {
        let p = BoostParams {
            ib_freqs: [1, 2],
            load_based_syncs: true,
            ..Default::default()
        };
        assert_eq!(Tunables::new(&p).snapshot(), p);
    }
}
