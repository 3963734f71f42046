// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: boost counters and periodic reporting
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::Result;
use chrono::Local;
use log::debug;
use log::info;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

/// Event counters bumped by the engine. All monotonic.
#[derive(Debug, Default)]
pub struct Stats {
    pub input_triggers: AtomicU64,
    pub input_cycles: AtomicU64,
    pub late_admissions: AtomicU64,
    pub input_restores: AtomicU64,
    pub fb_boosts: AtomicU64,
    pub migration_requests: AtomicU64,
    pub coalesced_wakes: AtomicU64,
    pub migration_boosts: AtomicU64,
    pub sync_below_floor: AtomicU64,
    pub sync_offline: AtomicU64,
    pub sync_lookup_failures: AtomicU64,
    pub stop_and_clear: AtomicU64,
}

impl Stats {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[stat_doc]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Stats)]
#[serde(default)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Boosting enabled (0/1)")]
    pub enabled: u64,
    #[stat(desc = "Display boost active or cooling down (0/1)")]
    pub fb_boost: u64,
    #[stat(desc = "Display blanked (0/1)")]
    pub suspended: u64,
    #[stat(desc = "CPUs currently input boosted")]
    pub boosted_cpus: u64,
    #[stat(desc = "CPUs currently holding a migration floor")]
    pub migration_floors: u64,
    #[stat(desc = "Input events that reached the engine")]
    pub input_triggers: u64,
    #[stat(desc = "Input boost cycles started")]
    pub input_cycles: u64,
    #[stat(desc = "CPUs admitted after their cycle had started")]
    pub late_admissions: u64,
    #[stat(desc = "Input boost restores")]
    pub input_restores: u64,
    #[stat(desc = "Display unblank boosts")]
    pub fb_boosts: u64,
    #[stat(desc = "Migration boost requests posted")]
    pub migration_requests: u64,
    #[stat(desc = "Migration wakes folded into one in flight")]
    pub coalesced_wakes: u64,
    #[stat(desc = "Migration floors applied")]
    pub migration_boosts: u64,
    #[stat(desc = "Migrations dropped: source below destination floor")]
    pub sync_below_floor: u64,
    #[stat(desc = "Migrations dropped: CPU offline")]
    pub sync_offline: u64,
    #[stat(desc = "Migrations dropped: policy lookup failed")]
    pub sync_lookup_failures: u64,
    #[stat(desc = "Full resets of all boost state")]
    pub stop_and_clear: u64,
}

impl Metrics {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let flag = |on: u64, name: &'static str| if on != 0 { name } else { "-" };

        writeln!(
            w,
            "[{} {}] {} {} {}",
            crate::BOOST_NAME,
            Local::now().format("%H:%M:%S"),
            flag(self.enabled, "enabled"),
            flag(self.fb_boost, "fb"),
            flag(self.suspended, "suspended"),
        )?;
        writeln!(
            w,
            "  input: trig {:>6}  cycles {:>5}  late {:>4}  restore {:>5}  boosted {:>2}",
            self.input_triggers,
            self.input_cycles,
            self.late_admissions,
            self.input_restores,
            self.boosted_cpus
        )?;
        writeln!(
            w,
            "  mig:   req {:>6}  coal {:>5}  applied {:>5}  floors {:>2}",
            self.migration_requests, self.coalesced_wakes, self.migration_boosts, self.migration_floors
        )?;
        writeln!(
            w,
            "  drop:  floor {:>5}  offline {:>4}  lookup {:>4}   fb {:>4}  clear {:>3}",
            self.sync_below_floor,
            self.sync_offline,
            self.sync_lookup_failures,
            self.fb_boosts,
            self.stop_and_clear
        )?;
        Ok(())
    }

    pub fn delta(&self, prev: &Self) -> Self {
        Self {
            enabled: self.enabled,
            fb_boost: self.fb_boost,
            suspended: self.suspended,
            boosted_cpus: self.boosted_cpus,
            migration_floors: self.migration_floors,
            input_triggers: self.input_triggers.saturating_sub(prev.input_triggers),
            input_cycles: self.input_cycles.saturating_sub(prev.input_cycles),
            late_admissions: self.late_admissions.saturating_sub(prev.late_admissions),
            input_restores: self.input_restores.saturating_sub(prev.input_restores),
            fb_boosts: self.fb_boosts.saturating_sub(prev.fb_boosts),
            migration_requests: self.migration_requests.saturating_sub(prev.migration_requests),
            coalesced_wakes: self.coalesced_wakes.saturating_sub(prev.coalesced_wakes),
            migration_boosts: self.migration_boosts.saturating_sub(prev.migration_boosts),
            sync_below_floor: self.sync_below_floor.saturating_sub(prev.sync_below_floor),
            sync_offline: self.sync_offline.saturating_sub(prev.sync_offline),
            sync_lookup_failures: self
                .sync_lookup_failures
                .saturating_sub(prev.sync_lookup_failures),
            stop_and_clear: self.stop_and_clear.saturating_sub(prev.stop_and_clear),
        }
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

fn sleep_unless(intv: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + intv;
    while !shutdown.load(Ordering::Relaxed) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        thread::sleep(left.min(Duration::from_millis(100)));
    }
}

/// Print interval deltas from the stats server until `shutdown` is set,
/// reconnecting whenever the daemon goes away.
pub fn monitor(intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut waiting = false;

    while !shutdown.load(Ordering::Relaxed) {
        let mut client = match StatsClient::new().connect(None) {
            Ok(client) => client,
            Err(e) => {
                if !waiting {
                    info!("Stats server not available, retrying...");
                    waiting = true;
                }
                debug!("stats connect: {:#}", e);
                sleep_unless(Duration::from_secs(1), &shutdown);
                continue;
            }
        };
        waiting = false;

        while !shutdown.load(Ordering::Relaxed) {
            match client.request::<Metrics>("stats", vec![]) {
                Ok(metrics) => metrics.format(&mut std::io::stdout())?,
                Err(e) => {
                    info!("Connection to stats server lost: {:#}", e);
                    break;
                }
            }
            sleep_unless(intv, &shutdown);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_includes_numbers() {
        let m = Metrics {
            enabled: 1,
            input_triggers: 1234,
            migration_boosts: 77,
            ..Default::default()
        };
        let mut out = Vec::new();
        m.format(&mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("enabled"));
        assert!(s.contains("1234"));
        assert!(s.contains("77"));
    }

    #[test]
    fn delta_keeps_live_values() {
        let prev = Metrics {
            input_triggers: 10,
            boosted_cpus: 1,
            ..Default::default()
        };
        let cur = Metrics {
            input_triggers: 25,
            boosted_cpus: 2,
            fb_boost: 1,
            ..Default::default()
        };
        let d = cur.delta(&prev);
        assert_eq!(d.input_triggers, 15);
        assert_eq!(d.boosted_cpus, 2);
        assert_eq!(d.fb_boost, 1);
    }

    #[test]
    fn help_stats_lists_every_field() {
        let mut out = Vec::new();
        server_data().describe_meta(&mut out, None).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("coalesced_wakes"));
        assert!(s.contains("Migration wakes folded into one in flight"));
        assert!(s.contains("stop_and_clear"));
    }
}
