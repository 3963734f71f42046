// SPDX-License-Identifier: GPL-2.0
//
// scx_iboost: per-CPU migration sync workers
// Copyright (c) 2025 The scx_iboost authors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, trace};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::{gettid, Pid};

use crate::boost::CpuBoost;
use crate::lock;
use crate::state::BoostState;
use crate::stats::Stats;

/// Start the sync worker serving migrations onto `cpu`.
pub(crate) fn spawn(boost: &Arc<CpuBoost>, cpu: usize) -> Result<JoinHandle<()>> {
    let boost = Arc::clone(boost);
    thread::Builder::new()
        .name(format!("boost_sync/{cpu}"))
        .spawn(move || sync_loop(&boost, cpu))
        .with_context(|| format!("failed to spawn sync worker for CPU{}", cpu))
}

fn pin_to_cpu(boost: &CpuBoost, cpu: usize) {
    if !boost.topo.is_online(cpu) {
        return;
    }
    let mut set = CpuSet::new();
    if let Err(e) = set.set(cpu) {
        debug!("boost_sync/{}: bad cpu: {}", cpu, e);
    } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        debug!("boost_sync/{}: failed to pin: {}", cpu, e);
    }
}

fn sync_loop(boost: &CpuBoost, cpu: usize) {
    let Some(b) = boost.state(cpu) else {
        return;
    };
    b.set_worker_tid(gettid().as_raw());
    pin_to_cpu(boost, cpu);

    loop {
        let (repin, request) = {
            let mb = lock(&b.mailbox);
            let mut mb = b
                .sync_wq
                .wait_while(mb, |m| !m.pending && !m.stop && !m.repin)
                .unwrap_or_else(PoisonError::into_inner);
            if mb.stop {
                break;
            }
            let repin = std::mem::take(&mut mb.repin);
            let request = std::mem::take(&mut mb.pending).then_some((mb.src_cpu, mb.task_load));
            (repin, request)
        };

        if repin {
            pin_to_cpu(boost, cpu);
        }
        if let Some((src_cpu, task_load)) = request {
            sync_migration(boost, b, src_cpu, task_load);
        }
    }
    trace!("boost_sync/{}: exiting", cpu);
}

/// Size and apply the migration floor for one request onto `b.cpu`.
pub(crate) fn sync_migration(boost: &CpuBoost, b: &BoostState, src_cpu: usize, task_load: u32) {
    let dest_cpu = b.cpu;
    let (src, dest) = match (boost.gov.policy(src_cpu), boost.gov.policy(dest_cpu)) {
        (Ok(src), Ok(dest)) => (src, dest),
        (Err(e), _) | (_, Err(e)) => {
            debug!("sync CPU{} --> CPU{}: {:#}", src_cpu, dest_cpu, e);
            Stats::inc(&boost.stats.sync_lookup_failures);
            return;
        }
    };

    let by_load = (dest.max as u64 * task_load as u64 / 100) as u32;
    let req_freq = by_load.max(src.cur);
    if req_freq <= dest.hw_min {
        debug!("No sync. Sync Freq:{}", req_freq);
        Stats::inc(&boost.stats.sync_below_floor);
        return;
    }

    b.mig_boost_rem.cancel_sync();

    let t = boost.tunables();
    let dest_online = boost.topo.is_online(dest_cpu);
    let applied = {
        let _mb = lock(&b.mailbox);
        if t.enabled() && dest_online {
            b.set_migration_freq(req_freq);
            b.mig_boost_rem
                .queue(Duration::from_millis(t.migration_boost_ms()));
            true
        } else {
            b.set_migration_freq(0);
            false
        }
    };

    if boost.topo.is_online(src_cpu) {
        boost.gov.request_reevaluation(src_cpu);
    }
    if applied {
        boost.gov.request_reevaluation(dest_cpu);
        Stats::inc(&boost.stats.migration_boosts);
        trace!("sync CPU{} --> CPU{}: floor {}", src_cpu, dest_cpu, req_freq);
    } else if !dest_online {
        Stats::inc(&boost.stats.sync_offline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoostParams;
    use crate::governor::mock::MockGovernor;
    use crate::governor::PolicyBounds;

    fn policy(max: u32, hw_min: u32, cur: u32) -> PolicyBounds {
        PolicyBounds {
            min: hw_min,
            max,
            hw_min,
            cur,
        }
    }

    fn setup(online: &[usize]) -> (Arc<CpuBoost>, Arc<MockGovernor>) {
        let mock = Arc::new(MockGovernor::new(4, online, policy(2_000_000, 300_000, 300_000)));
        let params = BoostParams {
            migration_boost_ms: 5_000,
            ..Default::default()
        };
        let boost = CpuBoost::new(&params, mock.clone(), mock.clone()).unwrap();
        (boost, mock)
    }

    #[test]
    fn floor_from_load_or_source_frequency() {
        let (boost, mock) = setup(&[0, 1, 2, 3]);
        mock.set_bounds(0, policy(2_000_000, 300_000, 1_200_000));
        mock.take_reevaluations();

        sync_migration(&boost, boost.state(2).unwrap(), 0, 80);
        assert_eq!(boost.migration_freq(2), Some(1_600_000));
        assert!(boost.removal_pending(2));
        let reevals = mock.take_reevaluations();
        assert!(reevals.contains(&0));
        assert!(reevals.contains(&2));

        // Source frequency wins when the load share is lower.
        sync_migration(&boost, boost.state(3).unwrap(), 0, 10);
        assert_eq!(boost.migration_freq(3), Some(1_200_000));
        boost.shutdown();
    }

    #[test]
    fn below_hw_min_is_discarded() {
        let (boost, _mock) = setup(&[0, 1]);
        sync_migration(&boost, boost.state(1).unwrap(), 0, 0);
        assert_eq!(boost.migration_freq(1), Some(0));
        assert!(!boost.removal_pending(1));
        assert_eq!(boost.metrics().sync_below_floor, 1);
        boost.shutdown();
    }

    #[test]
    fn offline_destination_keeps_no_floor() {
        let (boost, mock) = setup(&[0, 1]);
        mock.set_bounds(0, policy(2_000_000, 300_000, 1_200_000));
        sync_migration(&boost, boost.state(3).unwrap(), 0, 50);
        assert_eq!(boost.migration_freq(3), Some(0));
        assert!(!boost.removal_pending(3));
        assert_eq!(boost.metrics().sync_offline, 1);
        boost.shutdown();
    }

    #[test]
    fn lookup_failure_drops_request() {
        let (boost, mock) = setup(&[0, 1]);
        mock.forget(0);
        sync_migration(&boost, boost.state(1).unwrap(), 0, 90);
        assert_eq!(boost.migration_freq(1), Some(0));
        assert_eq!(boost.metrics().sync_lookup_failures, 1);
        boost.shutdown();
    }
}
