// SPDX-License-Identifier: GPL-2.0

mod common;

use std::time::Duration;

use common::{bounds, engine, floor, wait_for, FakePlatform, MHZ};
use scx_iboost::boost::FB_BOOST_MS;
use scx_iboost::{BoostParams, BoostStatus, FbBoost};

const LONG: Duration = Duration::from_millis(FB_BOOST_MS * 3);

#[test]
fn rapid_second_unblank_is_ignored() {
    let platform = FakePlatform::new(4, &[0, 1, 2], bounds(2000, 300, 300));
    let boost = engine(BoostParams::default(), &platform);

    boost.on_blank_changed(false);
    assert!(boost.is_suspended());
    boost.on_blank_changed(true);
    assert!(!boost.is_suspended());
    assert!(boost.fb_boost().is_on());

    boost.on_blank_changed(false);
    boost.on_blank_changed(true);
    assert_eq!(boost.metrics().fb_boosts, 1);

    for cpu in 0..4 {
        assert_eq!(floor(&boost, &platform, cpu), 2000 * MHZ);
    }

    assert!(wait_for(LONG, || boost.fb_boost() == FbBoost::Off));
    assert!(!boost.fb_boost_pending());
    assert_eq!(floor(&boost, &platform, 1), 300 * MHZ);
    boost.shutdown();
}

#[test]
fn boost_window_then_cooldown_then_release() {
    let platform = FakePlatform::new(2, &[0, 1], bounds(2000, 300, 300));
    let boost = engine(BoostParams::default(), &platform);

    boost.on_blank_changed(true);
    assert!(wait_for(LONG, || boost.fb_boost() == FbBoost::Cooldown));
    let reevals = platform.take_reevaluations();
    assert!(reevals.contains(&0));
    assert!(reevals.contains(&1));

    assert!(wait_for(LONG, || boost.fb_boost() == FbBoost::Off));
    assert!(wait_for(LONG, || {
        let reevals = platform.take_reevaluations();
        reevals.contains(&0) && reevals.contains(&1)
    }));
    boost.shutdown();
}

#[test]
fn input_state_survives_display_boost() {
    let platform = FakePlatform::new(2, &[0, 1], bounds(2000, 300, 300));
    let boost = engine(
        BoostParams {
            ib_freqs: [1200 * MHZ, 1000 * MHZ],
            ib_duration_ms: 20_000,
            ..Default::default()
        },
        &platform,
    );

    boost.on_input_activity();
    assert!(wait_for(LONG, || boost.status(0) == Some(BoostStatus::Boost)));

    boost.on_blank_changed(true);
    assert_eq!(floor(&boost, &platform, 0), 2000 * MHZ);

    // Input activity is ignored while the display boost runs.
    let cycles = boost.metrics().input_cycles;
    boost.on_input_activity();
    assert_eq!(boost.metrics().input_cycles, cycles);

    assert!(wait_for(LONG, || boost.fb_boost() == FbBoost::Off));
    assert_eq!(boost.status(0), Some(BoostStatus::Boost));
    assert!(boost.restore_pending(0));
    assert_eq!(floor(&boost, &platform, 0), 1200 * MHZ);
    boost.shutdown();
}

#[test]
fn blank_events_ignored_while_disabled() {
    let platform = FakePlatform::new(2, &[0, 1], bounds(2000, 300, 300));
    let boost = engine(
        BoostParams {
            enabled: false,
            ..Default::default()
        },
        &platform,
    );

    boost.on_blank_changed(false);
    assert!(!boost.is_suspended());
    boost.on_blank_changed(true);
    assert_eq!(boost.fb_boost(), FbBoost::Off);
    boost.shutdown();
}

#[test]
fn suspended_survives_disable() {
    let platform = FakePlatform::new(2, &[0, 1], bounds(2000, 300, 300));
    let boost = engine(BoostParams::default(), &platform);

    boost.on_blank_changed(false);
    boost.set_enabled(false);
    assert!(boost.is_suspended());
    boost.shutdown();
}
