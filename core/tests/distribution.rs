//! Distribution expander tests.

use crmsim_core::distribution::{expand, DistributionMethod};

const T0: i64 = 1_767_225_600_000; // 2026-01-01T00:00:00Z
const HOUR: i64 = 3_600_000;

fn first_half(ts: &[i64]) -> usize {
    ts.iter().filter(|t| **t < T0 + HOUR / 2).count()
}

fn middle_half(ts: &[i64]) -> usize {
    ts.iter()
        .filter(|t| **t >= T0 + HOUR / 4 && **t < T0 + 3 * HOUR / 4)
        .count()
}

#[test]
fn linear_hundred_over_one_hour_is_evenly_spaced() {
    let ts = expand(DistributionMethod::Linear, 100, T0, T0 + HOUR);

    assert_eq!(ts.len(), 100);
    assert_eq!(ts[0], T0 + 18_000);
    assert_eq!(ts[99], T0 + 3_582_000);
    for pair in ts.windows(2) {
        assert_eq!(pair[1] - pair[0], 36_000, "uneven spacing at {pair:?}");
    }
}

#[test]
fn zero_count_yields_nothing() {
    for method in DistributionMethod::ALL {
        assert!(expand(method, 0, T0, T0 + HOUR).is_empty());
    }
}

#[test]
fn zero_width_window_collapses_to_start() {
    for method in DistributionMethod::ALL {
        let ts = expand(method, 7, T0, T0);
        assert_eq!(ts, vec![T0; 7], "{}", method.as_str());
    }
}

#[test]
fn skewed_methods_lean_toward_their_end() {
    let front = expand(DistributionMethod::FrontLoaded, 100, T0, T0 + HOUR);
    let back = expand(DistributionMethod::BackLoaded, 100, T0, T0 + HOUR);

    assert!(first_half(&front) >= 65, "front_loaded first half: {}", first_half(&front));
    assert!(first_half(&back) <= 35, "back_loaded first half: {}", first_half(&back));
}

#[test]
fn bell_and_surge_concentrate_mid_window() {
    let linear = expand(DistributionMethod::Linear, 100, T0, T0 + HOUR);
    let bell = expand(DistributionMethod::BellCurve, 100, T0, T0 + HOUR);
    let surge = expand(DistributionMethod::SurgeMid, 100, T0, T0 + HOUR);

    assert_eq!(middle_half(&linear), 50);
    assert!(middle_half(&bell) >= 65, "bell middle: {}", middle_half(&bell));
    assert!(
        middle_half(&surge) > middle_half(&linear) && middle_half(&surge) < middle_half(&bell),
        "surge_mid middle: {}",
        middle_half(&surge)
    );
    // Both are symmetric about the midpoint.
    assert_eq!(first_half(&bell), 50);
    assert_eq!(first_half(&surge), 50);
}

#[test]
fn method_names_are_snake_case() {
    for method in DistributionMethod::ALL {
        assert_eq!(DistributionMethod::parse(method.as_str()), Some(method));
        let json = serde_json::to_string(&method).unwrap();
        assert_eq!(json, format!("\"{}\"", method.as_str()));
    }
    assert_eq!(DistributionMethod::parse("sideways"), None);
}
