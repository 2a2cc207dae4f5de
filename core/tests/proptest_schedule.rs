//! Property tests for the expander and the segment planner.

use crmsim_core::{
    distribution::{expand, DistributionMethod},
    segment::plan,
};
use proptest::prelude::*;

fn method() -> impl Strategy<Value = DistributionMethod> {
    prop::sample::select(DistributionMethod::ALL.to_vec())
}

proptest! {
    #[test]
    fn expander_returns_sorted_in_window(
        m in method(),
        n in 1usize..2_000,
        start in 0i64..2_000_000_000_000,
        span in 1i64..(30 * 86_400_000),
    ) {
        let end = start + span;
        let ts = expand(m, n, start, end);
        prop_assert_eq!(ts.len(), n);
        prop_assert!(ts.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(ts.iter().all(|t| *t >= start && *t <= end));
    }

    #[test]
    fn expander_is_deterministic(
        m in method(),
        n in 0usize..500,
        start in 0i64..2_000_000_000_000,
        span in 0i64..(7 * 86_400_000),
    ) {
        prop_assert_eq!(expand(m, n, start, start + span), expand(m, n, start, start + span));
    }

    #[test]
    fn segments_partition_every_index(
        m in method(),
        n in 1usize..1_500,
        span in 1i64..(3 * 86_400_000),
        bucket in 60_000i64..(6 * 3_600_000),
    ) {
        let start = 1_767_225_600_000i64;
        let ts = expand(m, n, start, start + span);
        let segments = plan(&ts, start, start + span, bucket);

        prop_assert!(!segments.is_empty());
        prop_assert_eq!(segments[0].first_idx, 0);
        prop_assert_eq!(segments.last().unwrap().last_idx, (n - 1) as u64);
        for (i, s) in segments.iter().enumerate() {
            prop_assert_eq!(s.ordinal as usize, i);
            prop_assert!(s.first_idx <= s.last_idx);
            // Every record in the segment falls inside its time bucket.
            for idx in s.first_idx..=s.last_idx {
                let t = ts[idx as usize];
                prop_assert!(t >= s.start && (t < s.start + bucket));
            }
        }
        for pair in segments.windows(2) {
            prop_assert_eq!(pair[1].first_idx, pair[0].last_idx + 1);
            prop_assert!(pair[1].start > pair[0].start);
        }
        let covered: u64 = segments.iter().map(|s| s.record_count()).sum();
        prop_assert_eq!(covered, n as u64);
    }
}
