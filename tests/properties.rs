use cutover::domain::rollout::{ramp_schedule, rolling_batches, weight_for_share};
use cutover::domain::{
    compute_lag, forward_step, resolve, FailureCounter, GateOutcome, Phase, TrafficSplit,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn any_phase() -> impl Strategy<Value = Phase> {
    prop::sample::select(vec![
        Phase::Uninitialized,
        Phase::Phase1Running,
        Phase::Phase1Ready,
        Phase::Migrating,
        Phase::Phase2Running,
        Phase::Phase2Ready,
    ])
}

proptest! {
    #[test]
    fn two_version_split_sums_to_100(weight in 0u8..=100) {
        let split = TrafficSplit::between("v1", "v2", weight).unwrap();
        prop_assert_eq!(split.total(), 100);
        prop_assert_eq!(split.weight_of("v2"), weight);
    }

    #[test]
    fn split_not_summing_to_100_is_rejected(a in 0u8..=100, b in 0u8..=100) {
        prop_assume!(u32::from(a) + u32::from(b) != 100);
        let weights = BTreeMap::from([("v1".to_string(), a), ("v2".to_string(), b)]);
        prop_assert!(TrafficSplit::new(weights.clone()).is_err());
        let json = serde_json::to_string(&weights).unwrap();
        prop_assert!(serde_json::from_str::<TrafficSplit>(&json).is_err());
    }

    #[test]
    fn ramp_schedule_increases_to_100(initial in 1u8..100, steps in prop::collection::vec(0u8..=120, 0..6)) {
        let schedule = ramp_schedule(initial, &steps);
        prop_assert_eq!(schedule.first().copied(), Some(initial));
        prop_assert_eq!(schedule.last().copied(), Some(100));
        prop_assert!(schedule.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn rolling_batches_cover_every_instance(total in 0u32..200, max_parallel in 0u32..10) {
        let batches = rolling_batches(total, max_parallel);
        prop_assert_eq!(batches.last().copied().unwrap_or(0), total);
        let mut previous = 0;
        for done in batches {
            prop_assert!(done > previous);
            prop_assert!(done - previous <= max_parallel.max(1));
            previous = done;
        }
    }

    #[test]
    fn share_weight_is_monotonic(total in 1u32..500, a in 0u32..500, b in 0u32..500) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(weight_for_share(low, total) <= weight_for_share(high, total));
        prop_assert!(weight_for_share(high, total) <= 100);
        prop_assert_eq!(weight_for_share(total, total), 100);
    }

    #[test]
    fn forward_steps_only_advance(phase in any_phase()) {
        if let Some(step) = forward_step(phase) {
            prop_assert!(step.target > phase);
            let ready = resolve(&step, GateOutcome::Ready);
            prop_assert_eq!(ready.next, step.target);

            let timed_out = resolve(&step, GateOutcome::TimedOut);
            prop_assert!(timed_out.next <= phase);
            prop_assert!(timed_out.next.is_ready());
        } else {
            prop_assert_eq!(phase, Phase::Phase2Ready);
        }
    }

    #[test]
    fn lag_never_exceeds_local_position(last_wal in any::<u64>(), remote in any::<u64>()) {
        let lag = compute_lag(last_wal, remote);
        prop_assert!(lag <= last_wal);
        prop_assert_eq!(lag == 0, remote >= last_wal);
    }

    #[test]
    fn one_signal_per_failure_streak(samples in prop::collection::vec(any::<bool>(), 0..40), threshold in 1u32..5) {
        let mut counter = FailureCounter::default();
        let signals = samples.iter().filter(|healthy| counter.record(**healthy, threshold)).count();

        let mut streaks = 0;
        let mut run = 0;
        for healthy in &samples {
            if *healthy {
                run = 0;
            } else {
                run += 1;
                if run == threshold {
                    streaks += 1;
                }
            }
        }
        prop_assert_eq!(signals, streaks);
    }
}
