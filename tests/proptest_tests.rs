//! Property-based tests for aggregation and dispatch ordering.
//!
//! Aggregation must not depend on how outcomes are batched or in which
//! order workers finish, and interleaving must never drop or duplicate a
//! target.

use proptest::collection::vec;
use proptest::prelude::*;

use virtbench::aggregate::{fold, summarize, FailureReason, Outcome, RunSummary, TerminalReason};
use virtbench::dispatcher::interleave;
use virtbench::target::Target;

// ============================================================================
// Strategies
// ============================================================================

fn failure_reason() -> impl Strategy<Value = FailureReason> {
    prop_oneof![
        Just(FailureReason::Error),
        Just(FailureReason::CapacityExhausted),
        Just(FailureReason::Timeout),
        Just(FailureReason::Interrupted),
        Just(FailureReason::Skipped),
    ]
}

/// Whole-second durations keep float sums exact under regrouping.
fn outcome() -> impl Strategy<Value = Outcome> {
    let success = (0u32..1000, 0u16..600, proptest::option::of(0u16..300)).prop_map(|(id, running, clone)| {
        let mut outcome = Outcome::succeeded(Target::vm(format!("vm-{}", id), "ns"))
            .with_duration("running", f64::from(running));
        if let Some(clone) = clone {
            outcome = outcome.with_duration("clone", f64::from(clone));
        }
        outcome
    });
    let failure = (0u32..1000, failure_reason()).prop_map(|(id, reason)| {
        Outcome::failed(Target::vm(format!("vm-{}", id), "ns"), reason, reason.as_str())
    });
    prop_oneof![3 => success, 1 => failure]
}

// ============================================================================
// Aggregation
// ============================================================================

proptest! {
    #[test]
    fn prop_fold_is_associative(a in vec(outcome(), 0..40), b in vec(outcome(), 0..40)) {
        let mut all = a.clone();
        all.extend(b.iter().cloned());
        let whole = summarize(&all);

        let folded = fold(summarize(&a), &b);
        prop_assert_eq!(&folded, &whole);

        let mut merged = summarize(&a);
        merged.merge(&summarize(&b));
        prop_assert_eq!(&merged, &whole);
    }

    #[test]
    fn prop_summary_ignores_completion_order(outcomes in vec(outcome(), 0..60)) {
        let mut reversed = outcomes.clone();
        reversed.reverse();
        prop_assert_eq!(summarize(&outcomes), summarize(&reversed));
    }

    #[test]
    fn prop_counts_add_up(outcomes in vec(outcome(), 0..60)) {
        let summary = summarize(&outcomes);
        prop_assert_eq!(summary.total, outcomes.len());
        prop_assert_eq!(summary.successful + summary.failed + summary.skipped, summary.total);
        let by_reason: usize = summary.failures_by_reason.values().sum();
        prop_assert_eq!(by_reason, summary.failed + summary.skipped);
    }

    #[test]
    fn prop_metric_stats_bounds(outcomes in vec(outcome(), 1..60)) {
        let summary = summarize(&outcomes);
        for stats in summary.per_metric.values() {
            prop_assert!(stats.min <= stats.avg() && stats.avg() <= stats.max);
            prop_assert!(stats.count as usize <= summary.successful);
        }
    }

    #[test]
    fn prop_terminal_reason_is_highest_priority(outcomes in vec(outcome(), 0..60)) {
        let summary = summarize(&outcomes);
        let expected = outcomes
            .iter()
            .filter_map(|o| o.failure_reason)
            .filter_map(TerminalReason::from_failure)
            .max()
            .unwrap_or_default();
        prop_assert_eq!(summary.terminal_reason, expected);
    }

    #[test]
    fn prop_empty_fold_is_identity(outcomes in vec(outcome(), 0..40)) {
        let summary = summarize(&outcomes);
        let mut merged = summary.clone();
        merged.merge(&RunSummary::new());
        prop_assert_eq!(merged, summary);
    }
}

// ============================================================================
// Interleaving
// ============================================================================

proptest! {
    #[test]
    fn prop_interleave_is_permutation(len in 0usize..200, groups in 0usize..12) {
        let items: Vec<usize> = (0..len).collect();
        let mut ordered = interleave(items.clone(), groups);
        prop_assert_eq!(ordered.len(), len);
        ordered.sort_unstable();
        prop_assert_eq!(ordered, items);
    }

    #[test]
    fn prop_interleave_spreads_groups(groups in 2usize..8, per_group in 2usize..10) {
        // Items laid out group by group; consecutive dispatches must come
        // from different groups when the split is even.
        let len = groups * per_group;
        let ordered = interleave((0..len).collect::<Vec<_>>(), groups);
        for pair in ordered.windows(2) {
            prop_assert_ne!(pair[0] / per_group, pair[1] / per_group);
        }
    }
}
