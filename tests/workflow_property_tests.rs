//! Property-based tests for the transition guards, the custody sequencer,
//! lab code allocation and workflow classification
//!
//! These check invariants that must hold for every input rather than for a
//! handful of worked cases: guards deny everything their tables do not list,
//! custody stamps are write-once and ordered, counters never regress and
//! concurrent allocation never hands out the same code twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lab_custody::Role;
use lab_custody::allocator::{IdAllocator, parse_code};
use lab_custody::classify::{WorkflowGroup, resolve};
use lab_custody::custody::{CrosscheckStatus, CustodyEvent, CustodyTimeline};
use lab_custody::guard::{
    REQUEST_STATUS, SAMPLE_STATUS, TEST_STATUS, TransitionGuard, WorkflowState,
};
use lab_custody::sample::{RequestStatus, SampleStatus, TestStatus};
use lab_custody::types::TimeStamp;
use proptest::prelude::*;

// PROPERTY TEST STRATEGIES

/// Strategy to pick any role
fn role_strategy() -> impl Strategy<Value = Role> {
    prop::sample::select(Role::ALL.to_vec())
}

/// Strategy to pick any state of a machine
fn state_strategy<S: WorkflowState>() -> impl Strategy<Value = S> {
    prop::sample::select(S::all().to_vec())
}

/// Strategy to pick any custody checkpoint
fn event_strategy() -> impl Strategy<Value = CustodyEvent> {
    prop::sample::select(CustodyEvent::ALL.to_vec())
}

/// Strategy for a sequence of stamp attempts, each with an intake verdict
fn custody_attempts_strategy() -> impl Strategy<Value = Vec<(CustodyEvent, bool)>> {
    prop::collection::vec((event_strategy(), any::<bool>()), 0..30)
}

fn denies_unlisted<S: WorkflowState>(guard: &TransitionGuard<S>, role: Role, from: S, to: S) {
    let listed = guard.allowed_targets(role, from).contains(&to);
    assert_eq!(guard.can_transition(role, from, to), listed);
    assert_eq!(guard.check(role, from, to).is_ok(), listed);
}

proptest! {
    /// A transition is allowed exactly when its table lists it
    #[test]
    fn prop_sample_guard_matches_table(
        role in role_strategy(),
        from in state_strategy::<SampleStatus>(),
        to in state_strategy::<SampleStatus>(),
    ) {
        denies_unlisted(&SAMPLE_STATUS, role, from, to);
    }

    #[test]
    fn prop_request_guard_matches_table(
        role in role_strategy(),
        from in state_strategy::<RequestStatus>(),
        to in state_strategy::<RequestStatus>(),
    ) {
        denies_unlisted(&REQUEST_STATUS, role, from, to);
    }

    #[test]
    fn prop_test_guard_matches_table(
        role in role_strategy(),
        from in state_strategy::<TestStatus>(),
        to in state_strategy::<TestStatus>(),
    ) {
        denies_unlisted(&TEST_STATUS, role, from, to);
    }

    /// The client owns no edge in any status machine
    #[test]
    fn prop_client_never_moves_status(
        from in state_strategy::<RequestStatus>(),
        to in state_strategy::<RequestStatus>(),
    ) {
        prop_assert!(!REQUEST_STATUS.can_transition(Role::Client, from, to));
    }

    /// Whatever order stamps are attempted in, every accepted stamp had its
    /// prerequisite in place, was stamped by its owning role, and earlier
    /// stamps are never overwritten
    #[test]
    fn prop_custody_stamps_are_ordered_and_write_once(
        attempts in custody_attempts_strategy(),
        crosscheck_failed in any::<bool>(),
    ) {
        let crosscheck = if crosscheck_failed {
            CrosscheckStatus::Failed
        } else {
            CrosscheckStatus::Pending
        };
        let mut timeline = CustodyTimeline::new();
        let mut accepted: Vec<(CustodyEvent, TimeStamp)> = Vec::new();

        for (step, (event, verdict)) in attempts.into_iter().enumerate() {
            let at = TimeStamp::new_with(2025, 1, 1, 0, 0, step as u32).unwrap();
            let already_set = timeline.is_set(event);
            let result = timeline.apply(event, event.role(), at, crosscheck, Some(verdict));

            if already_set {
                prop_assert!(result.is_err());
            }
            if result.is_ok() {
                accepted.push((event, at));
            }
            for (earlier, stamped) in &accepted {
                prop_assert_eq!(timeline.get(*earlier), Some(*stamped));
            }
        }

        if timeline.is_set(CustodyEvent::ScDeliveredToAnalyst) {
            prop_assert_eq!(timeline.intake_passed(), Some(true));
        }
        if timeline.is_set(CustodyEvent::CollectorReturnedToAdmin) {
            prop_assert_eq!(timeline.intake_passed(), Some(false));
        }
        if timeline.is_set(CustodyEvent::AnalystReceived) {
            prop_assert!(timeline.is_set(CustodyEvent::ScDeliveredToAnalyst));
        }
    }

    /// A checkpoint stamped by anyone but its owner is always refused
    #[test]
    fn prop_custody_rejects_foreign_roles(event in event_strategy(), role in role_strategy()) {
        prop_assume!(role != event.role());
        let mut timeline = CustodyTimeline::new();
        let pending = CrosscheckStatus::Pending;
        let result = timeline.apply(event, role, TimeStamp::new(), pending, Some(true));
        prop_assert!(result.is_err());
        prop_assert!(!timeline.is_set(event));
    }

    /// Syncing counters from arbitrary codes never moves a counter backwards
    #[test]
    fn prop_sync_never_regresses(numbers in prop::collection::vec(0u64..5_000, 1..20)) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let allocator = IdAllocator::new(&db, 3, Duration::from_secs(2)).unwrap();

        let mut high = 0;
        for number in numbers {
            let code = format!("BML {number:03}");
            let (prefix, sync) = allocator.sync_counter_from_code(&code).unwrap();
            prop_assert_eq!(prefix, "BML");
            prop_assert!(sync.after >= sync.before);
            high = high.max(number);
            prop_assert_eq!(allocator.current("bml").unwrap(), high);
        }

        let next = allocator.next("BML").unwrap();
        prop_assert_eq!(parse_code(&next).unwrap().1, high + 1);
    }

    /// Classification does not depend on the order parameters were requested
    /// in, and any WGS parameter wins
    #[test]
    fn prop_classification_is_order_independent(
        ids in prop::collection::vec(-5i64..50, 0..12),
    ) {
        let mut reversed = ids.clone();
        reversed.reverse();
        let group = resolve(ids.iter().copied());
        prop_assert_eq!(group, resolve(reversed));

        if ids.iter().any(|id| (12..=15).contains(id)) {
            prop_assert_eq!(group, Some(WorkflowGroup::Wgs));
        }
        if ids.iter().all(|id| *id <= 0 || *id > 40) {
            prop_assert_eq!(group, None);
        }
    }
}

/// Many threads minting codes for one prefix get distinct, gap-free numbers
#[test]
fn concurrent_allocation_is_gap_free() -> anyhow::Result<()> {
    let db = sled::Config::new().temporary(true).open()?;
    let allocator = Arc::new(IdAllocator::new(&db, 3, Duration::from_secs(5))?);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let allocator = Arc::clone(&allocator);
            thread::spawn(move || -> lab_custody::Result<Vec<String>> {
                (0..25).map(|_| allocator.next("bml")).collect()
            })
        })
        .collect();

    let mut numbers = Vec::new();
    for handle in handles {
        let codes = handle.join().expect("allocator thread panicked")?;
        for code in codes {
            numbers.push(parse_code(&code)?.1);
        }
    }

    let unique: HashSet<u64> = numbers.iter().copied().collect();
    assert_eq!(unique.len(), numbers.len());
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=200).collect::<Vec<u64>>());
    assert_eq!(allocator.current("BML")?, 200);
    Ok(())
}

/// Prefixes keep independent counters
#[test]
fn prefixes_do_not_share_counters() -> anyhow::Result<()> {
    let db = sled::Config::new().temporary(true).open()?;
    let allocator = IdAllocator::new(&db, 4, Duration::from_secs(1))?;

    assert_eq!(allocator.next("bml")?, "BML 0001");
    assert_eq!(allocator.next("mic")?, "MIC 0001");
    assert_eq!(allocator.next("b-m-l")?, "BML 0002");
    Ok(())
}
