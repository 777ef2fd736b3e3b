//! Role-gated transition tables for the three status machines
//!
//! Each table lists, per role, which target states that role may move an
//! entity to from a given state. Anything not listed is denied, so a role
//! with no rows (the client) can never change status through a guard.
use std::fmt;

use crate::error::{LimsError, Result};
use crate::sample::{RequestStatus, SampleStatus, TestStatus};
use crate::types::Role;

/// A closed state space that a [`TransitionGuard`] can be built over.
pub trait WorkflowState: Copy + Eq + fmt::Debug + 'static {
    /// Name of the state machine, used in denial messages.
    const MACHINE: &'static str;
    /// Every state in workflow order.
    fn all() -> &'static [Self];
    fn as_str(&self) -> &'static str;
}

/// One row of a table: `role` may move `from` to any of `to`.
pub type Rule<S> = (Role, S, &'static [S]);

#[derive(Debug, Clone, Copy)]
pub struct TransitionGuard<S: 'static> {
    rules: &'static [Rule<S>],
}

impl<S: WorkflowState> TransitionGuard<S> {
    pub const fn new(rules: &'static [Rule<S>]) -> Self {
        Self { rules }
    }

    pub fn can_transition(&self, role: Role, from: S, to: S) -> bool {
        self.rules
            .iter()
            .any(|(r, f, targets)| *r == role && *f == from && targets.contains(&to))
    }

    /// Targets `role` may pick from `from`, for rendering enabled actions.
    pub fn allowed_targets(&self, role: Role, from: S) -> Vec<S> {
        self.rules
            .iter()
            .filter(|(r, f, _)| *r == role && *f == from)
            .flat_map(|(_, _, targets)| targets.iter().copied())
            .collect()
    }

    pub fn all_states(&self) -> &'static [S] {
        S::all()
    }

    /// Roles that own at least one edge in this table.
    pub fn owners(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.rules.iter().map(|(r, _, _)| *r).collect();
        roles.sort();
        roles.dedup();
        roles
    }

    pub fn check(&self, role: Role, from: S, to: S) -> Result<()> {
        if self.can_transition(role, from, to) {
            return Ok(());
        }
        Err(LimsError::denied(
            role,
            format!(
                "move {} from {} to {}",
                S::MACHINE,
                from.as_str(),
                to.as_str()
            ),
        ))
    }
}

const SAMPLE_RULES: &[Rule<SampleStatus>] = &[
    (Role::Admin, SampleStatus::Received, &[SampleStatus::InProgress]),
    (
        Role::SampleCollector,
        SampleStatus::Received,
        &[SampleStatus::InProgress],
    ),
    (
        Role::Analyst,
        SampleStatus::InProgress,
        &[SampleStatus::TestingCompleted],
    ),
    (
        Role::Supervisor,
        SampleStatus::TestingCompleted,
        &[SampleStatus::Verified],
    ),
    (
        Role::QualityManager,
        SampleStatus::Verified,
        &[SampleStatus::Validated],
    ),
    (
        Role::QualityManager,
        SampleStatus::Validated,
        &[SampleStatus::Reported],
    ),
];

pub const SAMPLE_STATUS: TransitionGuard<SampleStatus> = TransitionGuard::new(SAMPLE_RULES);

const REQUEST_RULES: &[Rule<RequestStatus>] = &[
    (
        Role::Admin,
        RequestStatus::Draft,
        &[RequestStatus::ClientSubmitted],
    ),
    (
        Role::Admin,
        RequestStatus::ClientSubmitted,
        &[RequestStatus::Accepted, RequestStatus::Returned],
    ),
    (
        Role::Admin,
        RequestStatus::Returned,
        &[RequestStatus::ClientSubmitted],
    ),
    (
        Role::SampleCollector,
        RequestStatus::Accepted,
        &[RequestStatus::InCollection],
    ),
    (
        Role::SampleCollector,
        RequestStatus::InCollection,
        &[RequestStatus::CollectorSubmitted],
    ),
    (
        Role::Supervisor,
        RequestStatus::CollectorSubmitted,
        &[RequestStatus::Validated, RequestStatus::InCollection],
    ),
];

pub const REQUEST_STATUS: TransitionGuard<RequestStatus> = TransitionGuard::new(REQUEST_RULES);

const TEST_RULES: &[Rule<TestStatus>] = &[
    (Role::Analyst, TestStatus::Draft, &[TestStatus::InProgress]),
    (
        Role::Analyst,
        TestStatus::InProgress,
        &[TestStatus::Measured, TestStatus::Failed],
    ),
    (Role::Supervisor, TestStatus::Measured, &[TestStatus::Verified]),
    (
        Role::QualityManager,
        TestStatus::Verified,
        &[TestStatus::Validated],
    ),
    (Role::Admin, TestStatus::Draft, &[TestStatus::Cancelled]),
];

pub const TEST_STATUS: TransitionGuard<TestStatus> = TransitionGuard::new(TEST_RULES);
