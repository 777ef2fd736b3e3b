//! Quality cover sheet review: checker, then first and second reviewer
//!
//! `draft -> submitted -> verified -> validated`. Either reviewer may send a
//! submitted or verified cover back with a reason, which leaves it
//! `rejected` and editable until the checker submits it again.
use crate::audit::{Snapshot, SnapshotBuilder};
use crate::error::{LimsError, Result};
use crate::guard::WorkflowState;
use crate::store::Record;
use crate::types::{Actor, Blob, EntityKind, Role, TimeStamp};

pub const CHECKER: Role = Role::Analyst;
pub const FIRST_REVIEWER: Role = Role::Supervisor;
pub const SECOND_REVIEWER: Role = Role::QualityManager;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoverStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Submitted,
    #[n(2)]
    Verified,
    #[n(3)]
    Validated,
    #[n(4)]
    Rejected,
}

impl WorkflowState for CoverStatus {
    const MACHINE: &'static str = "quality cover";

    fn all() -> &'static [Self] {
        &[
            CoverStatus::Draft,
            CoverStatus::Submitted,
            CoverStatus::Verified,
            CoverStatus::Validated,
            CoverStatus::Rejected,
        ]
    }

    fn as_str(&self) -> &'static str {
        match self {
            CoverStatus::Draft => "draft",
            CoverStatus::Submitted => "submitted",
            CoverStatus::Verified => "verified",
            CoverStatus::Validated => "validated",
            CoverStatus::Rejected => "rejected",
        }
    }
}

impl CoverStatus {
    pub fn is_editable(&self) -> bool {
        matches!(self, CoverStatus::Draft | CoverStatus::Rejected)
    }
}

/// Who did something to the cover, and when.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    #[n(0)]
    pub actor: String,
    #[n(1)]
    pub at: TimeStamp,
}

impl Stamp {
    fn by(actor: &Actor, at: TimeStamp) -> Self {
        Self {
            actor: actor.label(),
            at,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct QualityCover {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub sample_id: String,
    #[n(2)]
    pub status: CoverStatus,
    #[n(3)]
    pub method_of_analysis: Option<String>,
    #[n(4)]
    pub payload: Blob,
    #[n(5)]
    pub checked: Option<Stamp>,
    #[n(6)]
    pub verified: Option<Stamp>,
    #[n(7)]
    pub validated: Option<Stamp>,
    #[n(8)]
    pub rejected: Option<Stamp>,
    #[n(9)]
    pub reject_reason: Option<String>,
}

impl QualityCover {
    pub fn new(id: String, sample_id: String) -> Self {
        Self {
            id,
            sample_id,
            status: CoverStatus::Draft,
            method_of_analysis: None,
            payload: Blob::default(),
            checked: None,
            verified: None,
            validated: None,
            rejected: None,
            reject_reason: None,
        }
    }

    fn require_role(actor: &Actor, allowed: &[Role], action: &str) -> Result<()> {
        if allowed.contains(&actor.role) {
            return Ok(());
        }
        Err(LimsError::denied(actor.role, format!("{action} a quality cover")))
    }

    fn require_status(&self, allowed: &[CoverStatus], action: &str) -> Result<()> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        Err(LimsError::precondition(format!(
            "cannot {action} a {} quality cover",
            self.status.as_str()
        )))
    }

    /// Replace the measurement content. Only while draft or rejected.
    pub fn edit(
        &mut self,
        actor: &Actor,
        method_of_analysis: Option<String>,
        payload: Blob,
    ) -> Result<()> {
        Self::require_role(actor, &[CHECKER], "edit")?;
        self.require_status(&[CoverStatus::Draft, CoverStatus::Rejected], "edit")?;
        self.method_of_analysis = method_of_analysis
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());
        self.payload = payload;
        Ok(())
    }

    pub fn submit(&mut self, actor: &Actor, at: TimeStamp) -> Result<()> {
        Self::require_role(actor, &[CHECKER], "submit")?;
        self.require_status(&[CoverStatus::Draft, CoverStatus::Rejected], "submit")?;
        if self.method_of_analysis.is_none() {
            return Err(LimsError::precondition("a method of analysis is required"));
        }
        if self.payload.is_empty() {
            return Err(LimsError::precondition("the measurement payload is empty"));
        }
        self.status = CoverStatus::Submitted;
        self.checked = Some(Stamp::by(actor, at));
        self.verified = None;
        self.rejected = None;
        self.reject_reason = None;
        Ok(())
    }

    pub fn verify(&mut self, actor: &Actor, at: TimeStamp) -> Result<()> {
        Self::require_role(actor, &[FIRST_REVIEWER], "verify")?;
        self.require_status(&[CoverStatus::Submitted], "verify")?;
        self.status = CoverStatus::Verified;
        self.verified = Some(Stamp::by(actor, at));
        Ok(())
    }

    pub fn validate(&mut self, actor: &Actor, at: TimeStamp) -> Result<()> {
        Self::require_role(actor, &[SECOND_REVIEWER], "validate")?;
        self.require_status(&[CoverStatus::Verified], "validate")?;
        if self.verified.is_none() {
            return Err(LimsError::precondition("cover was never verified"));
        }
        self.status = CoverStatus::Validated;
        self.validated = Some(Stamp::by(actor, at));
        Ok(())
    }

    pub fn reject(&mut self, actor: &Actor, reason: &str, at: TimeStamp) -> Result<()> {
        Self::require_role(actor, &[FIRST_REVIEWER, SECOND_REVIEWER], "reject")?;
        self.require_status(&[CoverStatus::Submitted, CoverStatus::Verified], "reject")?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LimsError::precondition("a reject reason is required"));
        }
        self.status = CoverStatus::Rejected;
        self.rejected = Some(Stamp::by(actor, at));
        self.reject_reason = Some(reason.to_string());
        Ok(())
    }
}

fn stamp_fields(builder: SnapshotBuilder, name: &str, stamp: &Option<Stamp>) -> SnapshotBuilder {
    match stamp {
        Some(stamp) => builder
            .with(&format!("{name}_by"), &stamp.actor)
            .with(&format!("{name}_at"), stamp.at),
        None => builder,
    }
}

impl Record for QualityCover {
    const KIND: EntityKind = EntityKind::QualityCover;

    fn id(&self) -> &str {
        &self.id
    }

    fn snapshot(&self) -> Snapshot {
        let builder = SnapshotBuilder::new()
            .with("sample_id", &self.sample_id)
            .with("status", self.status.as_str())
            .with_opt("method_of_analysis", self.method_of_analysis.as_ref())
            .with("payload_digest", self.payload.digest())
            .with_opt("reject_reason", self.reject_reason.as_ref());
        let builder = stamp_fields(builder, "checked", &self.checked);
        let builder = stamp_fields(builder, "verified", &self.verified);
        let builder = stamp_fields(builder, "validated", &self.validated);
        stamp_fields(builder, "rejected", &self.rejected).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyst() -> Actor {
        Actor::new("analyst_1", Role::Analyst)
    }
    fn supervisor() -> Actor {
        Actor::new("sup_1", Role::Supervisor)
    }
    fn manager() -> Actor {
        Actor::new("qm_1", Role::QualityManager)
    }

    fn submitted() -> QualityCover {
        let mut cover = QualityCover::new("cover1".into(), "sample1".into());
        cover
            .edit(&analyst(), Some("ISO 6579".into()), Blob::new(b"{\"od\":0.42}".to_vec()))
            .unwrap();
        cover.submit(&analyst(), TimeStamp::new()).unwrap();
        cover
    }

    #[test]
    fn submit_needs_method_and_payload() {
        let mut cover = QualityCover::new("cover1".into(), "sample1".into());
        assert!(cover.submit(&analyst(), TimeStamp::new()).is_err());
        cover.edit(&analyst(), Some("  ".into()), Blob::new(b"x".to_vec())).unwrap();
        assert!(cover.submit(&analyst(), TimeStamp::new()).is_err());
        cover.edit(&analyst(), Some("PCR".into()), Blob::default()).unwrap();
        assert!(cover.submit(&analyst(), TimeStamp::new()).is_err());
    }

    #[test]
    fn validate_requires_prior_verification() {
        let mut cover = submitted();
        let err = cover.validate(&manager(), TimeStamp::new()).unwrap_err();
        assert!(matches!(err, LimsError::PreconditionFailed(_)));

        cover.verify(&supervisor(), TimeStamp::new()).unwrap();
        cover.validate(&manager(), TimeStamp::new()).unwrap();
        assert_eq!(cover.status, CoverStatus::Validated);
    }

    #[test]
    fn reviewers_are_role_gated() {
        let mut cover = submitted();
        let err = cover.verify(&manager(), TimeStamp::new()).unwrap_err();
        assert!(matches!(err, LimsError::PolicyDenied { .. }));
        assert_eq!(cover.status, CoverStatus::Submitted);
    }

    #[test]
    fn reject_needs_reason_and_reopens() {
        let mut cover = submitted();
        assert!(cover.reject(&supervisor(), "   ", TimeStamp::new()).is_err());
        assert_eq!(cover.status, CoverStatus::Submitted);

        cover
            .reject(&supervisor(), "bad calibration", TimeStamp::new())
            .unwrap();
        assert!(cover.status.is_editable());
        assert_eq!(cover.reject_reason.as_deref(), Some("bad calibration"));

        cover
            .edit(&analyst(), Some("ISO 6579".into()), Blob::new(b"{\"od\":0.40}".to_vec()))
            .unwrap();
        cover.submit(&analyst(), TimeStamp::new()).unwrap();
        assert_eq!(cover.reject_reason, None);
    }

    #[test]
    fn verified_cover_can_be_rejected_by_second_reviewer() {
        let mut cover = submitted();
        cover.verify(&supervisor(), TimeStamp::new()).unwrap();
        cover.reject(&manager(), "wrong unit", TimeStamp::new()).unwrap();
        assert_eq!(cover.status, CoverStatus::Rejected);
        assert!(cover.validate(&manager(), TimeStamp::new()).is_err());
    }

    #[test]
    fn validated_cover_is_closed() {
        let mut cover = submitted();
        cover.verify(&supervisor(), TimeStamp::new()).unwrap();
        cover.validate(&manager(), TimeStamp::new()).unwrap();
        assert!(cover.reject(&manager(), "late", TimeStamp::new()).is_err());
        assert!(cover.edit(&analyst(), None, Blob::default()).is_err());
    }
}
