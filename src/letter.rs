//! Letter of Order: pre-generation readiness and dual-signature release
//!
//! Two reviewing roles each flag a sample as approved before a letter may
//! include it. Once generated, the same two roles each sign the letter
//! independently; only then can it go to the client, whose counter-signature
//! precedes the final lock.
use crate::audit::{Snapshot, SnapshotBuilder};
use crate::error::{LimsError, Result};
use crate::guard::WorkflowState;
use crate::store::Record;
use crate::types::{Actor, Blob, EntityKind, Role, TimeStamp};

/// The two roles whose approval and signature a letter needs.
pub const REVIEWERS: [Role; 2] = [Role::Supervisor, Role::QualityManager];

/// Per-sample readiness flags, consumed when a letter is generated.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PreApproval {
    #[n(0)]
    pub sample_id: String,
    #[n(1)]
    pub supervisor_approved: bool,
    #[n(2)]
    pub manager_approved: bool,
    #[n(3)]
    pub consumed_by: Option<String>,
}

impl PreApproval {
    pub fn new(sample_id: String) -> Self {
        Self {
            sample_id,
            supervisor_approved: false,
            manager_approved: false,
            consumed_by: None,
        }
    }

    pub fn ready(&self) -> bool {
        self.supervisor_approved && self.manager_approved
    }

    /// Set the caller's own flag. Returns whether the flag changed.
    pub fn set(&mut self, role: Role, approved: bool) -> Result<bool> {
        if let Some(letter) = &self.consumed_by {
            return Err(LimsError::AlreadyFinalized(format!(
                "pre-approval of {} (included in {letter})",
                self.sample_id
            )));
        }
        let flag = match role {
            Role::Supervisor => &mut self.supervisor_approved,
            Role::QualityManager => &mut self.manager_approved,
            other => return Err(LimsError::denied(other, "pre-approve a sample")),
        };
        let changed = *flag != approved;
        *flag = approved;
        Ok(changed)
    }

    pub fn consume(&mut self, letter_id: &str) -> Result<()> {
        if !self.ready() {
            return Err(LimsError::precondition(format!(
                "sample {} is not ready for a letter of order",
                self.sample_id
            )));
        }
        if let Some(letter) = &self.consumed_by {
            return Err(LimsError::AlreadyFinalized(format!(
                "pre-approval of {} (included in {letter})",
                self.sample_id
            )));
        }
        self.consumed_by = Some(letter_id.to_string());
        Ok(())
    }
}

impl Record for PreApproval {
    const KIND: EntityKind = EntityKind::PreApproval;

    fn id(&self) -> &str {
        &self.sample_id
    }

    fn snapshot(&self) -> Snapshot {
        SnapshotBuilder::new()
            .with("supervisor_approved", self.supervisor_approved)
            .with("manager_approved", self.manager_approved)
            .with("ready", self.ready())
            .with_opt("consumed_by", self.consumed_by.as_ref())
            .build()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LetterStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    SignedInternal,
    #[n(2)]
    SentToClient,
    #[n(3)]
    ClientSigned,
    #[n(4)]
    Locked,
}

impl WorkflowState for LetterStatus {
    const MACHINE: &'static str = "letter of order";

    fn all() -> &'static [Self] {
        &[
            LetterStatus::Draft,
            LetterStatus::SignedInternal,
            LetterStatus::SentToClient,
            LetterStatus::ClientSigned,
            LetterStatus::Locked,
        ]
    }

    fn as_str(&self) -> &'static str {
        match self {
            LetterStatus::Draft => "draft",
            LetterStatus::SignedInternal => "signed_internal",
            LetterStatus::SentToClient => "sent_to_client",
            LetterStatus::ClientSigned => "client_signed",
            LetterStatus::Locked => "locked",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    #[n(0)]
    pub actor: String,
    #[n(1)]
    pub at: TimeStamp,
    #[n(2)]
    pub hash: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LetterOfOrder {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub sample_ids: Vec<String>,
    #[n(2)]
    pub status: LetterStatus,
    #[n(3)]
    pub content: Blob,
    #[n(4)]
    pub supervisor_signature: Option<Signature>,
    #[n(5)]
    pub manager_signature: Option<Signature>,
    #[n(6)]
    pub client_signature: Option<Signature>,
    #[n(7)]
    pub generated_by: String,
    #[n(8)]
    pub generated_at: TimeStamp,
    #[n(9)]
    pub sent_at: Option<TimeStamp>,
    #[n(10)]
    pub locked_at: Option<TimeStamp>,
}

impl LetterOfOrder {
    /// Build a draft letter over `approvals`, every one of which must be ready
    /// and not yet used by another letter.
    pub fn generate(
        id: String,
        actor: &Actor,
        approvals: &[PreApproval],
        content: Blob,
        at: TimeStamp,
    ) -> Result<Self> {
        if actor.role != Role::Admin {
            return Err(LimsError::denied(actor.role, "generate a letter of order"));
        }
        if approvals.is_empty() {
            return Err(LimsError::precondition("a letter of order needs at least one sample"));
        }
        let mut sample_ids = Vec::with_capacity(approvals.len());
        for approval in approvals {
            if !approval.ready() {
                return Err(LimsError::precondition(format!(
                    "sample {} is not ready for a letter of order",
                    approval.sample_id
                )));
            }
            if let Some(letter) = &approval.consumed_by {
                return Err(LimsError::AlreadyFinalized(format!(
                    "pre-approval of {} (included in {letter})",
                    approval.sample_id
                )));
            }
            if !sample_ids.contains(&approval.sample_id) {
                sample_ids.push(approval.sample_id.clone());
            }
        }

        Ok(Self {
            id,
            sample_ids,
            status: LetterStatus::Draft,
            content,
            supervisor_signature: None,
            manager_signature: None,
            client_signature: None,
            generated_by: actor.label(),
            generated_at: at,
            sent_at: None,
            locked_at: None,
        })
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.status == LetterStatus::Locked {
            return Err(LimsError::AlreadyFinalized(format!("letter of order {}", self.id)));
        }
        Ok(())
    }

    fn signature(&self, actor: &Actor, at: TimeStamp) -> Signature {
        let material = format!(
            "{}|{}|{}|{}|{}",
            self.id,
            actor.role,
            actor.label(),
            at,
            self.content.digest()
        );
        Signature {
            actor: actor.label(),
            at,
            hash: sha256::digest(material),
        }
    }

    pub fn internally_signed(&self) -> bool {
        self.supervisor_signature.is_some() && self.manager_signature.is_some()
    }

    /// Swap the letter body. Only before anyone has signed it.
    pub fn replace_content(&mut self, actor: &Actor, content: Blob) -> Result<()> {
        self.ensure_unlocked()?;
        if actor.role != Role::Admin {
            return Err(LimsError::denied(actor.role, "edit a letter of order"));
        }
        if self.status != LetterStatus::Draft
            || self.supervisor_signature.is_some()
            || self.manager_signature.is_some()
        {
            return Err(LimsError::precondition("a signed letter cannot be edited"));
        }
        self.content = content;
        Ok(())
    }

    pub fn sign_internal(&mut self, actor: &Actor, at: TimeStamp) -> Result<()> {
        self.ensure_unlocked()?;
        let signature = self.signature(actor, at);
        let slot = match actor.role {
            Role::Supervisor => &mut self.supervisor_signature,
            Role::QualityManager => &mut self.manager_signature,
            other => return Err(LimsError::denied(other, "sign a letter of order internally")),
        };
        if slot.is_some() {
            return Err(LimsError::precondition(format!(
                "{} has already signed letter {}",
                actor.role, self.id
            )));
        }
        *slot = Some(signature);
        if self.internally_signed() {
            self.status = LetterStatus::SignedInternal;
        }
        Ok(())
    }

    pub fn send_to_client(&mut self, actor: &Actor, at: TimeStamp) -> Result<()> {
        self.ensure_unlocked()?;
        if actor.role != Role::Admin {
            return Err(LimsError::denied(actor.role, "send a letter of order"));
        }
        if !self.internally_signed() || self.status != LetterStatus::SignedInternal {
            return Err(LimsError::precondition(
                "both internal signatures are required before sending",
            ));
        }
        self.status = LetterStatus::SentToClient;
        self.sent_at = Some(at);
        Ok(())
    }

    pub fn client_sign(&mut self, actor: &Actor, at: TimeStamp) -> Result<()> {
        self.ensure_unlocked()?;
        if actor.role != Role::Client {
            return Err(LimsError::denied(actor.role, "counter-sign for the client"));
        }
        if self.status != LetterStatus::SentToClient {
            return Err(LimsError::precondition(
                "the letter must be sent to the client before it is counter-signed",
            ));
        }
        self.client_signature = Some(self.signature(actor, at));
        self.status = LetterStatus::ClientSigned;
        Ok(())
    }

    pub fn lock(&mut self, actor: &Actor, at: TimeStamp) -> Result<()> {
        self.ensure_unlocked()?;
        if actor.role != Role::Admin {
            return Err(LimsError::denied(actor.role, "lock a letter of order"));
        }
        if self.status != LetterStatus::ClientSigned {
            return Err(LimsError::precondition(
                "only a client-signed letter can be locked",
            ));
        }
        self.status = LetterStatus::Locked;
        self.locked_at = Some(at);
        Ok(())
    }
}

fn signature_fields(
    builder: SnapshotBuilder,
    slot: &str,
    signature: &Option<Signature>,
) -> SnapshotBuilder {
    match signature {
        Some(signature) => builder
            .with(&format!("{slot}_signed_by"), &signature.actor)
            .with(&format!("{slot}_signed_at"), signature.at)
            .with(&format!("{slot}_signature"), &signature.hash),
        None => builder,
    }
}

impl Record for LetterOfOrder {
    const KIND: EntityKind = EntityKind::LetterOfOrder;

    fn id(&self) -> &str {
        &self.id
    }

    fn snapshot(&self) -> Snapshot {
        let builder = SnapshotBuilder::new()
            .with("sample_ids", self.sample_ids.join(","))
            .with("status", self.status.as_str())
            .with("content_digest", self.content.digest())
            .with("generated_by", &self.generated_by)
            .with_opt("sent_at", self.sent_at)
            .with_opt("locked_at", self.locked_at);
        let builder = signature_fields(builder, "supervisor", &self.supervisor_signature);
        let builder = signature_fields(builder, "manager", &self.manager_signature);
        signature_fields(builder, "client", &self.client_signature).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Actor {
        Actor::new("admin_1", Role::Admin)
    }
    fn supervisor() -> Actor {
        Actor::new("sup_1", Role::Supervisor)
    }
    fn manager() -> Actor {
        Actor::new("qm_1", Role::QualityManager)
    }
    fn client() -> Actor {
        Actor::new("client_1", Role::Client)
    }

    fn ready(sample_id: &str) -> PreApproval {
        let mut approval = PreApproval::new(sample_id.into());
        approval.set(Role::QualityManager, true).unwrap();
        approval.set(Role::Supervisor, true).unwrap();
        approval
    }

    fn draft() -> LetterOfOrder {
        LetterOfOrder::generate(
            "loo1".into(),
            &admin(),
            &[ready("s1"), ready("s2")],
            Blob::new(b"order".to_vec()),
            TimeStamp::new(),
        )
        .unwrap()
    }

    #[test]
    fn readiness_needs_both_flags_in_any_order() {
        let mut a = PreApproval::new("s1".into());
        assert!(a.set(Role::Supervisor, true).unwrap());
        assert!(!a.ready());
        assert!(a.set(Role::QualityManager, true).unwrap());
        assert!(a.ready());
        assert!(a.set(Role::Supervisor, false).unwrap());
        assert!(!a.ready());
        assert!(!a.set(Role::Supervisor, false).unwrap());
    }

    #[test]
    fn only_reviewers_hold_flags() {
        let mut a = PreApproval::new("s1".into());
        assert!(matches!(
            a.set(Role::Admin, true),
            Err(LimsError::PolicyDenied { .. })
        ));
    }

    #[test]
    fn consumed_flags_are_frozen() {
        let mut a = ready("s1");
        a.consume("loo1").unwrap();
        assert!(matches!(
            a.set(Role::Supervisor, false),
            Err(LimsError::AlreadyFinalized(_))
        ));
    }

    #[test]
    fn generation_rejects_unready_samples() {
        let mut half = PreApproval::new("s3".into());
        half.set(Role::Supervisor, true).unwrap();
        let err = LetterOfOrder::generate(
            "loo1".into(),
            &admin(),
            &[ready("s1"), half],
            Blob::default(),
            TimeStamp::new(),
        )
        .unwrap_err();
        assert!(matches!(err, LimsError::PreconditionFailed(_)));
    }

    #[test]
    fn internal_signatures_are_order_independent() {
        let mut letter = draft();
        letter.sign_internal(&manager(), TimeStamp::new()).unwrap();
        assert_eq!(letter.status, LetterStatus::Draft);
        letter.sign_internal(&supervisor(), TimeStamp::new()).unwrap();
        assert_eq!(letter.status, LetterStatus::SignedInternal);
    }

    #[test]
    fn signing_twice_is_rejected() {
        let mut letter = draft();
        letter.sign_internal(&supervisor(), TimeStamp::new()).unwrap();
        let before = letter.clone();
        assert!(letter.sign_internal(&supervisor(), TimeStamp::new()).is_err());
        assert_eq!(letter, before);
    }

    #[test]
    fn wrong_role_cannot_fill_a_slot() {
        let mut letter = draft();
        let before = letter.clone();
        assert!(matches!(
            letter.sign_internal(&admin(), TimeStamp::new()),
            Err(LimsError::PolicyDenied { .. })
        ));
        assert!(matches!(
            letter.client_sign(&supervisor(), TimeStamp::new()),
            Err(LimsError::PolicyDenied { .. })
        ));
        assert_eq!(letter, before);
    }

    #[test]
    fn sending_needs_both_signatures() {
        let mut letter = draft();
        letter.sign_internal(&supervisor(), TimeStamp::new()).unwrap();
        assert!(letter.send_to_client(&admin(), TimeStamp::new()).is_err());
        letter.sign_internal(&manager(), TimeStamp::new()).unwrap();
        letter.send_to_client(&admin(), TimeStamp::new()).unwrap();
        assert_eq!(letter.status, LetterStatus::SentToClient);
    }

    #[test]
    fn client_cannot_sign_before_sending() {
        let mut letter = draft();
        assert!(letter.client_sign(&client(), TimeStamp::new()).is_err());
    }

    #[test]
    fn locked_letter_rejects_everything() {
        let mut letter = draft();
        letter.sign_internal(&supervisor(), TimeStamp::new()).unwrap();
        letter.sign_internal(&manager(), TimeStamp::new()).unwrap();
        letter.send_to_client(&admin(), TimeStamp::new()).unwrap();
        letter.client_sign(&client(), TimeStamp::new()).unwrap();
        letter.lock(&admin(), TimeStamp::new()).unwrap();

        let before = letter.clone();
        for result in [
            letter.sign_internal(&supervisor(), TimeStamp::new()),
            letter.client_sign(&client(), TimeStamp::new()),
            letter.replace_content(&admin(), Blob::new(b"x".to_vec())),
            letter.lock(&admin(), TimeStamp::new()),
        ] {
            assert!(matches!(result, Err(LimsError::AlreadyFinalized(_))));
        }
        assert_eq!(letter, before);
    }

    #[test]
    fn signature_hash_covers_content() {
        let mut a = draft();
        let mut b = draft();
        b.replace_content(&admin(), Blob::new(b"other".to_vec())).unwrap();
        let at = TimeStamp::new_with(2025, 3, 1, 12, 0, 0).unwrap();
        a.sign_internal(&supervisor(), at).unwrap();
        b.sign_internal(&supervisor(), at).unwrap();
        assert_ne!(
            a.supervisor_signature.unwrap().hash,
            b.supervisor_signature.unwrap().hash
        );
    }
}
