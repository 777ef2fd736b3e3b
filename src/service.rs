//! Service layer API for sample custody and approval operations
//!
//! Every mutating call follows the same path: load the entity, ask the
//! relevant guard, sequencer or pipeline whether the change is legal, then
//! write it back together with one audit record in a single transaction.
//! A change that leaves the entity as it was writes nothing.
use std::sync::Arc;

use crate::allocator::{CounterSync, IdAllocator};
use crate::audit::{AuditTrail, SnapshotBuilder};
use crate::config::LimsConfig;
use crate::custody::{self, CustodyEvent};
use crate::error::{LimsError, Result};
use crate::guard::{REQUEST_STATUS, SAMPLE_STATUS, TEST_STATUS};
use crate::letter::{LetterOfOrder, PreApproval, REVIEWERS};
use crate::quality::QualityCover;
use crate::sample::{RequestStatus, Sample, SampleStatus, SampleTest, TestStatus};
use crate::store::{Record, Store, Updated};
use crate::types::{Actor, Blob, EntityKind, Role, TimeStamp};
use crate::utils::new_uuid_to_bech32;

/// Renders the report for a sample once its quality cover is validated.
pub trait DocumentGenerator: Send + Sync {
    /// Returns the identifier of the generated document.
    fn generate(&self, sample_id: &str) -> anyhow::Result<String>;
}

/// New state of the entity plus the audit record it produced, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub state: T,
    pub audit_id: Option<u64>,
}

/// Result of validating a quality cover. The validation stands even when the
/// document could not be generated.
#[derive(Debug)]
pub struct ValidatedCover {
    pub cover: QualityCover,
    pub audit_id: Option<u64>,
    pub document: Result<String>,
}

pub struct LabService {
    store: Store,
    audit: AuditTrail,
    allocator: IdAllocator,
    documents: Arc<dyn DocumentGenerator>,
}

fn mint_id(hrp: &str) -> Result<String> {
    new_uuid_to_bech32(hrp).map_err(|e| LimsError::InvalidInput(e.to_string()))
}

fn require_role(actor: &Actor, allowed: &[Role], action: &str) -> Result<()> {
    if allowed.contains(&actor.role) {
        return Ok(());
    }
    Err(LimsError::denied(actor.role, action))
}

impl LabService {
    pub fn new(
        store: Store,
        config: &LimsConfig,
        documents: Arc<dyn DocumentGenerator>,
    ) -> Result<Self> {
        let audit = AuditTrail::new(store.db().clone(), config.audit_action_max_len)?;
        let allocator = IdAllocator::new(store.db(), config.code_width, config.lock_timeout())?;
        Ok(Self {
            store,
            audit,
            allocator,
            documents,
        })
    }

    /// Open the database named in `config`.
    pub fn open(config: &LimsConfig, documents: Arc<dyn DocumentGenerator>) -> Result<Self> {
        Self::new(Store::open(&config.db_path)?, config, documents)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn allocator(&self) -> &IdAllocator {
        &self.allocator
    }

    fn create<T: Record>(&self, actor: &Actor, record: T, action: &str) -> Result<Outcome<T>> {
        let pending = self.audit.pending(actor, T::KIND, Some(record.id()), action);
        let audit_id = self.store.insert(&record, &pending)?;
        tracing::info!(
            kind = %T::KIND,
            id = record.id(),
            action,
            actor = %actor.label(),
            "created"
        );
        Ok(Outcome {
            state: record,
            audit_id,
        })
    }

    fn commit<T, R>(
        &self,
        actor: &Actor,
        id: &str,
        action: &str,
        apply: impl FnMut(&mut T) -> Result<R>,
    ) -> Result<Updated<T, R>>
    where
        T: Record + Clone,
    {
        let span = tracing::info_span!("mutation", kind = %T::KIND, id, action, role = %actor.role);
        let _entered = span.enter();

        let pending = self.audit.pending(actor, T::KIND, Some(id), action);
        let updated = match self.store.update(id, &pending, apply) {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!(error = %e, "mutation refused");
                return Err(e);
            }
        };
        if updated.changed {
            tracing::info!(audit_id = ?updated.audit_id, actor = %actor.label(), "applied");
        } else {
            tracing::debug!(actor = %actor.label(), "nothing to change");
        }
        Ok(updated)
    }

    fn commit_state<T: Record + Clone>(
        &self,
        actor: &Actor,
        id: &str,
        action: &str,
        apply: impl FnMut(&mut T) -> Result<()>,
    ) -> Result<Outcome<T>> {
        let updated = self.commit(actor, id, action, apply)?;
        Ok(Outcome {
            state: updated.after,
            audit_id: updated.audit_id,
        })
    }

    pub fn sample(&self, id: &str) -> Result<Sample> {
        self.store.load(id)
    }

    pub fn sample_test(&self, id: &str) -> Result<SampleTest> {
        self.store.load(id)
    }

    pub fn tests_for(&self, sample_id: &str) -> Result<Vec<SampleTest>> {
        self.store.scan(|t: &SampleTest| t.sample_id == sample_id)
    }

    pub fn quality_cover(&self, id: &str) -> Result<QualityCover> {
        self.store.load(id)
    }

    pub fn letter(&self, id: &str) -> Result<LetterOfOrder> {
        self.store.load(id)
    }

    /// Readiness flags for a sample. A sample nobody has flagged yet reads as
    /// a fresh, unapproved record.
    pub fn pre_approval(&self, sample_id: &str) -> Result<PreApproval> {
        self.sample(sample_id)?;
        Ok(self
            .store
            .get(sample_id)?
            .unwrap_or_else(|| PreApproval::new(sample_id.to_string())))
    }

    /// Custody checkpoints `actor` could stamp on the sample right now.
    pub fn available_custody_events(
        &self,
        actor: &Actor,
        sample_id: &str,
    ) -> Result<Vec<CustodyEvent>> {
        let sample = self.sample(sample_id)?;
        if sample.lab_code.is_some() {
            return Ok(Vec::new());
        }
        Ok(sample
            .custody
            .available(actor.role, sample.crosscheck_status))
    }

    pub fn register_sample(
        &self,
        actor: &Actor,
        client_id: &str,
        sample_code: &str,
        parameter_ids: Vec<u32>,
    ) -> Result<Outcome<Sample>> {
        require_role(actor, &[Role::Admin], "register a sample")?;
        let sample_code = sample_code.trim();
        if sample_code.is_empty() {
            return Err(LimsError::InvalidInput("sample code is empty".into()));
        }
        let sample = Sample::new(
            mint_id("sample")?,
            client_id.to_string(),
            actor.label(),
            sample_code.to_string(),
            parameter_ids,
        );
        self.create(actor, sample, "register_sample")
    }

    pub fn add_test(
        &self,
        actor: &Actor,
        sample_id: &str,
        parameter_id: u32,
        assignee_id: Option<String>,
    ) -> Result<Outcome<SampleTest>> {
        require_role(actor, &[Role::Admin], "add a sample test")?;
        let sample = self.sample(sample_id)?;
        sample.ensure_open()?;
        if !sample.parameter_ids.contains(&parameter_id) {
            return Err(LimsError::precondition(format!(
                "parameter {parameter_id} was not requested for sample {sample_id}"
            )));
        }
        let test = SampleTest::new(mint_id("test")?, sample.id, parameter_id, assignee_id);
        self.create(actor, test, "add_test")
    }

    pub fn transition_request(
        &self,
        actor: &Actor,
        sample_id: &str,
        target: RequestStatus,
    ) -> Result<Outcome<Sample>> {
        self.commit_state(actor, sample_id, "request_status", |s: &mut Sample| {
            s.ensure_open()?;
            REQUEST_STATUS.check(actor.role, s.request_status, target)?;
            s.request_status = target;
            Ok(())
        })
    }

    pub fn transition_sample(
        &self,
        actor: &Actor,
        sample_id: &str,
        target: SampleStatus,
    ) -> Result<Outcome<Sample>> {
        let tests = if target == SampleStatus::TestingCompleted {
            self.tests_for(sample_id)?
        } else {
            Vec::new()
        };

        self.commit_state(actor, sample_id, "sample_status", |s: &mut Sample| {
            SAMPLE_STATUS.check(actor.role, s.detailed_status, target)?;
            if s.detailed_status == SampleStatus::Received {
                if s.lab_code.is_none() {
                    return Err(LimsError::precondition(
                        "analysis starts after a lab code is assigned",
                    ));
                }
                if !s.custody.is_set(CustodyEvent::AnalystReceived) {
                    return Err(LimsError::precondition("the analyst has not received the sample"));
                }
            }
            if target == SampleStatus::TestingCompleted
                && (tests.is_empty() || tests.iter().any(|t| !t.status.is_settled()))
            {
                return Err(LimsError::precondition("tests are still outstanding"));
            }
            s.detailed_status = target;
            Ok(())
        })
    }

    pub fn transition_test(
        &self,
        actor: &Actor,
        test_id: &str,
        target: TestStatus,
    ) -> Result<Outcome<SampleTest>> {
        self.commit_state(actor, test_id, "test_status", |t: &mut SampleTest| {
            TEST_STATUS.check(actor.role, t.status, target)?;
            let assignee = t.assignee_id.as_deref();
            let foreign = assignee.is_some() && actor.resolved_id() != assignee;
            if actor.role == Role::Analyst && foreign {
                return Err(LimsError::denied(actor.role, "work a test assigned to someone else"));
            }
            t.status = target;
            Ok(())
        })
    }

    /// Stamp one custody checkpoint. `intake_passed` carries the collector's
    /// verdict for `collector_intake_completed` and is ignored otherwise.
    pub fn apply_custody_event(
        &self,
        actor: &Actor,
        sample_id: &str,
        event: CustodyEvent,
        intake_passed: Option<bool>,
    ) -> Result<Outcome<Sample>> {
        let action = format!("custody:{event}");
        self.commit_state(actor, sample_id, &action, |s: &mut Sample| {
            s.ensure_open()?;
            let crosscheck = s.crosscheck_status;
            s.custody
                .apply(event, actor.role, TimeStamp::new(), crosscheck, intake_passed)
        })
    }

    /// Compare the label the analyst reads off the container with the code
    /// recorded at intake.
    pub fn crosscheck(
        &self,
        actor: &Actor,
        sample_id: &str,
        entered_code: &str,
        note: Option<&str>,
    ) -> Result<Outcome<Sample>> {
        require_role(actor, &[Role::Analyst], "crosscheck a sample label")?;
        self.commit_state(actor, sample_id, "crosscheck", |s: &mut Sample| {
            s.ensure_open()?;
            if !s.custody.is_set(CustodyEvent::AnalystReceived) {
                return Err(LimsError::precondition("the analyst has not received the sample"));
            }
            if s.custody.is_set(CustodyEvent::AnalystReturnedToSc) {
                return Err(LimsError::precondition("the sample was returned to the collector"));
            }
            if s.crosscheck_status == custody::CrosscheckStatus::Passed {
                return Err(LimsError::precondition("the crosscheck has already passed"));
            }
            let outcome = custody::crosscheck(&s.sample_code, entered_code, note)?;
            s.crosscheck_status = outcome.status;
            s.crosscheck_note = outcome.note;
            Ok(())
        })
    }

    /// Derive the workflow group from the requested parameters. Already
    /// classified or unclassifiable samples come back unchanged, unaudited.
    pub fn classify_sample(&self, actor: &Actor, sample_id: &str) -> Result<Outcome<Sample>> {
        if actor.role == Role::Client {
            return Err(LimsError::denied(actor.role, "classify a sample"));
        }
        self.commit_state(actor, sample_id, "classify", |s: &mut Sample| {
            s.derive_workflow_group();
            Ok(())
        })
    }

    /// Mint the sample's lab code. After this the sample's custody and intake
    /// history is frozen. A sample that turns out not to be ready once the
    /// code is minted gives the number back.
    pub fn assign_lab_code(
        &self,
        actor: &Actor,
        sample_id: &str,
        prefix: &str,
    ) -> Result<Outcome<Sample>> {
        require_role(actor, &[Role::Admin], "assign a lab code")?;
        let ready = |s: &Sample| -> Result<()> {
            s.ensure_open()?;
            if s.request_status != RequestStatus::Validated {
                return Err(LimsError::precondition("the intake request is not validated"));
            }
            if s.crosscheck_status != custody::CrosscheckStatus::Passed {
                return Err(LimsError::precondition("the label crosscheck has not passed"));
            }
            Ok(())
        };
        ready(&self.sample(sample_id)?)?;

        self.allocator.next_with(prefix, |code| {
            self.commit_state(actor, sample_id, "assign_lab_code", |s: &mut Sample| {
                ready(&*s)?;
                s.lab_code = Some(code.to_string());
                Ok(())
            })
        })
    }

    /// Reconcile a counter with a code issued outside the allocator. Only an
    /// advance is audited, and the counter stays put if that record cannot be
    /// written.
    pub fn sync_counter_from_code(
        &self,
        actor: &Actor,
        code: &str,
    ) -> Result<Outcome<CounterSync>> {
        require_role(actor, &[Role::Admin], "reconcile a lab code counter")?;
        let (prefix, sync, audit_id) = self.allocator.sync_counter_with(code, |prefix, sync| {
            self.audit.record(
                actor,
                EntityKind::Counter,
                Some(prefix),
                "sync_counter",
                &SnapshotBuilder::new().with("last_number", sync.before).build(),
                &SnapshotBuilder::new().with("last_number", sync.after).build(),
            )
        })?;
        if sync.advanced() {
            tracing::info!(%prefix, before = sync.before, after = sync.after, "counter advanced");
        }
        Ok(Outcome {
            state: sync,
            audit_id: audit_id.flatten(),
        })
    }

    pub fn open_cover(&self, actor: &Actor, sample_id: &str) -> Result<Outcome<QualityCover>> {
        require_role(actor, &[crate::quality::CHECKER], "open a quality cover")?;
        let sample = self.sample(sample_id)?;
        let cover = QualityCover::new(mint_id("cover")?, sample.id);
        self.create(actor, cover, "open_cover")
    }

    pub fn edit_cover(
        &self,
        actor: &Actor,
        cover_id: &str,
        method_of_analysis: Option<String>,
        payload: Blob,
    ) -> Result<Outcome<QualityCover>> {
        self.commit_state(actor, cover_id, "edit_cover", |c: &mut QualityCover| {
            c.edit(actor, method_of_analysis.clone(), payload.clone())
        })
    }

    pub fn submit_cover(&self, actor: &Actor, cover_id: &str) -> Result<Outcome<QualityCover>> {
        self.commit_state(actor, cover_id, "submit_cover", |c: &mut QualityCover| {
            c.submit(actor, TimeStamp::new())
        })
    }

    pub fn verify_cover(&self, actor: &Actor, cover_id: &str) -> Result<Outcome<QualityCover>> {
        self.commit_state(actor, cover_id, "verify_cover", |c: &mut QualityCover| {
            c.verify(actor, TimeStamp::new())
        })
    }

    /// Validate the cover and hand the sample to document generation. A
    /// generator failure is reported in the result and leaves the validation
    /// in place.
    pub fn validate_cover(&self, actor: &Actor, cover_id: &str) -> Result<ValidatedCover> {
        let outcome = self.commit_state(actor, cover_id, "validate_cover", |c: &mut QualityCover| {
            c.validate(actor, TimeStamp::new())
        })?;

        let document = self
            .documents
            .generate(&outcome.state.sample_id)
            .map_err(|e| LimsError::Generation(e.to_string()));
        match &document {
            Ok(document_id) => tracing::info!(cover_id, %document_id, "document generated"),
            Err(e) => tracing::error!(cover_id, error = %e, "document generation failed"),
        }

        Ok(ValidatedCover {
            cover: outcome.state,
            audit_id: outcome.audit_id,
            document,
        })
    }

    pub fn reject_cover(
        &self,
        actor: &Actor,
        cover_id: &str,
        reason: &str,
    ) -> Result<Outcome<QualityCover>> {
        self.commit_state(actor, cover_id, "reject_cover", |c: &mut QualityCover| {
            c.reject(actor, reason, TimeStamp::new())
        })
    }

    /// Set the caller's readiness flag for a sample. Setting a flag to the
    /// value it already has changes nothing and writes no audit record.
    pub fn set_pre_approval(
        &self,
        actor: &Actor,
        sample_id: &str,
        approved: bool,
    ) -> Result<Outcome<PreApproval>> {
        require_role(actor, &REVIEWERS, "pre-approve a sample")?;
        self.sample(sample_id)?.ensure_open()?;

        let pending = self
            .audit
            .pending(actor, EntityKind::PreApproval, Some(sample_id), "pre_approval");
        let updated = self.store.update_or_seed(
            sample_id,
            || PreApproval::new(sample_id.to_string()),
            &pending,
            |a: &mut PreApproval| a.set(actor.role, approved),
        )?;
        if updated.changed {
            tracing::info!(sample_id, role = %actor.role, approved, "pre-approval changed");
        }
        Ok(Outcome {
            state: updated.after,
            audit_id: updated.audit_id,
        })
    }

    /// Create a draft letter covering `sample_ids`, all of which must be ready.
    pub fn generate_letter(
        &self,
        actor: &Actor,
        sample_ids: &[String],
        content: Blob,
    ) -> Result<Outcome<LetterOfOrder>> {
        let mut approvals = Vec::with_capacity(sample_ids.len());
        for sample_id in sample_ids {
            let approval = self.pre_approval(sample_id)?;
            approvals.push(approval);
        }
        let letter =
            LetterOfOrder::generate(mint_id("loo")?, actor, &approvals, content, TimeStamp::new())?;

        let letter_id = letter.id.clone();
        let pending = self.audit.pending(
            actor,
            EntityKind::LetterOfOrder,
            Some(&letter_id),
            "generate_letter",
        );
        let (_, audit_id) = self.store.insert_with(
            &letter,
            &letter.sample_ids,
            &pending,
            |a: &mut PreApproval| a.consume(&letter_id),
        )?;
        tracing::info!(
            letter_id = %letter.id,
            samples = letter.sample_ids.len(),
            "letter of order generated"
        );
        Ok(Outcome {
            state: letter,
            audit_id,
        })
    }

    pub fn replace_letter_content(
        &self,
        actor: &Actor,
        letter_id: &str,
        content: Blob,
    ) -> Result<Outcome<LetterOfOrder>> {
        self.commit_state(actor, letter_id, "replace_letter_content", |l: &mut LetterOfOrder| {
            l.replace_content(actor, content.clone())
        })
    }

    pub fn sign_letter_internal(
        &self,
        actor: &Actor,
        letter_id: &str,
    ) -> Result<Outcome<LetterOfOrder>> {
        self.commit_state(actor, letter_id, "sign_internal", |l: &mut LetterOfOrder| {
            l.sign_internal(actor, TimeStamp::new())
        })
    }

    pub fn send_letter_to_client(
        &self,
        actor: &Actor,
        letter_id: &str,
    ) -> Result<Outcome<LetterOfOrder>> {
        self.commit_state(actor, letter_id, "send_to_client", |l: &mut LetterOfOrder| {
            l.send_to_client(actor, TimeStamp::new())
        })
    }

    pub fn client_sign_letter(
        &self,
        actor: &Actor,
        letter_id: &str,
    ) -> Result<Outcome<LetterOfOrder>> {
        self.commit_state(actor, letter_id, "client_sign", |l: &mut LetterOfOrder| {
            l.client_sign(actor, TimeStamp::new())
        })
    }

    pub fn lock_letter(&self, actor: &Actor, letter_id: &str) -> Result<Outcome<LetterOfOrder>> {
        self.commit_state(actor, letter_id, "lock_letter", |l: &mut LetterOfOrder| {
            l.lock(actor, TimeStamp::new())
        })
    }
}
