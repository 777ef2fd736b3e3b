//! Physical custody checkpoints and the label crosscheck
//!
//! Every handoff of a sample between the front office, the sample collector
//! and the analyst is stamped exactly once. A checkpoint may only be stamped
//! by its owning role, after its prerequisite, and never twice.
use std::fmt;
use std::str::FromStr;

use crate::audit::SnapshotBuilder;
use crate::error::{LimsError, Result};
use crate::types::{Role, TimeStamp};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CustodyEvent {
    #[n(0)]
    AdminReceivedFromClient,
    #[n(1)]
    AdminBroughtToCollector,
    #[n(2)]
    CollectorReceived,
    #[n(3)]
    CollectorIntakeCompleted,
    #[n(4)]
    CollectorReturnedToAdmin,
    #[n(5)]
    ScDeliveredToAnalyst,
    #[n(6)]
    AdminReceivedFromCollector,
    #[n(7)]
    ClientPickedUp,
    #[n(8)]
    AnalystReceived,
    #[n(9)]
    AnalystReturnedToSc,
    #[n(10)]
    ScReceivedFromAnalyst,
}

/// What must already be true before a checkpoint may be stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prerequisite {
    First,
    After(CustodyEvent),
    IntakePassed,
    IntakeFailed,
    CrosscheckFailed,
}

impl CustodyEvent {
    pub const ALL: [CustodyEvent; 11] = [
        CustodyEvent::AdminReceivedFromClient,
        CustodyEvent::AdminBroughtToCollector,
        CustodyEvent::CollectorReceived,
        CustodyEvent::CollectorIntakeCompleted,
        CustodyEvent::CollectorReturnedToAdmin,
        CustodyEvent::ScDeliveredToAnalyst,
        CustodyEvent::AdminReceivedFromCollector,
        CustodyEvent::ClientPickedUp,
        CustodyEvent::AnalystReceived,
        CustodyEvent::AnalystReturnedToSc,
        CustodyEvent::ScReceivedFromAnalyst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CustodyEvent::AdminReceivedFromClient => "admin_received_from_client",
            CustodyEvent::AdminBroughtToCollector => "admin_brought_to_collector",
            CustodyEvent::CollectorReceived => "collector_received",
            CustodyEvent::CollectorIntakeCompleted => "collector_intake_completed",
            CustodyEvent::CollectorReturnedToAdmin => "collector_returned_to_admin",
            CustodyEvent::ScDeliveredToAnalyst => "sc_delivered_to_analyst",
            CustodyEvent::AdminReceivedFromCollector => "admin_received_from_collector",
            CustodyEvent::ClientPickedUp => "client_picked_up",
            CustodyEvent::AnalystReceived => "analyst_received",
            CustodyEvent::AnalystReturnedToSc => "analyst_returned_to_sc",
            CustodyEvent::ScReceivedFromAnalyst => "sc_received_from_analyst",
        }
    }

    pub fn role(&self) -> Role {
        match self {
            CustodyEvent::AdminReceivedFromClient
            | CustodyEvent::AdminBroughtToCollector
            | CustodyEvent::AdminReceivedFromCollector
            | CustodyEvent::ClientPickedUp => Role::Admin,
            CustodyEvent::CollectorReceived
            | CustodyEvent::CollectorIntakeCompleted
            | CustodyEvent::CollectorReturnedToAdmin
            | CustodyEvent::ScDeliveredToAnalyst
            | CustodyEvent::ScReceivedFromAnalyst => Role::SampleCollector,
            CustodyEvent::AnalystReceived | CustodyEvent::AnalystReturnedToSc => Role::Analyst,
        }
    }

    pub fn prerequisites(&self) -> &'static [Prerequisite] {
        use CustodyEvent::*;
        use Prerequisite::*;
        match self {
            AdminReceivedFromClient => &[First],
            AdminBroughtToCollector => &[After(AdminReceivedFromClient)],
            CollectorReceived => &[After(AdminBroughtToCollector)],
            CollectorIntakeCompleted => &[After(CollectorReceived)],
            CollectorReturnedToAdmin => &[After(CollectorIntakeCompleted), IntakeFailed],
            ScDeliveredToAnalyst => &[After(CollectorIntakeCompleted), IntakePassed],
            AdminReceivedFromCollector => &[After(CollectorReturnedToAdmin)],
            ClientPickedUp => &[After(AdminReceivedFromCollector)],
            AnalystReceived => &[After(ScDeliveredToAnalyst)],
            AnalystReturnedToSc => &[After(AnalystReceived), CrosscheckFailed],
            ScReceivedFromAnalyst => &[After(AnalystReturnedToSc)],
        }
    }
}

impl fmt::Display for CustodyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CustodyEvent {
    type Err = LimsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        CustodyEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == key)
            .ok_or_else(|| LimsError::InvalidInput(format!("unknown custody event {s:?}")))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrosscheckStatus {
    #[n(0)]
    #[default]
    Pending,
    #[n(1)]
    Passed,
    #[n(2)]
    Failed,
}

impl CrosscheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrosscheckStatus::Pending => "pending",
            CrosscheckStatus::Passed => "passed",
            CrosscheckStatus::Failed => "failed",
        }
    }
}

/// The set of stamped checkpoints for one sample.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Default)]
pub struct CustodyTimeline {
    #[n(0)]
    stamps: Vec<(CustodyEvent, TimeStamp)>,
    #[n(1)]
    intake_passed: Option<bool>,
}

impl CustodyTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event: CustodyEvent) -> Option<TimeStamp> {
        self.stamps
            .iter()
            .find(|(e, _)| *e == event)
            .map(|(_, at)| *at)
    }

    pub fn is_set(&self, event: CustodyEvent) -> bool {
        self.get(event).is_some()
    }

    pub fn intake_passed(&self) -> Option<bool> {
        self.intake_passed
    }

    /// Checkpoints that could be stamped next by `role`, for rendering.
    pub fn available(&self, role: Role, crosscheck: CrosscheckStatus) -> Vec<CustodyEvent> {
        CustodyEvent::ALL
            .into_iter()
            .filter(|event| event.role() == role)
            .filter(|event| self.check(*event, role, crosscheck).is_ok())
            .collect()
    }

    fn check(&self, event: CustodyEvent, role: Role, crosscheck: CrosscheckStatus) -> Result<()> {
        if event.role() != role {
            return Err(LimsError::denied(role, format!("stamp {event}")));
        }
        if self.is_set(event) {
            return Err(LimsError::precondition(format!("{event} is already recorded")));
        }
        for prerequisite in event.prerequisites() {
            let satisfied = match prerequisite {
                Prerequisite::First => true,
                Prerequisite::After(prior) => self.is_set(*prior),
                Prerequisite::IntakePassed => self.intake_passed == Some(true),
                Prerequisite::IntakeFailed => self.intake_passed == Some(false),
                Prerequisite::CrosscheckFailed => crosscheck == CrosscheckStatus::Failed,
            };
            if !satisfied {
                return Err(LimsError::precondition(format!(
                    "{event} requires {}",
                    describe(prerequisite)
                )));
            }
        }
        Ok(())
    }

    /// Stamp `event` at `at`. `intake_passed` is the collector's verdict and is
    /// required for, and only read by, `collector_intake_completed`.
    pub fn apply(
        &mut self,
        event: CustodyEvent,
        role: Role,
        at: TimeStamp,
        crosscheck: CrosscheckStatus,
        intake_passed: Option<bool>,
    ) -> Result<()> {
        self.check(event, role, crosscheck)?;

        if event == CustodyEvent::CollectorIntakeCompleted {
            let Some(passed) = intake_passed else {
                return Err(LimsError::precondition(
                    "intake completion needs a passed/failed verdict",
                ));
            };
            self.intake_passed = Some(passed);
        }
        self.stamps.push((event, at));
        Ok(())
    }

    pub fn write_snapshot(&self, builder: SnapshotBuilder) -> SnapshotBuilder {
        let mut builder = builder.with_opt(
            "intake_passed",
            self.intake_passed.map(|p| if p { "passed" } else { "failed" }),
        );
        for (event, at) in &self.stamps {
            builder = builder.with(event.as_str(), at);
        }
        builder
    }
}

fn describe(prerequisite: &Prerequisite) -> String {
    match prerequisite {
        Prerequisite::First => "nothing".to_string(),
        Prerequisite::After(prior) => format!("{prior} first"),
        Prerequisite::IntakePassed => "a passed intake".to_string(),
        Prerequisite::IntakeFailed => "a failed intake".to_string(),
        Prerequisite::CrosscheckFailed => "a failed crosscheck".to_string(),
    }
}

/// Result of comparing a physically read label against the expected code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrosscheckOutcome {
    pub status: CrosscheckStatus,
    pub note: Option<String>,
}

/// Compare `entered` against `expected`, ignoring case and surrounding
/// whitespace. A mismatch must be explained with a non-empty note.
pub fn crosscheck(expected: &str, entered: &str, note: Option<&str>) -> Result<CrosscheckOutcome> {
    let matches = expected.trim().to_lowercase() == entered.trim().to_lowercase();
    let note = note.map(str::trim).filter(|n| !n.is_empty()).map(String::from);

    if matches {
        return Ok(CrosscheckOutcome {
            status: CrosscheckStatus::Passed,
            note,
        });
    }
    match note {
        Some(note) => Ok(CrosscheckOutcome {
            status: CrosscheckStatus::Failed,
            note: Some(note),
        }),
        None => Err(LimsError::precondition(
            "a label mismatch must be recorded with a note",
        )),
    }
}
