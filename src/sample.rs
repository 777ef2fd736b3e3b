//! Samples, their requested tests, and the three status spaces
use crate::audit::{Snapshot, SnapshotBuilder};
use crate::classify::{self, WorkflowGroup};
use crate::custody::{CrosscheckStatus, CustodyTimeline};
use crate::error::{LimsError, Result};
use crate::guard::WorkflowState;
use crate::store::Record;
use crate::types::{EntityKind, TimeStamp};

macro_rules! workflow_states {
    (
        $name:ident,
        $machine:literal,
        { $($variant:ident = $n:literal => $label:literal),+ $(,)? }
    ) => {
        #[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(
                #[n($n)]
                $variant,
            )+
        }

        impl WorkflowState for $name {
            const MACHINE: &'static str = $machine;

            fn all() -> &'static [Self] {
                &[$($name::$variant),+]
            }

            fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = LimsError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let label = s.trim().to_ascii_lowercase();
                <$name as WorkflowState>::all()
                    .iter()
                    .copied()
                    .find(|state| state.as_str() == label)
                    .ok_or_else(|| {
                        LimsError::InvalidInput(format!("unknown {} {s:?}", $machine))
                    })
            }
        }
    };
}

workflow_states!(SampleStatus, "sample status", {
    Received = 0 => "received",
    InProgress = 1 => "in_progress",
    TestingCompleted = 2 => "testing_completed",
    Verified = 3 => "verified",
    Validated = 4 => "validated",
    Reported = 5 => "reported",
});

// `ClientSubmitted` and `CollectorSubmitted` are deliberately separate: the
// first is the client's request entering intake, the second is the
// collector handing a finished intake up for validation.
workflow_states!(RequestStatus, "request status", {
    Draft = 0 => "draft",
    ClientSubmitted = 1 => "client_submitted",
    Returned = 2 => "returned",
    Accepted = 3 => "accepted",
    InCollection = 4 => "in_collection",
    CollectorSubmitted = 5 => "collector_submitted",
    Validated = 6 => "validated",
});

workflow_states!(TestStatus, "test status", {
    Draft = 0 => "draft",
    InProgress = 1 => "in_progress",
    Measured = 2 => "measured",
    Verified = 3 => "verified",
    Validated = 4 => "validated",
    Cancelled = 5 => "cancelled",
    Failed = 6 => "failed",
});

impl TestStatus {
    /// No further bench work is expected.
    pub fn is_settled(&self) -> bool {
        !matches!(self, TestStatus::Draft | TestStatus::InProgress)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub client_id: String,
    #[n(2)]
    pub creator_id: String,
    /// Code printed on the physical label at intake.
    #[n(3)]
    pub sample_code: String,
    #[n(4)]
    pub detailed_status: SampleStatus,
    #[n(5)]
    pub request_status: RequestStatus,
    #[n(6)]
    pub crosscheck_status: CrosscheckStatus,
    #[n(7)]
    pub crosscheck_note: Option<String>,
    #[n(8)]
    pub lab_code: Option<String>,
    #[n(9)]
    pub workflow_group: Option<WorkflowGroup>,
    #[n(10)]
    pub parameter_ids: Vec<u32>,
    #[n(11)]
    pub custody: CustodyTimeline,
    #[n(12)]
    pub created_at: TimeStamp,
}

impl Sample {
    pub fn new(
        id: String,
        client_id: String,
        creator_id: String,
        sample_code: String,
        parameter_ids: Vec<u32>,
    ) -> Self {
        let mut sample = Self {
            id,
            client_id,
            creator_id,
            sample_code,
            detailed_status: SampleStatus::Received,
            request_status: RequestStatus::Draft,
            crosscheck_status: CrosscheckStatus::Pending,
            crosscheck_note: None,
            lab_code: None,
            workflow_group: None,
            parameter_ids: Vec::new(),
            custody: CustodyTimeline::new(),
            created_at: TimeStamp::new(),
        };
        for parameter_id in parameter_ids {
            sample.add_parameter(parameter_id);
        }
        sample
    }

    /// Custody, intake and approval changes are closed once a lab code exists.
    pub fn ensure_open(&self) -> Result<()> {
        match &self.lab_code {
            Some(code) => Err(LimsError::AlreadyFinalized(format!(
                "sample {} (lab code {code})",
                self.id
            ))),
            None => Ok(()),
        }
    }

    pub fn add_parameter(&mut self, parameter_id: u32) {
        if !self.parameter_ids.contains(&parameter_id) {
            self.parameter_ids.push(parameter_id);
            self.parameter_ids.sort_unstable();
        }
    }

    /// Set the workflow group if it is not set yet. Returns whether anything
    /// changed; an already derived group is left alone.
    pub fn derive_workflow_group(&mut self) -> bool {
        if self.workflow_group.is_some() {
            return false;
        }
        self.workflow_group = classify::resolve(self.parameter_ids.iter().copied());
        self.workflow_group.is_some()
    }
}

impl Record for Sample {
    const KIND: EntityKind = EntityKind::Sample;

    fn id(&self) -> &str {
        &self.id
    }

    fn snapshot(&self) -> Snapshot {
        let parameters: Vec<String> = self.parameter_ids.iter().map(u32::to_string).collect();
        let builder = SnapshotBuilder::new()
            .with("client_id", &self.client_id)
            .with("sample_code", &self.sample_code)
            .with("detailed_status", self.detailed_status)
            .with("request_status", self.request_status)
            .with("crosscheck_status", self.crosscheck_status.as_str())
            .with_opt("crosscheck_note", self.crosscheck_note.as_ref())
            .with_opt("lab_code", self.lab_code.as_ref())
            .with_opt("workflow_group", self.workflow_group)
            .with("parameter_ids", parameters.join(","));
        self.custody.write_snapshot(builder).build()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct SampleTest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub sample_id: String,
    #[n(2)]
    pub parameter_id: u32,
    #[n(3)]
    pub status: TestStatus,
    #[n(4)]
    pub assignee_id: Option<String>,
    #[n(5)]
    pub created_at: TimeStamp,
}

impl SampleTest {
    pub fn new(
        id: String,
        sample_id: String,
        parameter_id: u32,
        assignee_id: Option<String>,
    ) -> Self {
        Self {
            id,
            sample_id,
            parameter_id,
            status: TestStatus::Draft,
            assignee_id,
            created_at: TimeStamp::new(),
        }
    }
}

impl Record for SampleTest {
    const KIND: EntityKind = EntityKind::SampleTest;

    fn id(&self) -> &str {
        &self.id
    }

    fn snapshot(&self) -> Snapshot {
        SnapshotBuilder::new()
            .with("sample_id", &self.sample_id)
            .with("parameter_id", self.parameter_id)
            .with("status", self.status)
            .with_opt("assignee_id", self.assignee_id.as_ref())
            .build()
    }
}
