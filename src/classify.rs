//! Workflow group resolution from requested test parameters
use std::fmt;
use std::ops::RangeInclusive;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowGroup {
    #[n(0)]
    Wgs,
    #[n(1)]
    Pcr,
    #[n(2)]
    Antigen,
    #[n(3)]
    UpperPanel,
    #[n(4)]
    LowerPanel,
}

impl WorkflowGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowGroup::Wgs => "wgs",
            WorkflowGroup::Pcr => "pcr",
            WorkflowGroup::Antigen => "antigen",
            WorkflowGroup::UpperPanel => "upper_panel",
            WorkflowGroup::LowerPanel => "lower_panel",
        }
    }
}

impl fmt::Display for WorkflowGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Checked top to bottom. The lower panel overlaps the specific assays, so a
// sample asking for PCR and WGS parameters lands in WGS.
const PRECEDENCE: [(WorkflowGroup, RangeInclusive<i64>); 5] = [
    (WorkflowGroup::Wgs, 12..=15),
    (WorkflowGroup::Pcr, 5..=8),
    (WorkflowGroup::Antigen, 9..=11),
    (WorkflowGroup::UpperPanel, 16..=40),
    (WorkflowGroup::LowerPanel, 1..=15),
];

/// First group in precedence order that any positive parameter id falls in.
pub fn resolve<I>(parameter_ids: I) -> Option<WorkflowGroup>
where
    I: IntoIterator,
    I::Item: Into<i64>,
{
    let ids: Vec<i64> = parameter_ids
        .into_iter()
        .map(Into::into)
        .filter(|id| *id > 0)
        .collect();

    PRECEDENCE
        .iter()
        .find(|(_, range)| ids.iter().any(|id| range.contains(id)))
        .map(|(group, _)| *group)
}
