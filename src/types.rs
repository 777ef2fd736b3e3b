//! Shared value types: timestamps, roles, actors and opaque payloads
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use minicbor::bytes::ByteVec;

use crate::error::LimsError;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    /// A fixed UTC instant. Fails on dates that do not exist.
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Result<Self, LimsError> {
        let instant = Utc.with_ymd_and_hms(year, month, day, hour, min, sec).single();
        instant.map(TimeStamp).ok_or_else(|| {
            LimsError::InvalidInput(format!(
                "{year}-{month:02}-{day:02} {hour:02}:{min:02}:{sec:02} does not exist"
            ))
        })
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Organizational roles known to the core. Labels arriving from outside are
/// parsed once at the boundary; nothing deeper ever sees a raw string.
#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub enum Role {
    #[n(0)]
    Admin,
    #[n(1)]
    SampleCollector,
    #[n(2)]
    Analyst,
    #[n(3)]
    Supervisor,
    #[n(4)]
    QualityManager,
    #[n(5)]
    Client,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Admin,
        Role::SampleCollector,
        Role::Analyst,
        Role::Supervisor,
        Role::QualityManager,
        Role::Client,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::SampleCollector => "sample_collector",
            Role::Analyst => "analyst",
            Role::Supervisor => "supervisor",
            Role::QualityManager => "quality_manager",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = LimsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_ascii_lowercase();
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == label)
            .ok_or_else(|| LimsError::InvalidInput(format!("unknown role label {s:?}")))
    }
}

/// The authenticated identity behind a request. `id` is `None` when the
/// caller could not be resolved, in which case no audit record is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<String>,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: Some(id.into()),
            role,
        }
    }
    pub fn unresolved(role: Role) -> Self {
        Self { id: None, role }
    }
    /// The id if present and non-blank.
    pub fn resolved_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }
    pub fn label(&self) -> String {
        self.resolved_id().unwrap_or("<unresolved>").to_string()
    }
}

/// Opaque payload the core stores and forwards without interpreting.
/// Addressed by the sha256 digest of its bytes.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    #[n(0)]
    bytes: ByteVec,
}

impl Default for Blob {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Blob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: ByteVec::from(bytes.into()),
        }
    }
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
    pub fn digest(&self) -> String {
        sha256::digest(self.as_bytes())
    }
}

/// The kinds of entity the audit trail knows about.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    #[n(0)]
    Sample,
    #[n(1)]
    SampleTest,
    #[n(2)]
    QualityCover,
    #[n(3)]
    LetterOfOrder,
    #[n(4)]
    PreApproval,
    #[n(5)]
    Counter,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Sample => "sample",
            EntityKind::SampleTest => "sample_test",
            EntityKind::QualityCover => "quality_cover",
            EntityKind::LetterOfOrder => "letter_of_order",
            EntityKind::PreApproval => "pre_approval",
            EntityKind::Counter => "counter",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
