use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

mod engine;
mod merge;

pub use engine::{reconcile, reconcile_entries, CandidateRejection, ReconcileOutcome};
pub use merge::{dedupe_stop_changes, merge_candidate};

/// Batch-fatal failures. Everything else is reported per candidate.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error("invalid provenance record: {0}")]
    InvalidProvenance(String),
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateError {
    #[error("invalid candidate: {reason}")]
    InvalidCandidate { reason: String },
    #[error("trip {trip_id} on {service_date} could not be resolved: {reason}")]
    ReferenceNotFound {
        trip_id: String,
        #[serde(with = "service_date")]
        service_date: Date,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateWarning {
    /// A candidate listed the same stop more than once. Only the first occurrence is applied.
    DuplicateStopInCandidate { candidate_index: usize, stop_id: String },
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ResolveError {
    #[error("trip not found in schedule")]
    NotFound,
    #[error("schedule lookup failed: {0}")]
    Lookup(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{0}")]
pub struct StoreError(pub String);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TripUpdateId(pub Ulid);

impl TripUpdateId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TripUpdateId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TripUpdateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProvenanceId(pub Ulid);

impl ProvenanceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ProvenanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ProvenanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Normal,
    PartiallyModified,
    Cancelled,
}

impl TripStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::PartiallyModified => "partially_modified",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(Self::Normal),
            "partially_modified" => Some(Self::PartiallyModified),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Per-direction change marker on one stop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    None,
    Updated,
    Skipped,
}

impl ChangeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "updated" => Some(Self::Updated),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Identifies one scheduled circulation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TripKey {
    pub trip_id: String,
    #[serde(with = "service_date")]
    pub service_date: Date,
}

impl TripKey {
    #[must_use]
    pub fn new(trip_id: impl Into<String>, service_date: Date) -> Self {
        Self { trip_id: trip_id.into(), service_date }
    }
}

impl Display for TripKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.trip_id, service_date::format(self.service_date))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScheduledStop {
    pub stop_id: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub scheduled_arrival: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub scheduled_departure: Option<OffsetDateTime>,
}

/// Authoritative schedule of one circulation, as returned by a [`ReferenceResolver`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TripReference {
    pub key: TripKey,
    pub stops: Vec<ScheduledStop>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StopTimeUpdate {
    pub stop_id: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub arrival: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub departure: Option<OffsetDateTime>,
    pub arrival_status: ChangeStatus,
    pub departure_status: ChangeStatus,
    pub cause: Option<String>,
}

impl StopTimeUpdate {
    /// The untouched state of a stop: scheduled times, no change reported.
    #[must_use]
    pub fn scheduled(stop: &ScheduledStop) -> Self {
        Self {
            stop_id: stop.stop_id.clone(),
            arrival: stop.scheduled_arrival,
            departure: stop.scheduled_departure,
            arrival_status: ChangeStatus::None,
            departure_status: ChangeStatus::None,
            cause: None,
        }
    }
}

/// Dense, reconciled state of one circulation.
///
/// `stop_time_updates` always mirrors the authoritative stop sequence it was last merged
/// against, and `history` lists contributing batches in ingestion order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CanonicalTripUpdate {
    pub trip_update_id: TripUpdateId,
    pub trip: TripKey,
    pub status: TripStatus,
    pub stop_time_updates: Vec<StopTimeUpdate>,
    pub message: Option<String>,
    pub contributor: Option<String>,
    #[serde(default)]
    pub history: Vec<ProvenanceId>,
}

impl CanonicalTripUpdate {
    /// Append a contributing batch to the history. Returns `false` when it was already recorded.
    pub fn record_provenance(&mut self, provenance_id: ProvenanceId) -> bool {
        if self.history.contains(&provenance_id) {
            return false;
        }
        self.history.push(provenance_id);
        true
    }
}

/// Sparse change for one reported stop.
///
/// For `arrival` and `departure`, `None` means the report has no opinion and `Some(None)`
/// means the time no longer applies.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StopChange {
    pub stop_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "patch_time")]
    pub arrival: Option<Option<OffsetDateTime>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "patch_time")]
    pub departure: Option<Option<OffsetDateTime>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_status: Option<ChangeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_status: Option<ChangeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl StopChange {
    #[must_use]
    pub fn new(stop_id: impl Into<String>) -> Self {
        Self {
            stop_id: stop_id.into(),
            arrival: None,
            departure: None,
            arrival_status: None,
            departure_status: None,
            cause: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CandidateTripModification {
    #[serde(default)]
    pub trip_id: String,
    #[serde(default, with = "service_date::option")]
    pub service_date: Option<Date>,
    #[serde(default)]
    pub trip_status: Option<TripStatus>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub contributor: Option<String>,
    #[serde(default)]
    pub stop_changes: Vec<StopChange>,
}

impl CandidateTripModification {
    /// Check the candidate shape and return the circulation it targets.
    ///
    /// # Errors
    /// Returns [`CandidateError::InvalidCandidate`] when the trip identifier or service date
    /// is missing, or when a stop change has an empty stop identifier.
    pub fn validate(&self) -> Result<TripKey, CandidateError> {
        if self.trip_id.trim().is_empty() {
            return Err(CandidateError::InvalidCandidate {
                reason: "trip_id MUST be provided".to_string(),
            });
        }

        let Some(service_date) = self.service_date else {
            return Err(CandidateError::InvalidCandidate {
                reason: format!("service_date MUST be provided for trip {}", self.trip_id),
            });
        };

        if let Some(position) =
            self.stop_changes.iter().position(|change| change.stop_id.trim().is_empty())
        {
            return Err(CandidateError::InvalidCandidate {
                reason: format!("stop change #{position} has an empty stop_id"),
            });
        }

        Ok(TripKey::new(self.trip_id.clone(), service_date))
    }
}

/// One ingestion batch, retained for audit and replay.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProvenanceRecord {
    pub provenance_id: ProvenanceId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub source: String,
    pub raw_payload: Option<String>,
    #[serde(default)]
    pub trip_updates: Vec<CanonicalTripUpdate>,
}

impl ProvenanceRecord {
    #[must_use]
    pub fn new(source: impl Into<String>, raw_payload: Option<String>) -> Self {
        Self {
            provenance_id: ProvenanceId::new(),
            created_at: OffsetDateTime::now_utc(),
            source: source.into(),
            raw_payload,
            trip_updates: Vec::new(),
        }
    }

    /// Validate the structural fields of a batch before reconciliation.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidProvenance`] when the source name is empty.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.source.trim().is_empty() {
            return Err(ReconcileError::InvalidProvenance(
                "source MUST be provided for every batch".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lookup of the authoritative stop sequence of a circulation.
pub trait ReferenceResolver {
    /// # Errors
    /// Returns [`ResolveError::NotFound`] when the circulation is unknown, or
    /// [`ResolveError::Lookup`] when the schedule source cannot be queried.
    fn resolve(&self, key: &TripKey) -> Result<TripReference, ResolveError>;
}

impl<R: ReferenceResolver + ?Sized> ReferenceResolver for Box<R> {
    fn resolve(&self, key: &TripKey) -> Result<TripReference, ResolveError> {
        (**self).resolve(key)
    }
}

/// One read-modify-write transaction against the canonical store.
///
/// Dropping a unit without calling [`UnitOfWork::commit`] MUST leave the store untouched.
pub trait UnitOfWork {
    /// # Errors
    /// Returns [`StoreError`] when the live record cannot be read.
    fn find_live(&self, key: &TripKey) -> Result<Option<CanonicalTripUpdate>, StoreError>;

    /// Persist the provenance record and every trip update it carries, atomically.
    ///
    /// # Errors
    /// Returns [`StoreError`] when any write fails; nothing is persisted in that case.
    fn commit(self, provenance: &ProvenanceRecord) -> Result<(), StoreError>;
}

pub trait CanonicalStore {
    type Unit<'a>: UnitOfWork
    where
        Self: 'a;

    /// # Errors
    /// Returns [`StoreError`] when a transaction cannot be opened.
    fn begin(&mut self) -> Result<Self::Unit<'_>, StoreError>;
}

/// `YYYY-MM-DD` serde adapter for service dates.
pub mod service_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Iso8601;
    use time::Date;

    #[must_use]
    pub fn format(value: Date) -> String {
        format!("{:04}-{:02}-{:02}", value.year(), u8::from(value.month()), value.day())
    }

    /// # Errors
    /// Returns the parse error when `value` is not an ISO 8601 calendar date.
    pub fn parse(value: &str) -> Result<Date, time::error::Parse> {
        Date::parse(value, &Iso8601::DATE)
    }

    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value))
    }

    /// # Errors
    /// Fails when the value is not a `YYYY-MM-DD` string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::Date;

        /// # Errors
        /// Propagates serializer errors.
        pub fn serialize<S: Serializer>(
            value: &Option<Date>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(date) => serializer.serialize_some(&super::format(*date)),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        /// Fails when a present value is not a `YYYY-MM-DD` string.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Date>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| super::parse(&value).map_err(serde::de::Error::custom)).transpose()
        }
    }
}

/// Serde adapter keeping "absent" and "explicit null" apart for reported times.
///
/// Pair it with `#[serde(default, skip_serializing_if = "Option::is_none")]`.
pub mod patch_time {
    use serde::{Deserializer, Serializer};
    use time::OffsetDateTime;

    /// # Errors
    /// Propagates serializer and RFC 3339 formatting errors.
    pub fn serialize<S: Serializer>(
        value: &Option<Option<OffsetDateTime>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(Some(at)) => time::serde::rfc3339::serialize(at, serializer),
            Some(None) | None => serializer.serialize_none(),
        }
    }

    /// # Errors
    /// Fails when a present, non-null value is not an RFC 3339 timestamp.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<OffsetDateTime>>, D::Error> {
        time::serde::rfc3339::option::deserialize(deserializer).map(Some)
    }
}
