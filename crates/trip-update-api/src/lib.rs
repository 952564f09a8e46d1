use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use trip_update_core::{
    reconcile_entries, CandidateError, CandidateTripModification, CanonicalTripUpdate,
    ProvenanceId, ProvenanceRecord, ReconcileOutcome, ReferenceResolver, TripKey, TripUpdateId,
};
use trip_update_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};

pub mod config;
pub mod resolver;

pub use config::{ResolverConfig, TripUpdateConfig};
pub use resolver::{HttpScheduleResolver, ScheduleTrip, StaticScheduleResolver};

pub const API_CONTRACT_VERSION: &str = "api.v1";

type DecodedCandidate = std::result::Result<CandidateTripModification, CandidateError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// One ingestion batch as handed over by a feed normalizer.
///
/// `provenance_id` is normally left out; supplying the id of an already ingested batch replays
/// it without growing any history. Candidates are kept undecoded until ingestion so that a
/// malformed one is rejected on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchDocument {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub raw_payload: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub provenance_id: Option<ProvenanceId>,
    #[serde(default)]
    pub candidates: Vec<serde_yaml::Value>,
}

impl BatchDocument {
    /// Read a YAML or JSON batch document.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read batch file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse batch file {}", path.display()))
    }

    /// Fill in the source name when the batch does not carry one.
    #[must_use]
    pub fn with_default_source(mut self, default_source: Option<&str>) -> Self {
        if self.source.trim().is_empty() {
            if let Some(source) = default_source {
                self.source = source.to_string();
            }
        }
        self
    }

    /// Build a batch from already typed candidates.
    ///
    /// # Errors
    /// Returns an error when a candidate cannot be converted to a document value.
    pub fn from_candidates(
        source: impl Into<String>,
        candidates: &[CandidateTripModification],
    ) -> Result<Self> {
        let candidates = candidates
            .iter()
            .map(|candidate| {
                serde_yaml::to_value(candidate).context("failed to encode candidate")
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            source: source.into(),
            raw_payload: None,
            created_at: None,
            provenance_id: None,
            candidates,
        })
    }

    fn into_parts(self) -> (ProvenanceRecord, Vec<DecodedCandidate>) {
        let mut provenance = ProvenanceRecord::new(self.source, self.raw_payload);
        if let Some(provenance_id) = self.provenance_id {
            provenance.provenance_id = provenance_id;
        }
        if let Some(created_at) = self.created_at {
            provenance.created_at = created_at;
        }
        let candidates = self.candidates.into_iter().map(decode_candidate).collect();
        (provenance, candidates)
    }
}

fn decode_candidate(value: serde_yaml::Value) -> DecodedCandidate {
    serde_yaml::from_value(value).map_err(|err| CandidateError::InvalidCandidate {
        reason: format!("malformed candidate: {err}"),
    })
}

#[derive(Debug, Clone)]
pub struct TripUpdateApi {
    db_path: PathBuf,
}

impl TripUpdateApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or the pragmas fail.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Reconcile one batch into the canonical store.
    ///
    /// Rejected candidates are part of the returned outcome; only batch-fatal failures are
    /// returned as errors.
    ///
    /// # Errors
    /// Returns an error when the batch has no source name, or when the store cannot be opened,
    /// migrated or committed.
    pub fn ingest(
        &self,
        batch: BatchDocument,
        resolver: &dyn ReferenceResolver,
    ) -> Result<ReconcileOutcome> {
        let mut store = self.open_migrated_store()?;
        let (provenance, candidates) = batch.into_parts();
        let provenance_id = provenance.provenance_id;
        let outcome = reconcile_entries(&mut store, resolver, provenance, candidates)
            .with_context(|| format!("failed to reconcile batch {provenance_id}"))?;
        Ok(outcome)
    }

    /// Show the live trip update of one circulation.
    ///
    /// # Errors
    /// Returns an error when lookup fails or no trip update exists for the circulation.
    pub fn trip_show(&self, key: &TripKey) -> Result<CanonicalTripUpdate> {
        let store = self.open_migrated_store()?;
        store.find_live(key)?.ok_or_else(|| anyhow!("trip update not found: {key}"))
    }

    /// # Errors
    /// Returns an error when lookup fails or the trip update does not exist.
    pub fn trip_show_by_id(&self, trip_update_id: TripUpdateId) -> Result<CanonicalTripUpdate> {
        let store = self.open_migrated_store()?;
        store
            .get_trip_update(trip_update_id)?
            .ok_or_else(|| anyhow!("trip update not found: {trip_update_id}"))
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn trip_list(&self, service_date: Option<Date>) -> Result<Vec<CanonicalTripUpdate>> {
        let store = self.open_migrated_store()?;
        store.list_trip_updates(service_date)
    }

    /// # Errors
    /// Returns an error when lookup fails or the provenance record does not exist.
    pub fn provenance_show(&self, provenance_id: ProvenanceId) -> Result<ProvenanceRecord> {
        let store = self.open_migrated_store()?;
        store
            .get_provenance(provenance_id)?
            .ok_or_else(|| anyhow!("provenance record not found: {provenance_id}"))
    }
}
