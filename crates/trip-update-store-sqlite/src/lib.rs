use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use trip_update_core::{
    service_date, CanonicalStore, CanonicalTripUpdate, ChangeStatus, ProvenanceId,
    ProvenanceRecord, StopTimeUpdate, StoreError, TripKey, TripStatus, TripUpdateId, UnitOfWork,
};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS circulations (
  circulation_id INTEGER PRIMARY KEY AUTOINCREMENT,
  trip_id TEXT NOT NULL CHECK (length(trim(trip_id)) > 0),
  service_date TEXT NOT NULL,
  UNIQUE(trip_id, service_date)
);

CREATE TABLE IF NOT EXISTS provenance_records (
  provenance_id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  source TEXT NOT NULL CHECK (length(trim(source)) > 0),
  raw_payload TEXT
);

CREATE TABLE IF NOT EXISTS trip_updates (
  trip_update_id TEXT PRIMARY KEY,
  circulation_id INTEGER NOT NULL UNIQUE,
  status TEXT NOT NULL CHECK (status IN ('normal','partially_modified','cancelled')),
  message TEXT,
  contributor TEXT,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (circulation_id) REFERENCES circulations(circulation_id)
);

CREATE TABLE IF NOT EXISTS stop_time_updates (
  trip_update_id TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  stop_id TEXT NOT NULL,
  arrival TEXT,
  departure TEXT,
  arrival_status TEXT NOT NULL CHECK (arrival_status IN ('none','updated','skipped')),
  departure_status TEXT NOT NULL CHECK (departure_status IN ('none','updated','skipped')),
  cause TEXT,
  PRIMARY KEY (trip_update_id, position),
  FOREIGN KEY (trip_update_id) REFERENCES trip_updates(trip_update_id)
);

CREATE TABLE IF NOT EXISTS trip_update_history (
  trip_update_id TEXT NOT NULL,
  provenance_id TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  PRIMARY KEY (trip_update_id, provenance_id),
  UNIQUE (trip_update_id, sequence),
  FOREIGN KEY (trip_update_id) REFERENCES trip_updates(trip_update_id),
  FOREIGN KEY (provenance_id) REFERENCES provenance_records(provenance_id)
);

CREATE TABLE IF NOT EXISTS provenance_trip_updates (
  provenance_id TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  trip_update_id TEXT NOT NULL,
  trip_update_json TEXT NOT NULL,
  PRIMARY KEY (provenance_id, position),
  FOREIGN KEY (provenance_id) REFERENCES provenance_records(provenance_id),
  FOREIGN KEY (trip_update_id) REFERENCES trip_updates(trip_update_id)
);

CREATE INDEX IF NOT EXISTS idx_circulations_service_date ON circulations(service_date);
CREATE INDEX IF NOT EXISTS idx_trip_update_history_provenance ON trip_update_history(provenance_id);
CREATE INDEX IF NOT EXISTS idx_provenance_trip_updates_trip ON provenance_trip_updates(trip_update_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed canonical store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails, or when the
    /// database was written by a newer schema.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start migration v1 transaction")?;
            // another writer may have migrated while we waited for the lock
            if current_schema_version(&tx)? == 0 {
                tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
                record_schema_version(&tx, 1)?;
            }
            tx.commit().context("failed to commit migration v1")?;
            version = current_schema_version(&self.conn)?;
            tracing::info!(version, "applied schema migrations");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Load the live canonical trip update of one circulation outside of a batch.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn find_live(&self, key: &TripKey) -> Result<Option<CanonicalTripUpdate>> {
        load_live(&self.conn, key)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn get_trip_update(
        &self,
        trip_update_id: TripUpdateId,
    ) -> Result<Option<CanonicalTripUpdate>> {
        load_trip_update(&self.conn, trip_update_id)
    }

    /// List live trip updates ordered by service date then trip identifier.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_trip_updates(
        &self,
        service_date: Option<Date>,
    ) -> Result<Vec<CanonicalTripUpdate>> {
        let mut stmt = self.conn.prepare(
            "SELECT tu.trip_update_id
             FROM trip_updates tu
             JOIN circulations c ON c.circulation_id = tu.circulation_id
             WHERE ?1 IS NULL OR c.service_date = ?1
             ORDER BY c.service_date ASC, c.trip_id ASC",
        )?;
        let ids = stmt
            .query_map(params![service_date.map(service_date::format)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list trip updates")?;

        let mut updates = Vec::with_capacity(ids.len());
        for raw in ids {
            let trip_update_id = parse_trip_update_id(&raw)?;
            let update = load_trip_update(&self.conn, trip_update_id)?
                .ok_or_else(|| anyhow!("trip update {raw} vanished while listing"))?;
            updates.push(update);
        }
        Ok(updates)
    }

    /// Load a committed provenance record with the trip updates it produced, as committed.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn get_provenance(&self, provenance_id: ProvenanceId) -> Result<Option<ProvenanceRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT created_at, source, raw_payload FROM provenance_records WHERE provenance_id = ?1",
                params![provenance_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to read provenance record")?;
        let Some((created_at, source, raw_payload)) = row else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT trip_update_json FROM provenance_trip_updates
             WHERE provenance_id = ?1
             ORDER BY position ASC",
        )?;
        let snapshots = stmt
            .query_map(params![provenance_id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read provenance trip updates")?;
        let trip_updates = snapshots
            .iter()
            .map(|json| {
                serde_json::from_str::<CanonicalTripUpdate>(json)
                    .context("failed to deserialize trip update snapshot")
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(ProvenanceRecord {
            provenance_id,
            created_at: parse_rfc3339(&created_at)?,
            source,
            raw_payload,
            trip_updates,
        }))
    }

    /// Run `SQLite` quick check and foreign key checks.
    ///
    /// # Errors
    /// Returns an error when the pragmas cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

/// One batch transaction. Opened with `BEGIN IMMEDIATE`, so concurrent writers queue on the
/// database lock and always read the result of the previous batch.
pub struct SqliteUnit<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl CanonicalStore for SqliteStore {
    type Unit<'a> = SqliteUnit<'a>;

    fn begin(&mut self) -> Result<Self::Unit<'_>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| StoreError(format!("failed to begin unit of work: {err}")))?;
        Ok(SqliteUnit { tx })
    }
}

impl UnitOfWork for SqliteUnit<'_> {
    fn find_live(&self, key: &TripKey) -> Result<Option<CanonicalTripUpdate>, StoreError> {
        load_live(&self.tx, key).map_err(|err| StoreError(format!("{err:#}")))
    }

    fn commit(self, provenance: &ProvenanceRecord) -> Result<(), StoreError> {
        write_batch(&self.tx, provenance).map_err(|err| StoreError(format!("{err:#}")))?;
        self.tx
            .commit()
            .map_err(|err| StoreError(format!("failed to commit unit of work: {err}")))?;
        tracing::debug!(
            provenance_id = %provenance.provenance_id,
            trip_updates = provenance.trip_updates.len(),
            "sqlite unit of work committed"
        );
        Ok(())
    }
}

fn write_batch(conn: &Connection, provenance: &ProvenanceRecord) -> Result<()> {
    let now = now_rfc3339()?;
    let inserted = conn.execute(
        "INSERT INTO provenance_records(provenance_id, created_at, source, raw_payload)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(provenance_id) DO NOTHING",
        params![
            provenance.provenance_id.to_string(),
            rfc3339(provenance.created_at)?,
            provenance.source,
            provenance.raw_payload,
        ],
    )
    .context("failed to insert provenance record")?;
    // a committed provenance keeps the links and snapshots it was first written with
    let replay = inserted == 0;
    if replay {
        tracing::debug!(
            provenance_id = %provenance.provenance_id,
            "provenance already committed, leaving its audit links untouched"
        );
    }

    for (position, update) in provenance.trip_updates.iter().enumerate() {
        let circulation_id = upsert_circulation(conn, &update.trip)?;
        let trip_update_id = update.trip_update_id.to_string();

        conn.execute(
            "INSERT INTO trip_updates(trip_update_id, circulation_id, status, message, contributor, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(trip_update_id) DO UPDATE SET
               status = excluded.status,
               message = excluded.message,
               contributor = excluded.contributor,
               updated_at = excluded.updated_at",
            params![
                trip_update_id,
                circulation_id,
                update.status.as_str(),
                update.message,
                update.contributor,
                now,
            ],
        )
        .with_context(|| format!("failed to upsert trip update for {}", update.trip))?;

        conn.execute(
            "DELETE FROM stop_time_updates WHERE trip_update_id = ?1",
            params![trip_update_id],
        )
        .context("failed to clear previous stop time updates")?;
        for (stop_position, stop) in update.stop_time_updates.iter().enumerate() {
            conn.execute(
                "INSERT INTO stop_time_updates(
                    trip_update_id, position, stop_id, arrival, departure,
                    arrival_status, departure_status, cause
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    trip_update_id,
                    to_sql_position(stop_position)?,
                    stop.stop_id,
                    stop.arrival.map(rfc3339).transpose()?,
                    stop.departure.map(rfc3339).transpose()?,
                    stop.arrival_status.as_str(),
                    stop.departure_status.as_str(),
                    stop.cause,
                ],
            )
            .with_context(|| format!("failed to insert stop time update {}", stop.stop_id))?;
        }

        for (sequence, provenance_id) in update.history.iter().enumerate() {
            conn.execute(
                "INSERT OR IGNORE INTO trip_update_history(trip_update_id, provenance_id, sequence)
                 VALUES (?1, ?2, ?3)",
                params![trip_update_id, provenance_id.to_string(), to_sql_position(sequence)?],
            )
            .context("failed to insert trip update history")?;
        }

        if replay {
            continue;
        }
        conn.execute(
            "INSERT INTO provenance_trip_updates(provenance_id, position, trip_update_id, trip_update_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                provenance.provenance_id.to_string(),
                to_sql_position(position)?,
                trip_update_id,
                serde_json::to_string(update).context("failed to serialize trip update snapshot")?,
            ],
        )
        .context("failed to link provenance to trip update")?;
    }

    Ok(())
}

fn upsert_circulation(conn: &Connection, key: &TripKey) -> Result<i64> {
    let service_date = service_date::format(key.service_date);
    conn.execute(
        "INSERT INTO circulations(trip_id, service_date) VALUES (?1, ?2)
         ON CONFLICT(trip_id, service_date) DO NOTHING",
        params![key.trip_id, service_date],
    )
    .with_context(|| format!("failed to insert circulation {key}"))?;
    conn.query_row(
        "SELECT circulation_id FROM circulations WHERE trip_id = ?1 AND service_date = ?2",
        params![key.trip_id, service_date],
        |row| row.get::<_, i64>(0),
    )
    .with_context(|| format!("failed to read circulation {key}"))
}

fn load_live(conn: &Connection, key: &TripKey) -> Result<Option<CanonicalTripUpdate>> {
    let raw = conn
        .query_row(
            "SELECT tu.trip_update_id
             FROM trip_updates tu
             JOIN circulations c ON c.circulation_id = tu.circulation_id
             WHERE c.trip_id = ?1 AND c.service_date = ?2",
            params![key.trip_id, service_date::format(key.service_date)],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("failed to look up live trip update for {key}"))?;

    match raw {
        Some(raw) => load_trip_update(conn, parse_trip_update_id(&raw)?),
        None => Ok(None),
    }
}

fn load_trip_update(
    conn: &Connection,
    trip_update_id: TripUpdateId,
) -> Result<Option<CanonicalTripUpdate>> {
    let id = trip_update_id.to_string();
    let row = conn
        .query_row(
            "SELECT c.trip_id, c.service_date, tu.status, tu.message, tu.contributor
             FROM trip_updates tu
             JOIN circulations c ON c.circulation_id = tu.circulation_id
             WHERE tu.trip_update_id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("failed to read trip update {id}"))?;
    let Some((trip_id, service_date_raw, status_raw, message, contributor)) = row else {
        return Ok(None);
    };

    let service_date = service_date::parse(&service_date_raw)
        .with_context(|| format!("invalid service_date: {service_date_raw}"))?;
    let status =
        TripStatus::parse(&status_raw).ok_or_else(|| anyhow!("unknown trip status: {status_raw}"))?;

    Ok(Some(CanonicalTripUpdate {
        trip_update_id,
        trip: TripKey::new(trip_id, service_date),
        status,
        stop_time_updates: load_stop_time_updates(conn, &id)?,
        message,
        contributor,
        history: load_history(conn, &id)?,
    }))
}

fn load_stop_time_updates(
    conn: &Connection,
    trip_update_id: &str,
) -> Result<Vec<StopTimeUpdate>> {
    let mut stmt = conn.prepare(
        "SELECT stop_id, arrival, departure, arrival_status, departure_status, cause
         FROM stop_time_updates
         WHERE trip_update_id = ?1
         ORDER BY position ASC",
    )?;
    let mut rows = stmt.query(params![trip_update_id])?;
    let mut stops = Vec::new();

    while let Some(row) = rows.next()? {
        let arrival_raw: Option<String> = row.get(1)?;
        let departure_raw: Option<String> = row.get(2)?;
        let arrival_status_raw: String = row.get(3)?;
        let departure_status_raw: String = row.get(4)?;
        stops.push(StopTimeUpdate {
            stop_id: row.get(0)?,
            arrival: arrival_raw.as_deref().map(parse_rfc3339).transpose()?,
            departure: departure_raw.as_deref().map(parse_rfc3339).transpose()?,
            arrival_status: ChangeStatus::parse(&arrival_status_raw)
                .ok_or_else(|| anyhow!("unknown arrival_status: {arrival_status_raw}"))?,
            departure_status: ChangeStatus::parse(&departure_status_raw)
                .ok_or_else(|| anyhow!("unknown departure_status: {departure_status_raw}"))?,
            cause: row.get(5)?,
        });
    }

    Ok(stops)
}

fn load_history(conn: &Connection, trip_update_id: &str) -> Result<Vec<ProvenanceId>> {
    let mut stmt = conn.prepare(
        "SELECT provenance_id FROM trip_update_history
         WHERE trip_update_id = ?1
         ORDER BY sequence ASC",
    )?;
    let raw_ids = stmt
        .query_map(params![trip_update_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to read trip update history")?;
    raw_ids.iter().map(String::as_str).map(parse_provenance_id).collect()
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn to_sql_position(value: usize) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("position {value} does not fit in i64"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_trip_update_id(raw: &str) -> Result<TripUpdateId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(TripUpdateId(parsed))
}

fn parse_provenance_id(raw: &str) -> Result<ProvenanceId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(ProvenanceId(parsed))
}
