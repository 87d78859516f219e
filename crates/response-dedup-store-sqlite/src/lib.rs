use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use response_dedup_core::{
    content_digest, is_well_formed_digest, Answers, BatchOutcome, Classification,
    ClassificationUpdate, DedupError, FlagCandidate, FlaggingSlice, HistoryKey, HistorySelection,
    PointerRedirect, Response, ResponseId, ResponseStore, WriteBatch,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, info};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS responses (
  ingest_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  response_id TEXT NOT NULL UNIQUE,
  participant_id TEXT NOT NULL CHECK (length(trim(participant_id)) > 0),
  module_id TEXT NOT NULL CHECK (length(trim(module_id)) > 0),
  external_id TEXT,
  authored TEXT,
  ingested_at TEXT NOT NULL,
  answers_json TEXT,
  content_digest TEXT,
  classification TEXT CHECK (
    classification IS NULL OR classification IN (
      'complete', 'partial', 'duplicate', 'no_answer_values', 'authored_time_updated'
    )
  ),
  duplicate_of TEXT REFERENCES responses(response_id),
  reason TEXT,
  CHECK (duplicate_of IS NULL OR duplicate_of <> response_id)
);

CREATE INDEX IF NOT EXISTS idx_responses_history ON responses(participant_id, module_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS flag_runs (
  run_id TEXT PRIMARY KEY,
  watermark INTEGER NOT NULL,
  rows_flagged INTEGER NOT NULL CHECK (rows_flagged >= 0),
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_responses_flag_class ON responses(external_id, content_digest);
CREATE INDEX IF NOT EXISTS idx_responses_duplicate_of ON responses(duplicate_of);
";

const RESPONSE_COLUMNS: &str = "response_id, participant_id, module_id, external_id, authored, \
     ingested_at, answers_json, content_digest, classification, duplicate_of, reason";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
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
    /// Duplicate rows whose pointer chain never reaches a non-duplicate row.
    pub dangling_duplicate_pointers: Vec<ResponseId>,
    pub schema_status: SchemaStatus,
}

/// One submission as handed over by ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewResponse {
    #[serde(default)]
    pub response_id: Option<ResponseId>,
    pub participant_id: String,
    pub module_id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub authored: Option<OffsetDateTime>,
    /// Requested persistence time; moved forward when it would not be strictly
    /// after the latest stored row.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ingested_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub answers: Option<Answers>,
    #[serde(default)]
    pub content_digest: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseFilter {
    pub participant_id: Option<String>,
    pub module_id: Option<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed response store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// Read-only: a database without a migration ledger reports version 0.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration 002")?;
            record_schema_version(&tx, 2)?;
            tx.commit().context("failed to commit migration 002")?;
            info!(version = 2, "applied schema migration");
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "responses")? {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&self.conn, 1)?;
            info!(version = 1, "applied schema migration");
            return Ok(1);
        }

        for column in ["ingest_seq", "response_id", "authored", "ingested_at", "content_digest"] {
            if !table_has_column(&self.conn, "responses", column)? {
                return Err(anyhow!("database schema is invalid: responses has no {column} column"));
            }
        }

        // Tables created before the migration ledger existed.
        record_schema_version(&self.conn, 1)?;
        if table_exists(&self.conn, "flag_runs")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    /// Persist one new response and return it as stored.
    ///
    /// The digest is computed from the answers; a supplied digest must match it
    /// and is kept as-is only for rows without answers. `ingested_at` is
    /// strictly greater than that of every earlier row.
    ///
    /// # Errors
    /// Returns an error for blank participant or module ids, a malformed supplied
    /// digest or one that disagrees with the answers, a response id that already exists, or any failed write.
    pub fn insert_response(&mut self, new: &NewResponse) -> Result<Response> {
        if new.participant_id.trim().is_empty() {
            return Err(anyhow!("participant_id MUST be non-empty"));
        }
        if new.module_id.trim().is_empty() {
            return Err(anyhow!("module_id MUST be non-empty"));
        }
        let computed_digest = new.answers.as_ref().map(content_digest);
        if let Some(digest) = new.content_digest.as_deref() {
            if !is_well_formed_digest(digest) {
                return Err(anyhow!("content_digest is malformed: {digest}"));
            }
            if let Some(computed) = computed_digest.as_deref() {
                if computed != digest {
                    return Err(anyhow!(
                        "content_digest {digest} does not match answers (expected {computed})"
                    ));
                }
            }
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start ingest transaction")?;

        let latest = tx
            .query_row(
                "SELECT ingested_at FROM responses ORDER BY ingest_seq DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read latest ingested_at")?
            .map(|raw| parse_rfc3339(&raw))
            .transpose()?;

        let requested =
            new.ingested_at.unwrap_or_else(OffsetDateTime::now_utc).to_offset(UtcOffset::UTC);
        let ingested_at = match latest {
            Some(latest) if requested <= latest => latest + Duration::microseconds(1),
            _ => requested,
        };

        let response = Response {
            response_id: new.response_id.unwrap_or_default(),
            participant_id: new.participant_id.trim().to_string(),
            module_id: new.module_id.trim().to_string(),
            external_id: new
                .external_id
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            authored: new.authored.map(|authored| authored.to_offset(UtcOffset::UTC)),
            ingested_at,
            content_digest: computed_digest.or_else(|| new.content_digest.clone()),
            answers: new.answers.clone(),
            classification: None,
            duplicate_of: None,
            reason: None,
        };

        tx.execute(
            &format!(
                "INSERT INTO responses({RESPONSE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, NULL)"
            ),
            params![
                response.response_id.to_string(),
                response.participant_id,
                response.module_id,
                response.external_id,
                response.authored.map(rfc3339).transpose()?,
                rfc3339(response.ingested_at)?,
                response
                    .answers
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .context("failed to serialize answers")?,
                response.content_digest,
            ],
        )
        .with_context(|| format!("failed to insert response {}", response.response_id))?;

        tx.commit().context("failed to commit ingest transaction")?;
        debug!(response_id = %response.response_id, "ingested response");
        Ok(response)
    }

    /// List stored responses in ingestion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_responses(&self, filter: &ResponseFilter) -> Result<Vec<Response>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RESPONSE_COLUMNS}
             FROM responses
             WHERE (?1 IS NULL OR participant_id = ?1)
               AND (?2 IS NULL OR module_id = ?2)
             ORDER BY ingest_seq ASC"
        ))?;
        let mut rows = stmt.query(params![filter.participant_id, filter.module_id])?;

        let mut responses = Vec::new();
        while let Some(row) = rows.next()? {
            responses.push(response_from_row(row)?);
        }
        Ok(responses)
    }

    /// Distinct (participant, module) keys that match `selection`, in key order.
    ///
    /// # Errors
    /// Returns an error when the keys cannot be read.
    pub fn list_history_keys(&self, selection: &HistorySelection) -> Result<Vec<HistoryKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT participant_id, module_id
             FROM responses
             WHERE (?1 IS NULL OR module_id = ?1)
             ORDER BY participant_id ASC, module_id ASC",
        )?;
        let mut rows = stmt.query(params![selection.module_id])?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            let key = HistoryKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
            if selection.matches(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Every response of one participant/module history, in ingestion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_history(&self, key: &HistoryKey) -> Result<Vec<Response>> {
        self.list_responses(&ResponseFilter {
            participant_id: Some(key.participant_id.clone()),
            module_id: Some(key.module_id.clone()),
        })
    }

    /// Candidates for the global flagger.
    ///
    /// Rows need a non-empty external id and digest and must not already be
    /// duplicates. With `since_seq`, only classes containing a row ingested after
    /// that sequence number are returned, but those classes come back whole.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn flagging_candidates(&self, since_seq: Option<i64>) -> Result<FlaggingSlice> {
        let high_water_mark = self
            .conn
            .query_row("SELECT MAX(ingest_seq) FROM responses", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read ingest high-water mark")?;

        let mut stmt = self.conn.prepare(
            "SELECT response_id, external_id, content_digest, ingested_at, classification
             FROM responses AS candidate
             WHERE candidate.external_id IS NOT NULL AND length(trim(candidate.external_id)) > 0
               AND candidate.content_digest IS NOT NULL AND length(trim(candidate.content_digest)) > 0
               AND (candidate.classification IS NULL OR candidate.classification <> 'duplicate')
               AND (?1 IS NULL OR EXISTS (
                 SELECT 1 FROM responses AS fresh
                 WHERE fresh.ingest_seq > ?1
                   AND fresh.external_id = candidate.external_id
                   AND fresh.content_digest = candidate.content_digest
               ))
             ORDER BY candidate.ingest_seq ASC",
        )?;
        let mut rows = stmt.query(params![since_seq])?;

        let mut candidates = Vec::new();
        while let Some(row) = rows.next()? {
            candidates.push(FlagCandidate {
                response_id: parse_response_id(&row.get::<_, String>(0)?)?,
                external_id: row.get(1)?,
                content_digest: row.get(2)?,
                ingested_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
                classification: parse_classification(row.get::<_, Option<String>>(4)?)?,
            });
        }

        Ok(FlaggingSlice { candidates, high_water_mark })
    }

    /// Write annotations in one transaction, one UPDATE per row.
    ///
    /// # Errors
    /// Returns an error when any row does not exist or any update fails; the whole
    /// batch is rolled back in that case.
    pub fn apply_classifications(&mut self, updates: &[ClassificationUpdate]) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start classification transaction")?;
        let updated = write_updates(&tx, updates)?;
        tx.commit().context("failed to commit classification transaction")?;
        Ok(updated)
    }

    /// Move every pointer aimed at a redirect's `from` row onto its `to` row.
    ///
    /// # Errors
    /// Returns an error when any update fails; the whole set is rolled back.
    pub fn redirect_duplicate_pointers(&mut self, redirects: &[PointerRedirect]) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start redirect transaction")?;
        let redirected = write_redirects(&tx, redirects)?;
        tx.commit().context("failed to commit redirect transaction")?;
        Ok(redirected)
    }

    /// Watermark of the most recent flagging run.
    ///
    /// # Errors
    /// Returns an error when the run ledger cannot be read.
    pub fn latest_flag_watermark(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(watermark) FROM flag_runs", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read flag watermark")
    }

    /// Append one completed flagging run to the ledger.
    ///
    /// # Errors
    /// Returns an error when the ledger row cannot be written.
    pub fn append_flag_run(&mut self, watermark: i64, rows_flagged: usize) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO flag_runs(run_id, watermark, rows_flagged, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Ulid::new().to_string(),
                    watermark,
                    i64::try_from(rows_flagged).context("rows_flagged exceeds i64")?,
                    now_rfc3339()?,
                ],
            )
            .context("failed to record flag run")?;
        Ok(())
    }

    /// Copy the database to `out_file` with the online backup API.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, pointer and schema health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
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
        let dangling_duplicate_pointers = if schema_status.current_version > 0 {
            self.dangling_duplicate_pointers()?
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            dangling_duplicate_pointers,
            schema_status,
        })
    }

    fn dangling_duplicate_pointers(&self) -> Result<Vec<ResponseId>> {
        // UNION keeps the walk finite when pointers form a cycle.
        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE chain(origin, target) AS (
                 SELECT response_id, duplicate_of FROM responses
                 WHERE classification = 'duplicate'
                 UNION
                 SELECT chain.origin, hop.duplicate_of
                 FROM chain
                 JOIN responses AS hop ON hop.response_id = chain.target
                 WHERE hop.classification = 'duplicate'
             )
             SELECT flagged.response_id
             FROM responses AS flagged
             WHERE flagged.classification = 'duplicate'
               AND NOT EXISTS (
                 SELECT 1
                 FROM chain
                 JOIN responses AS target ON target.response_id = chain.target
                 WHERE chain.origin = flagged.response_id
                   AND (target.classification IS NULL OR target.classification <> 'duplicate')
               )
             ORDER BY flagged.ingest_seq ASC",
        )?;
        let mut rows = stmt.query([])?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(parse_response_id(&row.get::<_, String>(0)?)?);
        }
        Ok(ids)
    }
}

impl ResponseStore for SqliteStore {
    fn history_keys(&self, selection: &HistorySelection) -> Result<Vec<HistoryKey>, DedupError> {
        self.list_history_keys(selection).map_err(store_error)
    }

    fn fetch_history(&self, key: &HistoryKey) -> Result<Vec<Response>, DedupError> {
        self.load_history(key).map_err(store_error)
    }

    fn fetch_responses_for_flagging(
        &self,
        since: Option<i64>,
    ) -> Result<FlaggingSlice, DedupError> {
        self.flagging_candidates(since).map_err(store_error)
    }

    fn apply_batch(&mut self, batch: &WriteBatch) -> Result<BatchOutcome, DedupError> {
        let apply = |conn: &mut Connection| -> Result<BatchOutcome> {
            let tx = conn.transaction().context("failed to start batch transaction")?;
            let rows_updated = write_updates(&tx, &batch.updates)?;
            let pointers_redirected = write_redirects(&tx, &batch.redirects)?;
            tx.commit().context("failed to commit batch transaction")?;
            Ok(BatchOutcome { rows_updated, pointers_redirected })
        };
        apply(&mut self.conn).map_err(store_error)
    }

    fn flag_watermark(&self) -> Result<Option<i64>, DedupError> {
        self.latest_flag_watermark().map_err(store_error)
    }

    fn record_flag_run(&mut self, watermark: i64, rows_flagged: usize) -> Result<(), DedupError> {
        self.append_flag_run(watermark, rows_flagged).map_err(store_error)
    }
}

fn store_error(err: anyhow::Error) -> DedupError {
    DedupError::Store(format!("{err:#}"))
}

fn write_updates(conn: &Connection, updates: &[ClassificationUpdate]) -> Result<usize> {
    let mut stmt = conn
        .prepare(
            "UPDATE responses
             SET classification = ?1, duplicate_of = ?2, reason = ?3
             WHERE response_id = ?4",
        )
        .context("failed to prepare classification update")?;

    for update in updates {
        let changed = stmt
            .execute(params![
                update.classification.as_str(),
                update.duplicate_of.map(|id| id.to_string()),
                update.reason,
                update.response_id.to_string(),
            ])
            .with_context(|| format!("failed to update response {}", update.response_id))?;
        if changed == 0 {
            return Err(anyhow!("response {} does not exist", update.response_id));
        }
    }

    debug!(rows = updates.len(), "wrote classification batch");
    Ok(updates.len())
}

fn write_redirects(conn: &Connection, redirects: &[PointerRedirect]) -> Result<usize> {
    let mut stmt = conn
        .prepare(
            "UPDATE responses
             SET duplicate_of = ?2
             WHERE duplicate_of = ?1 AND response_id <> ?2",
        )
        .context("failed to prepare pointer redirect")?;

    let mut redirected = 0;
    for redirect in redirects {
        redirected += stmt
            .execute(params![redirect.from.to_string(), redirect.to.to_string()])
            .with_context(|| format!("failed to redirect pointers aimed at {}", redirect.from))?;
    }
    Ok(redirected)
}

fn response_from_row(row: &rusqlite::Row<'_>) -> Result<Response> {
    let answers_json: Option<String> = row.get(6)?;
    Ok(Response {
        response_id: parse_response_id(&row.get::<_, String>(0)?)?,
        participant_id: row.get(1)?,
        module_id: row.get(2)?,
        external_id: row.get(3)?,
        authored: row.get::<_, Option<String>>(4)?.as_deref().map(parse_rfc3339).transpose()?,
        ingested_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
        answers: answers_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("failed to deserialize answers")?,
        content_digest: row.get(7)?,
        classification: parse_classification(row.get(8)?)?,
        duplicate_of: row
            .get::<_, Option<String>>(9)?
            .as_deref()
            .map(parse_response_id)
            .transpose()?,
        reason: row.get(10)?,
    })
}

fn parse_classification(raw: Option<String>) -> Result<Option<Classification>> {
    raw.map(|value| {
        Classification::parse(&value).ok_or_else(|| anyhow!("unknown classification: {value}"))
    })
    .transpose()
}

fn parse_response_id(raw: &str) -> Result<ResponseId> {
    ResponseId::parse(raw).map_err(|err| anyhow!("{err}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "responses")? {
        return Ok((0, false));
    }

    if table_exists(conn, "flag_runs")? {
        return Ok((2, true));
    }

    Ok((1, true))
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
