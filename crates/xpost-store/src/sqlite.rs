//! SQLite-backed `PublishStore` implementation with durable persistence.

use crate::{
    apply_ledger_transition, apply_permit_transition, AuditEvent, AuditEventType, ExternalId,
    LedgerQuery, LedgerRow, LedgerStatus, Permit, PermitStatus, PublishStore, StoreError,
    StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Columns the publish ledger table must carry.
pub const REQUIRED_LEDGER_COLUMNS: &[&str] = &[
    "decision_id",
    "status",
    "external_id",
    "skip_reason",
    "permit_id",
    "created_at",
    "updated_at",
    "posted_at",
];

const LEDGER_COLUMNS_SQL: &str =
    "decision_id, status, external_id, skip_reason, permit_id, created_at, updated_at, posted_at";
const PERMIT_COLUMNS_SQL: &str =
    "permit_id, decision_id, status, external_id, reason, metadata_json, created_at, updated_at";

/// Persistent SQLite store backend.
#[derive(Debug)]
pub struct SqlitePublishStore {
    db_path: PathBuf,
}

impl SqlitePublishStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Lists required ledger columns missing from the database at `path`.
    ///
    /// Does not create or migrate anything; a missing table reports every column.
    pub fn inspect_ledger_schema(path: impl AsRef<Path>) -> StoreResult<Vec<String>> {
        let connection = Connection::open(path.as_ref())?;
        missing_ledger_columns(&connection)
    }

    /// Lists required ledger columns missing from this store's database.
    pub fn verify_ledger_schema(&self) -> StoreResult<Vec<String>> {
        let connection = self.open_connection()?;
        missing_ledger_columns(&connection)
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn update_ledger_row<F>(&self, decision_id: &str, apply: F) -> StoreResult<LedgerRow>
    where
        F: FnOnce(&mut LedgerRow) -> StoreResult<bool>,
    {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut row = load_ledger_row(&transaction, decision_id)?
            .ok_or_else(|| StoreError::LedgerRowNotFound(decision_id.to_string()))?;
        if apply(&mut row)? {
            transaction.execute(
                r#"
                UPDATE publish_ledger
                SET status = ?1, external_id = ?2, skip_reason = ?3, permit_id = ?4,
                    updated_at = ?5, posted_at = ?6
                WHERE decision_id = ?7
                "#,
                params![
                    ledger_status_to_db(row.status),
                    row.external_id.as_ref().map(ExternalId::as_str),
                    row.skip_reason,
                    row.permit_id,
                    timestamp_to_db(row.updated_at),
                    option_timestamp_to_db(row.posted_at),
                    row.decision_id,
                ],
            )?;
        }
        transaction.commit()?;
        Ok(row)
    }
}

fn initialize_schema(connection: &Connection) -> StoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS publish_ledger (
            decision_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            external_id TEXT NULL,
            skip_reason TEXT NULL,
            permit_id TEXT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            posted_at TEXT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_publish_ledger_status
            ON publish_ledger (status, updated_at);

        CREATE TABLE IF NOT EXISTS permits (
            permit_id TEXT PRIMARY KEY,
            decision_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            external_id TEXT NULL,
            reason TEXT NULL,
            metadata_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_events (
            event_row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            decision_id TEXT NOT NULL,
            external_id TEXT NULL,
            detail_json TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            UNIQUE (event_type, decision_id)
        );
        "#,
    )?;
    Ok(())
}

fn missing_ledger_columns(connection: &Connection) -> StoreResult<Vec<String>> {
    let mut statement = connection.prepare("PRAGMA table_info(publish_ledger)")?;
    let present = statement
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(REQUIRED_LEDGER_COLUMNS
        .iter()
        .filter(|column| !present.iter().any(|name| name == *column))
        .map(|column| (*column).to_string())
        .collect())
}

#[async_trait]
impl PublishStore for SqlitePublishStore {
    async fn upsert_posting_attempt(&self, decision_id: &str) -> StoreResult<LedgerRow> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = load_ledger_row(&transaction, decision_id)? {
            transaction.commit()?;
            return Ok(existing);
        }

        let row = LedgerRow::posting_attempt(decision_id);
        transaction.execute(
            r#"
            INSERT INTO publish_ledger (
                decision_id, status, external_id, skip_reason, permit_id,
                created_at, updated_at, posted_at
            ) VALUES (?1, ?2, NULL, NULL, NULL, ?3, ?4, NULL)
            "#,
            params![
                row.decision_id,
                ledger_status_to_db(row.status),
                timestamp_to_db(row.created_at),
                timestamp_to_db(row.updated_at),
            ],
        )?;
        transaction.commit()?;
        Ok(row)
    }

    async fn get_ledger_row(&self, decision_id: &str) -> StoreResult<Option<LedgerRow>> {
        let connection = self.open_connection()?;
        load_ledger_row(&connection, decision_id)
    }

    async fn link_permit(&self, decision_id: &str, permit_id: &str) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let changed = connection.execute(
            "UPDATE publish_ledger SET permit_id = ?1, updated_at = ?2 WHERE decision_id = ?3",
            params![permit_id, timestamp_to_db(Utc::now()), decision_id],
        )?;
        if changed == 0 {
            return Err(StoreError::LedgerRowNotFound(decision_id.to_string()));
        }
        Ok(())
    }

    async fn mark_ledger_posted(
        &self,
        decision_id: &str,
        external_id: &ExternalId,
        permit_id: &str,
    ) -> StoreResult<LedgerRow> {
        self.update_ledger_row(decision_id, |row| {
            apply_ledger_transition(
                row,
                LedgerStatus::Posted,
                Some(external_id),
                Some(permit_id),
                None,
                Utc::now(),
            )
        })
    }

    async fn mark_ledger_failed(&self, decision_id: &str, reason: &str) -> StoreResult<LedgerRow> {
        self.update_ledger_row(decision_id, |row| {
            apply_ledger_transition(
                row,
                LedgerStatus::Failed,
                None,
                None,
                Some(reason),
                Utc::now(),
            )
        })
    }

    async fn mark_ledger_blocked(
        &self,
        decision_id: &str,
        reason: &str,
    ) -> StoreResult<LedgerRow> {
        self.update_ledger_row(decision_id, |row| {
            apply_ledger_transition(
                row,
                LedgerStatus::Blocked,
                None,
                None,
                Some(reason),
                Utc::now(),
            )
        })
    }

    async fn query_ledger(&self, query: LedgerQuery) -> StoreResult<Vec<LedgerRow>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {LEDGER_COLUMNS_SQL} FROM publish_ledger ORDER BY created_at, decision_id"
        ))?;
        let raw_rows = statement
            .query_map([], raw_ledger_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::new();
        for raw in raw_rows {
            if query.limit.is_some_and(|limit| rows.len() >= limit) {
                break;
            }
            let row = ledger_row_from_db(raw)?;
            if query.matches(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn create_permit(&self, permit: Permit) -> StoreResult<Permit> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = transaction
            .query_row(
                &format!("SELECT {PERMIT_COLUMNS_SQL} FROM permits WHERE decision_id = ?1"),
                params![permit.decision_id],
                raw_permit_row,
            )
            .optional()?;
        if let Some(raw) = existing {
            transaction.commit()?;
            return permit_from_db(raw);
        }

        transaction.execute(
            r#"
            INSERT INTO permits (
                permit_id, decision_id, status, external_id, reason, metadata_json,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                permit.permit_id,
                permit.decision_id,
                permit_status_to_db(permit.status),
                permit.external_id.as_ref().map(ExternalId::as_str),
                permit.reason,
                serde_json::to_string(&permit.metadata)?,
                timestamp_to_db(permit.created_at),
                timestamp_to_db(permit.updated_at),
            ],
        )?;
        transaction.commit()?;
        Ok(permit)
    }

    async fn get_permit(&self, permit_id: &str) -> StoreResult<Option<Permit>> {
        let connection = self.open_connection()?;
        connection
            .query_row(
                &format!("SELECT {PERMIT_COLUMNS_SQL} FROM permits WHERE permit_id = ?1"),
                params![permit_id],
                raw_permit_row,
            )
            .optional()?
            .map(permit_from_db)
            .transpose()
    }

    async fn get_permit_for_decision(&self, decision_id: &str) -> StoreResult<Option<Permit>> {
        let connection = self.open_connection()?;
        connection
            .query_row(
                &format!("SELECT {PERMIT_COLUMNS_SQL} FROM permits WHERE decision_id = ?1"),
                params![decision_id],
                raw_permit_row,
            )
            .optional()?
            .map(permit_from_db)
            .transpose()
    }

    async fn transition_permit(
        &self,
        permit_id: &str,
        next: PermitStatus,
        external_id: Option<&ExternalId>,
        reason: Option<&str>,
    ) -> StoreResult<Permit> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw = transaction
            .query_row(
                &format!("SELECT {PERMIT_COLUMNS_SQL} FROM permits WHERE permit_id = ?1"),
                params![permit_id],
                raw_permit_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::PermitNotFound(permit_id.to_string()))?;
        let mut permit = permit_from_db(raw)?;

        if apply_permit_transition(&mut permit, next, external_id, reason, Utc::now())? {
            transaction.execute(
                r#"
                UPDATE permits
                SET status = ?1, external_id = ?2, reason = ?3, updated_at = ?4
                WHERE permit_id = ?5
                "#,
                params![
                    permit_status_to_db(permit.status),
                    permit.external_id.as_ref().map(ExternalId::as_str),
                    permit.reason,
                    timestamp_to_db(permit.updated_at),
                    permit.permit_id,
                ],
            )?;
        }
        transaction.commit()?;
        Ok(permit)
    }

    async fn list_permits(&self) -> StoreResult<Vec<Permit>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {PERMIT_COLUMNS_SQL} FROM permits ORDER BY created_at, permit_id"
        ))?;
        let raw_rows = statement
            .query_map([], raw_permit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw_rows.into_iter().map(permit_from_db).collect()
    }

    async fn record_audit_event(&self, event: AuditEvent) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let inserted = connection.execute(
            r#"
            INSERT OR IGNORE INTO audit_events (
                event_type, decision_id, external_id, detail_json, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                event.event_type.as_str(),
                event.decision_id,
                event.external_id.as_ref().map(ExternalId::as_str),
                serde_json::to_string(&event.detail)?,
                timestamp_to_db(event.recorded_at),
            ],
        )?;
        Ok(inserted == 1)
    }

    async fn list_audit_events(&self, decision_id: Option<&str>) -> StoreResult<Vec<AuditEvent>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT event_type, decision_id, external_id, detail_json, recorded_at
            FROM audit_events
            WHERE ?1 IS NULL OR decision_id = ?1
            ORDER BY event_row_id
            "#,
        )?;
        let raw_rows = statement
            .query_map(params![decision_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw_rows
            .into_iter()
            .map(
                |(event_type, decision_id, external_id, detail_json, recorded_at)| {
                    Ok(AuditEvent {
                        event_type: audit_event_type_from_db(&event_type)?,
                        decision_id,
                        external_id: option_external_id_from_db(external_id)?,
                        detail: serde_json::from_str(&detail_json)?,
                        recorded_at: timestamp_from_db(&recorded_at)?,
                    })
                },
            )
            .collect()
    }
}

type RawLedgerRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
);

type RawPermitRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
);

fn raw_ledger_row(row: &Row<'_>) -> rusqlite::Result<RawLedgerRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn raw_permit_row(row: &Row<'_>) -> rusqlite::Result<RawPermitRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn load_ledger_row(connection: &Connection, decision_id: &str) -> StoreResult<Option<LedgerRow>> {
    connection
        .query_row(
            &format!("SELECT {LEDGER_COLUMNS_SQL} FROM publish_ledger WHERE decision_id = ?1"),
            params![decision_id],
            raw_ledger_row,
        )
        .optional()?
        .map(ledger_row_from_db)
        .transpose()
}

fn ledger_row_from_db(raw: RawLedgerRow) -> StoreResult<LedgerRow> {
    let (decision_id, status, external_id, skip_reason, permit_id, created_at, updated_at, posted_at) =
        raw;
    Ok(LedgerRow {
        decision_id,
        status: ledger_status_from_db(&status)?,
        external_id: option_external_id_from_db(external_id)?,
        skip_reason,
        permit_id,
        created_at: timestamp_from_db(&created_at)?,
        updated_at: timestamp_from_db(&updated_at)?,
        posted_at: option_timestamp_from_db(posted_at)?,
    })
}

fn permit_from_db(raw: RawPermitRow) -> StoreResult<Permit> {
    let (permit_id, decision_id, status, external_id, reason, metadata_json, created_at, updated_at) =
        raw;
    Ok(Permit {
        permit_id,
        decision_id,
        status: permit_status_from_db(&status)?,
        external_id: option_external_id_from_db(external_id)?,
        reason,
        metadata: serde_json::from_str(&metadata_json)?,
        created_at: timestamp_from_db(&created_at)?,
        updated_at: timestamp_from_db(&updated_at)?,
    })
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp_to_db)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn option_external_id_from_db(value: Option<String>) -> StoreResult<Option<ExternalId>> {
    value
        .map(|raw| {
            ExternalId::parse(&raw).map_err(|_| StoreError::InvalidPersistedValue {
                field: "external_id",
                value: raw,
            })
        })
        .transpose()
}

fn ledger_status_to_db(status: LedgerStatus) -> &'static str {
    status.as_str()
}

fn ledger_status_from_db(value: &str) -> StoreResult<LedgerStatus> {
    match value {
        "posting_attempt" => Ok(LedgerStatus::PostingAttempt),
        "posted" => Ok(LedgerStatus::Posted),
        "failed" => Ok(LedgerStatus::Failed),
        "blocked" => Ok(LedgerStatus::Blocked),
        _ => Err(StoreError::InvalidPersistedValue {
            field: "ledger_status",
            value: value.to_string(),
        }),
    }
}

fn permit_status_to_db(status: PermitStatus) -> &'static str {
    status.as_str()
}

fn permit_status_from_db(value: &str) -> StoreResult<PermitStatus> {
    match value {
        "pending" => Ok(PermitStatus::Pending),
        "approved" => Ok(PermitStatus::Approved),
        "used" => Ok(PermitStatus::Used),
        "failed" => Ok(PermitStatus::Failed),
        _ => Err(StoreError::InvalidPersistedValue {
            field: "permit_status",
            value: value.to_string(),
        }),
    }
}

fn audit_event_type_from_db(value: &str) -> StoreResult<AuditEventType> {
    AuditEventType::parse(value).ok_or_else(|| StoreError::InvalidPersistedValue {
        field: "audit_event_type",
        value: value.to_string(),
    })
}
