use std::collections::BTreeMap;
use std::path::Path;

use abid_core::source::{is_simple_identifier, IDENTITY_COLUMNS};
use abid_core::{
    audit_store, run, run_plan, AbidConfig, AuditReport, BackfillBatch, BackfillOptions,
    BackfillStore, FieldSource, FieldValue, IdentifierSourceSpec, MigrationReport, NamingRule,
    PersistedIdentity, RecordType, RecordTypePlan, RecordUpdate, StoreError, StoredRecord,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 3;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS core_snapshot (
  id INTEGER PRIMARY KEY,
  url TEXT NOT NULL UNIQUE,
  title TEXT,
  added TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS core_tag (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL DEFAULT '',
  slug TEXT NOT NULL DEFAULT '',
  created TEXT
);

CREATE TABLE IF NOT EXISTS core_snapshot_tags (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  snapshot_id INTEGER NOT NULL,
  tag_id INTEGER NOT NULL,
  UNIQUE(snapshot_id, tag_id),
  FOREIGN KEY (snapshot_id) REFERENCES core_snapshot(id) ON DELETE CASCADE,
  FOREIGN KEY (tag_id) REFERENCES core_tag(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_core_snapshot_tags_tag ON core_snapshot_tags(tag_id);
";

// `id` is declared BLOB so it is not a rowid alias: keys can be rewritten in place
// while rowid pagination stays stable. `abid_rand` has no declared type so integer and
// text seeds keep their storage class.
const MIGRATION_002_CREATE_V2_TABLES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS core_tag_v2 (
  id BLOB PRIMARY KEY NOT NULL,
  old_id INTEGER UNIQUE,
  name TEXT NOT NULL DEFAULT '',
  slug TEXT NOT NULL DEFAULT '',
  created TEXT,
  abid TEXT,
  abid_prefix TEXT,
  abid_ts TEXT,
  abid_uri TEXT,
  abid_subtype TEXT,
  abid_rand
);

CREATE TABLE IF NOT EXISTS core_snapshot_tags_v2 (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  snapshot_id INTEGER NOT NULL,
  tag_id BLOB NOT NULL,
  UNIQUE(snapshot_id, tag_id),
  FOREIGN KEY (snapshot_id) REFERENCES core_snapshot(id) ON DELETE CASCADE,
  FOREIGN KEY (tag_id) REFERENCES core_tag_v2(id) ON UPDATE CASCADE ON DELETE CASCADE
);
";

const MIGRATION_002_COPY_ROWS_SQL: &str = r"
INSERT INTO core_tag_v2(id, old_id, name, slug, created)
SELECT id, id, name, slug, created FROM core_tag ORDER BY id;

INSERT INTO core_snapshot_tags_v2(id, snapshot_id, tag_id)
SELECT id, snapshot_id, tag_id FROM core_snapshot_tags ORDER BY id;
";

const MIGRATION_002_REPLACE_TABLES_SQL: &str = r"
DROP TABLE core_snapshot_tags;
DROP TABLE core_tag;

ALTER TABLE core_tag_v2 RENAME TO core_tag;
ALTER TABLE core_snapshot_tags_v2 RENAME TO core_snapshot_tags;
";

const MIGRATION_002_FINAL_INDEXES_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_core_snapshot_tags_tag ON core_snapshot_tags(tag_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_core_tag_abid ON core_tag(abid);
";

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
pub struct MigrationOutcome {
    pub before: SchemaStatus,
    pub after: SchemaStatus,
    /// Present when the tag backfill (v3) ran.
    pub backfill: Option<MigrationReport>,
}

impl MigrationOutcome {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.after.pending_versions.is_empty()
            && self.backfill.iter().all(MigrationReport::is_success)
    }
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
    pub unmigrated_tags: i64,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagRow {
    pub key: String,
    pub abid: Option<String>,
    pub old_id: Option<i64>,
    pub name: String,
    pub slug: String,
    pub created: Option<String>,
    pub snapshots: i64,
}

/// The archive's tag table as migrated by schema v3.
#[must_use]
pub fn tag_record_type() -> RecordType {
    RecordType {
        name: "Tag".to_string(),
        table: "core_tag".to_string(),
        key_column: "id".to_string(),
        legacy_key_column: "old_id".to_string(),
        secondary_id_column: None,
        display_column: None,
        naming: Some(NamingRule { name_column: "name".to_string(), slug_column: "slug".to_string() }),
    }
}

#[must_use]
pub fn tag_source_spec() -> IdentifierSourceSpec {
    IdentifierSourceSpec {
        prefix: Some("tag_".to_string()),
        ts: FieldSource::Field { column: "created".to_string() },
        uri: FieldSource::Field { column: "slug".to_string() },
        subtype: FieldSource::Constant { value: FieldValue::Text("03".to_string()) },
        rand: FieldSource::Field { column: "old_id".to_string() },
    }
}

impl SqliteStore {
    /// Open a SQLite archive database and configure required runtime pragmas.
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
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
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

    /// Apply all forward migrations. Version 3 is the tag backfill; it is recorded only
    /// when the backfill succeeds, so an interrupted run resumes on the next call.
    ///
    /// # Errors
    /// Returns an error when bootstrapping or a structural migration fails. Backfill
    /// failures are reported in [`MigrationOutcome::backfill`] instead.
    pub fn migrate(
        &mut self,
        config: &AbidConfig,
        options: &BackfillOptions,
    ) -> Result<MigrationOutcome> {
        let before = self.schema_status()?;
        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        let mut backfill = None;
        if version < 3 {
            let report = self.apply_migration_3(config, options)?;
            version = current_schema_version(&self.conn)?;
            backfill = Some(report);
        }

        let complete = backfill.iter().all(MigrationReport::is_success);
        if complete && version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(MigrationOutcome { before, after: self.schema_status()?, backfill })
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "core_tag")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "core_tag", "old_id")? {
            // Tag table already rebuilt but never recorded; the backfill decides v3.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        if table_has_column(&self.conn, "core_tag", "id")? {
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: core_tag has neither id nor old_id"))
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "core_tag", "old_id")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        if !table_has_column(&self.conn, "core_tag", "id")? {
            return Err(anyhow!("cannot apply migration v2: legacy core_tag.id column is missing"));
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        tx.execute_batch(MIGRATION_002_CREATE_V2_TABLES_SQL)
            .context("failed to create v2 staging tables")?;
        tx.execute_batch(MIGRATION_002_COPY_ROWS_SQL)
            .context("failed to copy tag rows into v2 tables")?;
        tx.execute_batch(MIGRATION_002_REPLACE_TABLES_SQL)
            .context("failed to replace legacy tables with v2 tables")?;
        tx.execute_batch(MIGRATION_002_FINAL_INDEXES_SQL).context("failed to create v2 indexes")?;

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now],
        )
        .context("failed to record migration version 2")?;

        tx.commit().context("failed to commit migration v2")?;
        tracing::info!("applied schema migration 2 (core_tag rebuilt with binary keys)");
        Ok(())
    }

    fn apply_migration_3(
        &mut self,
        config: &AbidConfig,
        options: &BackfillOptions,
    ) -> Result<MigrationReport> {
        let report = run(self, config, &tag_record_type(), &tag_source_spec(), options);
        if report.is_success() {
            record_schema_version(&self.conn, 3)?;
            tracing::info!(
                "applied schema migration 3 ({} tags migrated, {} deleted)",
                report.migrated,
                report.deleted.len()
            );
        } else {
            tracing::warn!("schema migration 3 incomplete; rerun migrate to resume the tag backfill");
        }
        Ok(report)
    }

    /// Run a backfill plan against this database, one record type at a time.
    #[must_use]
    pub fn backfill(
        &mut self,
        config: &AbidConfig,
        plans: &[&RecordTypePlan],
        options: &BackfillOptions,
    ) -> Vec<MigrationReport> {
        run_plan(self, config, plans, options)
    }

    /// Recompute every stored identifier of `record_type` from its persisted inputs.
    ///
    /// # Errors
    /// Returns an error when the records cannot be read.
    pub fn audit(
        &mut self,
        config: &AbidConfig,
        record_type: &RecordType,
        page_size: usize,
    ) -> Result<AuditReport> {
        audit_store(self, config, record_type, page_size)
            .with_context(|| format!("failed to audit {}", record_type.name))
    }

    /// List tags with their identifiers and how many snapshots reference each one.
    ///
    /// # Errors
    /// Returns an error when the tag table has not been rebuilt yet or the query fails.
    pub fn list_tags(&self) -> Result<Vec<TagRow>> {
        if !table_has_column(&self.conn, "core_tag", "abid")? {
            return Err(anyhow!("core_tag has no abid column; run `db migrate` first"));
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT t.id, t.abid, t.old_id, t.name, t.slug, t.created,
                        (SELECT COUNT(*) FROM core_snapshot_tags st WHERE st.tag_id = t.id)
                 FROM core_tag t
                 ORDER BY t.rowid ASC",
            )
            .context("failed to prepare tag listing")?;
        let rows = stmt.query_map([], |row| {
            Ok(TagRow {
                key: field_from_sql(row.get::<_, Value>(0)?).to_string(),
                abid: row.get(1)?,
                old_id: row.get(2)?,
                name: row.get(3)?,
                slug: row.get(4)?,
                created: row.get(5)?,
                snapshots: row.get(6)?,
            })
        })?;

        let mut tags = Vec::new();
        for row in rows {
            tags.push(row.context("failed to decode tag row")?);
        }
        Ok(tags)
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
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

        let unmigrated_tags = if table_has_column(&self.conn, "core_tag", "abid")? {
            self.conn
                .query_row("SELECT COUNT(*) FROM core_tag WHERE abid IS NULL", [], |row| row.get(0))
                .context("failed to count unmigrated tags")?
        } else if table_exists(&self.conn, "core_tag")? {
            self.conn
                .query_row("SELECT COUNT(*) FROM core_tag", [], |row| row.get(0))
                .context("failed to count legacy tags")?
        } else {
            0
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            unmigrated_tags,
            schema_status,
        })
    }
}

pub struct SqliteBatch<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl BackfillStore for SqliteStore {
    type Batch<'a> = SqliteBatch<'a>;

    fn count(&mut self, record_type: &RecordType) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", record_type.table), [], |row| row.get(0))
            .map_err(store_error)?;
        u64::try_from(count).map_err(|err| StoreError::Backend(Box::new(err)))
    }

    fn prepare(
        &mut self,
        record_type: &RecordType,
        _spec: &IdentifierSourceSpec,
    ) -> Result<(), StoreError> {
        let table = &record_type.table;
        let columns = table_columns(&self.conn, table).map_err(store_error)?;
        if columns.is_empty() {
            return Err(StoreError::Layout(format!("table {table} does not exist")));
        }

        let Some(key) = columns.iter().find(|column| column.name == record_type.key_column) else {
            return Err(StoreError::Layout(format!(
                "{table} has no key column {}",
                record_type.key_column
            )));
        };
        let primary_keys = columns.iter().filter(|column| column.pk > 0).count();
        if key.pk > 0 && primary_keys == 1 && key.declared_type.eq_ignore_ascii_case("INTEGER") {
            return Err(StoreError::Layout(format!(
                "{table}.{} aliases the rowid and cannot hold binary keys; rebuild the table first",
                record_type.key_column
            )));
        }

        self.conn
            .query_row(&format!("SELECT COUNT(rowid) FROM {table}"), [], |row| row.get::<_, i64>(0))
            .map_err(|_| StoreError::Layout(format!("{table} has no rowid to page by")))?;

        let mut missing = Vec::new();
        for column in std::iter::once(record_type.legacy_key_column.as_str()).chain(IDENTITY_COLUMNS) {
            if !columns.iter().any(|existing| existing.name == column) {
                missing.push(column);
            }
        }
        for column in missing {
            tracing::info!("adding column {}.{}", table, column);
            self.conn
                .execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column}"))
                .map_err(store_error)?;
        }
        self.conn
            .execute_batch(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_abid ON {table}(abid)"
            ))
            .map_err(store_error)?;
        Ok(())
    }

    fn begin_batch(&mut self) -> Result<Self::Batch<'_>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(store_error)?;
        Ok(SqliteBatch { tx })
    }

    fn begin_read(&mut self) -> Result<Self::Batch<'_>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(store_error)?;
        Ok(SqliteBatch { tx })
    }
}

impl BackfillBatch for SqliteBatch<'_> {
    fn load_page(
        &mut self,
        record_type: &RecordType,
        columns: &[String],
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let existing = table_columns(&self.tx, &record_type.table).map_err(store_error)?;
        let selected: Vec<&String> = columns
            .iter()
            .filter(|column| **column != record_type.key_column)
            .filter(|column| existing.iter().any(|existing| existing.name == **column))
            .collect();

        let mut projection = format!("rowid, {}", record_type.key_column);
        for column in &selected {
            projection.push_str(", ");
            projection.push_str(column);
        }
        let sql = format!(
            "SELECT {projection} FROM {} WHERE rowid > ?1 ORDER BY rowid ASC LIMIT ?2",
            record_type.table
        );

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.tx.prepare(&sql).map_err(store_error)?;
        let mut rows = stmt.query(params![after.unwrap_or(i64::MIN), limit]).map_err(store_error)?;

        let mut page = Vec::new();
        while let Some(row) = rows.next().map_err(store_error)? {
            let cursor: i64 = row.get(0).map_err(store_error)?;
            let key = field_from_sql(row.get(1).map_err(store_error)?);
            let mut fields = BTreeMap::new();
            for (index, column) in selected.iter().enumerate() {
                let value = row.get::<_, Value>(index + 2).map_err(store_error)?;
                fields.insert((*column).clone(), field_from_sql(value));
            }
            for column in columns {
                if *column != record_type.key_column {
                    fields.entry(column.clone()).or_insert(FieldValue::Null);
                }
            }
            page.push(StoredRecord { cursor, key, fields });
        }
        Ok(page)
    }

    fn write(&mut self, record_type: &RecordType, update: &RecordUpdate) -> Result<(), StoreError> {
        let mut assignments = vec![format!("{} = ?", record_type.key_column)];
        let mut values = vec![Value::Blob(update.key.to_vec())];
        for (column, value) in &update.fields {
            if !is_simple_identifier(column) {
                return Err(StoreError::Layout(format!("{column:?} is not a simple identifier")));
            }
            assignments.push(format!("{column} = ?"));
            values.push(field_to_sql(value));
        }
        values.push(Value::Integer(update.cursor));

        let sql = format!(
            "UPDATE {} SET {} WHERE rowid = ?",
            record_type.table,
            assignments.join(", ")
        );
        let changed = self.tx.execute(&sql, params_from_iter(values)).map_err(store_error)?;
        if changed != 1 {
            return Err(StoreError::Layout(format!(
                "{}: expected to update row {}, updated {changed}",
                record_type.table, update.cursor
            )));
        }
        Ok(())
    }

    fn delete(&mut self, record_type: &RecordType, cursor: i64) -> Result<(), StoreError> {
        self.tx
            .execute(&format!("DELETE FROM {} WHERE rowid = ?1", record_type.table), params![cursor])
            .map_err(store_error)?;
        Ok(())
    }

    fn read_identity(
        &mut self,
        record_type: &RecordType,
        cursor: i64,
    ) -> Result<Option<PersistedIdentity>, StoreError> {
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE rowid = ?1",
            record_type.key_column,
            IDENTITY_COLUMNS.join(", "),
            record_type.table
        );
        self.tx
            .query_row(&sql, params![cursor], |row| {
                let key = field_from_sql(row.get(0)?);
                let mut fields = BTreeMap::new();
                for (index, column) in IDENTITY_COLUMNS.iter().enumerate() {
                    fields.insert((*column).to_string(), field_from_sql(row.get(index + 1)?));
                }
                Ok(PersistedIdentity::from_fields(key, &fields))
            })
            .optional()
            .map_err(store_error)
    }

    fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().map_err(store_error)
    }
}

fn store_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == ErrorCode::ConstraintViolation
                && matches!(
                    failure.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                ) =>
        {
            StoreError::UniqueViolation(message.clone().unwrap_or_else(|| failure.to_string()))
        }
        _ => StoreError::Backend(Box::new(err)),
    }
}

fn field_from_sql(value: Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Integer(value) => FieldValue::Integer(value),
        Value::Real(value) => FieldValue::Text(value.to_string()),
        Value::Text(value) => FieldValue::Text(value),
        Value::Blob(value) => FieldValue::Blob(value),
    }
}

fn field_to_sql(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Integer(value) => Value::Integer(*value),
        FieldValue::Text(value) => Value::Text(value.clone()),
        FieldValue::Blob(value) => Value::Blob(value.clone()),
    }
}

struct ColumnInfo {
    name: String,
    declared_type: String,
    pk: i64,
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo { name: row.get(1)?, declared_type: row.get(2)?, pk: row.get(5)? })
    })?;
    rows.collect()
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)
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

    let columns = table_columns(conn, table)
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    Ok(columns.iter().any(|existing| existing.name == column))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
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

    if !table_exists(conn, "core_tag")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "core_tag", "old_id")? {
        return Ok((2, true));
    }

    if table_has_column(conn, "core_tag", "id")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: core_tag has neither id nor old_id"))
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
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
