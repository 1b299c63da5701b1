//! Batch migration of stored records from legacy keys to ABIDs.
//!
//! Each batch is a single storage transaction opened before its page is read, so a
//! fatal error drops the in-flight batch and leaves earlier batches committed. Counters
//! reach the report only after their batch commits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::audit::PersistedIdentity;
use crate::codec::{Abid, AbidConfig};
use crate::derive::{derive, AbidField, Derivation};
use crate::error::{AbidError, StoreError};
use crate::source::{FieldValue, IdentifierSourceSpec, Naming, RecordType, RecordTypePlan};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_PROGRESS_EVERY: u64 = 10;

/// One row as loaded by a batch. `cursor` is the storage row order and stays stable
/// while the key column is rewritten.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoredRecord {
    pub cursor: i64,
    pub key: FieldValue,
    pub fields: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecordUpdate {
    pub cursor: i64,
    pub key: [u8; 16],
    pub fields: Vec<(String, FieldValue)>,
}

pub trait BackfillStore {
    type Batch<'a>: BackfillBatch
    where
        Self: 'a;

    /// # Errors
    /// Returns a [`StoreError`] when the record type's table cannot be counted.
    fn count(&mut self, record_type: &RecordType) -> Result<u64, StoreError>;

    /// Validate the layout and add any missing identity columns.
    ///
    /// # Errors
    /// Returns [`StoreError::Layout`] when the table cannot hold binary keys.
    fn prepare(
        &mut self,
        record_type: &RecordType,
        spec: &IdentifierSourceSpec,
    ) -> Result<(), StoreError>;

    /// # Errors
    /// Returns a [`StoreError`] when the transaction cannot be opened.
    fn begin_batch(&mut self) -> Result<Self::Batch<'_>, StoreError>;

    /// Transaction for read-only scans such as audits. Stores that take a write lock
    /// in [`BackfillStore::begin_batch`] should override this.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the transaction cannot be opened.
    fn begin_read(&mut self) -> Result<Self::Batch<'_>, StoreError> {
        self.begin_batch()
    }
}

/// A single storage transaction. Dropping it without [`BackfillBatch::commit`] rolls back.
#[allow(clippy::missing_errors_doc)]
pub trait BackfillBatch {
    fn load_page(
        &mut self,
        record_type: &RecordType,
        columns: &[String],
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    fn write(&mut self, record_type: &RecordType, update: &RecordUpdate) -> Result<(), StoreError>;

    fn delete(&mut self, record_type: &RecordType, cursor: i64) -> Result<(), StoreError>;

    fn read_identity(
        &mut self,
        record_type: &RecordType,
        cursor: i64,
    ) -> Result<Option<PersistedIdentity>, StoreError>;

    fn commit(self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct BackfillOptions {
    pub batch_size: usize,
    /// Log progress every N processed records; 0 disables progress logging.
    pub progress_every: u64,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE, progress_every: DEFAULT_PROGRESS_EVERY }
    }
}

impl BackfillOptions {
    /// # Errors
    /// Returns [`BackfillError::InvalidOptions`] for a zero batch size.
    pub fn validate(&self) -> Result<(), BackfillError> {
        if self.batch_size == 0 {
            return Err(BackfillError::InvalidOptions("batch_size must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("identity corruption on {key}: {reason}")]
    IdentityCorruption { key: String, reason: String },
    #[error("uniqueness violation on {key}: {message}")]
    UniqueViolation { key: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid backfill options: {0}")]
    InvalidOptions(String),
}

impl BackfillError {
    #[must_use]
    pub fn kind(&self) -> FatalKind {
        match self {
            Self::IdentityCorruption { .. } => FatalKind::IdentityCorruption,
            Self::UniqueViolation { .. } => FatalKind::UniqueViolation,
            Self::Store(StoreError::UniqueViolation(_)) => FatalKind::UniqueViolation,
            Self::Store(_) => FatalKind::Store,
            Self::InvalidOptions(_) => FatalKind::InvalidOptions,
        }
    }

    #[must_use]
    pub fn record_key(&self) -> Option<&str> {
        match self {
            Self::IdentityCorruption { key, .. } | Self::UniqueViolation { key, .. } => Some(key),
            Self::Store(_) | Self::InvalidOptions(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    IdentityCorruption,
    UniqueViolation,
    Store,
    InvalidOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FatalError {
    pub kind: FatalKind,
    pub record_type: String,
    pub record_key: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FallbackRecord {
    pub key: String,
    pub field: AbidField,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordFailure {
    pub key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationReport {
    pub record_type: String,
    pub total: u64,
    pub processed: u64,
    pub migrated: u64,
    pub unchanged: u64,
    pub deleted: Vec<String>,
    pub fallbacks: Vec<FallbackRecord>,
    pub failed: Vec<RecordFailure>,
    pub batches_committed: u64,
    pub fatal: Option<FatalError>,
}

impl MigrationReport {
    #[must_use]
    pub fn new(record_type: &str) -> Self {
        Self { record_type: record_type.to_string(), ..Self::default() }
    }

    /// No fatal error and no per-record failure.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && self.failed.is_empty()
    }

    fn merge(&mut self, tally: BatchTally, progress_every: u64) {
        let before = self.processed;
        self.processed += tally.processed;
        self.migrated += tally.migrated;
        self.unchanged += tally.unchanged;
        self.deleted.extend(tally.deleted);
        self.fallbacks.extend(tally.fallbacks);
        self.failed.extend(tally.failed);
        self.batches_committed += 1;

        if progress_every > 0 && self.processed / progress_every > before / progress_every {
            tracing::info!(
                "{}: processed {}/{} records ({} migrated, {} unchanged)",
                self.record_type,
                self.processed,
                self.total,
                self.migrated,
                self.unchanged
            );
        }
    }
}

#[derive(Debug, Default)]
struct BatchTally {
    processed: u64,
    migrated: u64,
    unchanged: u64,
    deleted: Vec<String>,
    fallbacks: Vec<FallbackRecord>,
    failed: Vec<RecordFailure>,
}

/// Migrate every record of one type. Fatal errors are reported in
/// [`MigrationReport::fatal`]; batches committed before them stay committed.
pub fn run<S: BackfillStore>(
    store: &mut S,
    config: &AbidConfig,
    record_type: &RecordType,
    spec: &IdentifierSourceSpec,
    options: &BackfillOptions,
) -> MigrationReport {
    let mut report = MigrationReport::new(&record_type.name);
    if let Err(err) = execute(store, config, record_type, spec, options, &mut report) {
        tracing::error!("{}: backfill aborted: {}", record_type.name, err);
        report.fatal = Some(FatalError {
            kind: err.kind(),
            record_type: record_type.name.clone(),
            record_key: err.record_key().map(ToString::to_string),
            message: err.to_string(),
        });
    }
    report
}

/// Run each plan entry in order, stopping after the first fatal error.
pub fn run_plan<S: BackfillStore>(
    store: &mut S,
    config: &AbidConfig,
    plans: &[&RecordTypePlan],
    options: &BackfillOptions,
) -> Vec<MigrationReport> {
    let mut reports = Vec::with_capacity(plans.len());
    for plan in plans {
        let report = run(store, config, &plan.record_type, &plan.source, options);
        let fatal = report.fatal.is_some();
        reports.push(report);
        if fatal {
            break;
        }
    }
    reports
}

fn execute<S: BackfillStore>(
    store: &mut S,
    config: &AbidConfig,
    record_type: &RecordType,
    spec: &IdentifierSourceSpec,
    options: &BackfillOptions,
    report: &mut MigrationReport,
) -> Result<(), BackfillError> {
    options.validate()?;
    record_type.validate()?;
    store.prepare(record_type, spec)?;
    report.total = store.count(record_type)?;

    let columns = record_type.columns(spec);
    let mut cursor = None;
    loop {
        let mut batch = store.begin_batch()?;
        let page = batch.load_page(record_type, &columns, cursor, options.batch_size)?;
        let Some(last) = page.last().map(|record| record.cursor) else {
            batch.commit()?;
            break;
        };

        let mut tally = BatchTally::default();
        for record in &page {
            migrate_record(&mut batch, config, record_type, spec, record, &mut tally)?;
        }
        batch.commit()?;
        report.merge(tally, options.progress_every);

        if page.len() < options.batch_size {
            break;
        }
        cursor = Some(last);
    }

    tracing::info!(
        "{}: backfill finished: {} migrated, {} unchanged, {} deleted, {} failed",
        record_type.name,
        report.migrated,
        report.unchanged,
        report.deleted.len(),
        report.failed.len()
    );
    Ok(())
}

fn migrate_record<B: BackfillBatch>(
    batch: &mut B,
    config: &AbidConfig,
    record_type: &RecordType,
    spec: &IdentifierSourceSpec,
    record: &StoredRecord,
    tally: &mut BatchTally,
) -> Result<(), BackfillError> {
    tally.processed += 1;
    let legacy_key = record_type.legacy_key(&record.key, &record.fields);
    let label = legacy_key.to_string();

    let mut fields = record.fields.clone();
    // A source naming the key column reads the legacy key, before and after migration.
    fields.insert(record_type.key_column.clone(), legacy_key.clone());
    let mut updates = Vec::new();
    if let Some(naming) = &record_type.naming {
        match naming.normalize(&mut fields) {
            Naming::Intact => {}
            Naming::Repaired(repairs) => updates.extend(repairs),
            Naming::Irrecoverable => {
                tracing::warn!(
                    "{} {}: deleting record with neither {} nor {}",
                    record_type.name,
                    label,
                    naming.name_column,
                    naming.slug_column
                );
                batch.delete(record_type, record.cursor)?;
                tally.deleted.push(label);
                return Ok(());
            }
        }
    }

    let inputs = spec.resolve(&record_type.name, &fields);
    let subject = record_type.subject(&record.key, &fields);
    let (derivation, expected) = match derive_identity(config, spec, &inputs, &subject) {
        Ok(derived) => derived,
        Err(err) => {
            tracing::warn!("Skipping {} {} - {}", record_type.name, label, err);
            tally.failed.push(RecordFailure { key: label, error: err.to_string() });
            return Ok(());
        }
    };
    tally.fallbacks.extend(
        derivation
            .fallbacks
            .iter()
            .map(|field| FallbackRecord { key: label.clone(), field: *field }),
    );

    let stash_legacy = !matches!(
        record.fields.get(&record_type.legacy_key_column),
        Some(value) if !value.is_null()
    );
    let current = PersistedIdentity::from_fields(record.key.clone(), &record.fields);
    if current == expected && updates.is_empty() && !stash_legacy {
        tally.unchanged += 1;
        return Ok(());
    }

    if stash_legacy {
        updates.push((record_type.legacy_key_column.clone(), legacy_key));
    }
    updates.extend(expected.to_fields());
    let update = RecordUpdate { cursor: record.cursor, key: derivation.abid.to_bytes(), fields: updates };
    batch.write(record_type, &update).map_err(|err| match err {
        StoreError::UniqueViolation(message) => BackfillError::UniqueViolation {
            key: format!("{label} -> {}", derivation.abid),
            message,
        },
        other => BackfillError::Store(other),
    })?;

    let stored = batch.read_identity(record_type, record.cursor)?;
    verify_round_trip(&derivation.abid, stored.as_ref())
        .map_err(|reason| BackfillError::IdentityCorruption { key: label, reason })?;
    tally.migrated += 1;
    Ok(())
}

fn derive_identity(
    config: &AbidConfig,
    spec: &IdentifierSourceSpec,
    inputs: &crate::derive::AbidInputs,
    subject: &crate::derive::SubjectFallbacks,
) -> Result<(Derivation, PersistedIdentity), AbidError> {
    let derivation = derive(config, spec.prefix.as_deref(), inputs, subject)?;
    let expected = PersistedIdentity::from_derivation(&derivation)?;
    Ok((derivation, expected))
}

/// The stored key and `abid` text must both decode to the derived value.
fn verify_round_trip(derived: &Abid, stored: Option<&PersistedIdentity>) -> Result<(), String> {
    let stored = stored.ok_or_else(|| "record is missing after write".to_string())?;
    let prefix = crate::codec::AbidPrefix::parse(derived.prefix()).map_err(|err| err.to_string())?;

    let FieldValue::Blob(bytes) = &stored.key else {
        return Err(format!("stored key {} is not binary", stored.key));
    };
    let from_key = Abid::from_bytes(&prefix, bytes).map_err(|err| err.to_string())?;
    if !from_key.equivalent(derived) {
        return Err(format!("stored key decodes to {from_key}, expected {derived}"));
    }

    let text = stored.abid.as_deref().ok_or_else(|| "stored abid text is empty".to_string())?;
    let from_text = Abid::parse(text).map_err(|err| err.to_string())?;
    if from_text != *derived {
        return Err(format!("stored abid {text} does not match {derived}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::ops::Bound;

    use super::*;
    use crate::source::{FieldSource, NamingRule, ABID_COLUMN};

    #[derive(Default)]
    struct MemoryStore {
        rows: BTreeMap<i64, StoredRecord>,
        corrupt_writes: bool,
        fail_commit_at: Option<u64>,
        commits: u64,
    }

    struct MemoryBatch<'a> {
        store: &'a mut MemoryStore,
        staged: BTreeMap<i64, StoredRecord>,
    }

    impl BackfillStore for MemoryStore {
        type Batch<'a> = MemoryBatch<'a>;

        fn count(&mut self, _record_type: &RecordType) -> Result<u64, StoreError> {
            Ok(self.rows.len() as u64)
        }

        fn prepare(
            &mut self,
            _record_type: &RecordType,
            _spec: &IdentifierSourceSpec,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn begin_batch(&mut self) -> Result<Self::Batch<'_>, StoreError> {
            let staged = self.rows.clone();
            Ok(MemoryBatch { store: self, staged })
        }
    }

    impl BackfillBatch for MemoryBatch<'_> {
        fn load_page(
            &mut self,
            _record_type: &RecordType,
            _columns: &[String],
            after: Option<i64>,
            limit: usize,
        ) -> Result<Vec<StoredRecord>, StoreError> {
            let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
            Ok(self
                .staged
                .range((lower, Bound::Unbounded))
                .take(limit)
                .map(|(_, record)| record.clone())
                .collect())
        }

        fn write(&mut self, _record_type: &RecordType, update: &RecordUpdate) -> Result<(), StoreError> {
            let mut key = update.key;
            if self.store.corrupt_writes {
                key[15] ^= 0xFF;
            }
            let key = FieldValue::Blob(key.to_vec());
            if self
                .staged
                .iter()
                .any(|(cursor, record)| *cursor != update.cursor && record.key == key)
            {
                return Err(StoreError::UniqueViolation(format!("duplicate key {key}")));
            }

            let Some(record) = self.staged.get_mut(&update.cursor) else {
                return Err(StoreError::Layout(format!("no row {}", update.cursor)));
            };
            record.key = key;
            for (column, value) in &update.fields {
                record.fields.insert(column.clone(), value.clone());
            }
            Ok(())
        }

        fn delete(&mut self, _record_type: &RecordType, cursor: i64) -> Result<(), StoreError> {
            self.staged.remove(&cursor);
            Ok(())
        }

        fn read_identity(
            &mut self,
            _record_type: &RecordType,
            cursor: i64,
        ) -> Result<Option<PersistedIdentity>, StoreError> {
            Ok(self
                .staged
                .get(&cursor)
                .map(|record| PersistedIdentity::from_fields(record.key.clone(), &record.fields)))
        }

        fn commit(self) -> Result<(), StoreError> {
            self.store.commits += 1;
            if self.store.fail_commit_at == Some(self.store.commits) {
                return Err(StoreError::Backend("disk I/O error".into()));
            }
            self.store.rows = self.staged;
            Ok(())
        }
    }

    fn text(value: &str) -> FieldValue {
        FieldValue::Text(value.to_string())
    }

    fn tag_type() -> RecordType {
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

    fn tag_spec() -> IdentifierSourceSpec {
        IdentifierSourceSpec {
            prefix: Some("tag_".to_string()),
            ts: FieldSource::Field { column: "created".to_string() },
            uri: FieldSource::Field { column: "slug".to_string() },
            subtype: FieldSource::Constant { value: text("03") },
            rand: FieldSource::Field { column: "old_id".to_string() },
        }
    }

    fn tag_row(id: i64, name: &str, slug: &str, created: Option<&str>) -> StoredRecord {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), text(name));
        fields.insert("slug".to_string(), text(slug));
        fields.insert("created".to_string(), created.map_or(FieldValue::Null, text));
        fields.insert("old_id".to_string(), FieldValue::Integer(id));
        StoredRecord { cursor: id, key: FieldValue::Integer(id), fields }
    }

    fn seeded(rows: Vec<StoredRecord>) -> MemoryStore {
        MemoryStore {
            rows: rows.into_iter().map(|row| (row.cursor, row)).collect(),
            ..MemoryStore::default()
        }
    }

    fn small_batches() -> BackfillOptions {
        BackfillOptions { batch_size: 2, progress_every: 1 }
    }

    fn fixture_rows() -> Vec<StoredRecord> {
        vec![
            tag_row(1, "News", "news", Some("2024-08-20 03:33:00")),
            tag_row(2, "Hello World", "", Some("2024-08-21 10:00:00")),
            tag_row(3, "", "", Some("2024-08-22 10:00:00")),
            tag_row(4, "Misc", "misc", None),
            tag_row(5, "", "rust", Some("2024-08-23 10:00:00")),
        ]
    }

    #[test]
    fn migrates_every_row_to_a_verifiable_identifier() {
        let mut store = seeded(fixture_rows());
        let report = run(&mut store, &AbidConfig::default(), &tag_type(), &tag_spec(), &small_batches());

        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.total, 5);
        assert_eq!(report.processed, 5);
        assert_eq!(report.migrated, 4);
        assert_eq!(report.deleted, vec!["3".to_string()]);
        assert_eq!(report.batches_committed, 3);
        assert_eq!(store.rows.len(), 4);

        for record in store.rows.values() {
            let identity = PersistedIdentity::from_fields(record.key.clone(), &record.fields);
            assert!(identity.is_migrated(), "{record:?}");
            assert_eq!(record.fields.get("old_id"), Some(&FieldValue::Integer(record.cursor)));
            assert_eq!(crate::audit::recompute(&AbidConfig::default(), &identity).err(), None);
        }

        let Some(repaired) = store.rows.get(&2) else { panic!("row 2 should survive") };
        assert_eq!(repaired.fields.get("slug"), Some(&text("hello_world")));
        let Some(renamed) = store.rows.get(&5) else { panic!("row 5 should survive") };
        assert_eq!(renamed.fields.get("name"), Some(&text("rust")));
    }

    #[test]
    fn legacy_key_is_stashed_before_replacement() {
        let mut row = tag_row(1, "News", "news", Some("2024-08-20 03:33:00"));
        row.fields.insert("old_id".to_string(), FieldValue::Null);
        let mut store = seeded(vec![row]);

        let first = run(&mut store, &AbidConfig::default(), &tag_type(), &tag_spec(), &small_batches());
        assert!(first.is_success(), "{first:?}");
        assert_eq!(first.fallbacks, vec![FallbackRecord { key: "1".to_string(), field: AbidField::Rand }]);
        let Some(migrated) = store.rows.get(&1) else { panic!("row 1 should survive") };
        assert_eq!(migrated.fields.get("old_id"), Some(&FieldValue::Integer(1)));

        // The stashed key now feeds `rand` directly and derives the same identifier.
        let second = run(&mut store, &AbidConfig::default(), &tag_type(), &tag_spec(), &small_batches());
        assert_eq!(second.unchanged, 1);
        assert!(second.fallbacks.is_empty());
    }

    #[test]
    fn key_column_source_reads_the_legacy_key() {
        let by_key = IdentifierSourceSpec { rand: FieldSource::Field { column: "id".to_string() }, ..tag_spec() };

        let mut keyed = seeded(fixture_rows());
        let first = run(&mut keyed, &AbidConfig::default(), &tag_type(), &by_key, &small_batches());
        assert!(first.is_success(), "{first:?}");
        assert!(first.fallbacks.iter().all(|fallback| fallback.field != AbidField::Rand), "{first:?}");

        let mut stashed = seeded(fixture_rows());
        run(&mut stashed, &AbidConfig::default(), &tag_type(), &tag_spec(), &small_batches());
        assert_eq!(keyed.rows, stashed.rows);

        // Once migrated the key is binary; the source still sees the legacy key.
        let second = run(&mut keyed, &AbidConfig::default(), &tag_type(), &by_key, &small_batches());
        assert_eq!(second.unchanged, 4);
        assert_eq!(second.migrated, 0);
        assert!(second.fallbacks.iter().all(|fallback| fallback.field != AbidField::Rand));
    }

    #[test]
    fn missing_timestamp_yields_a_reported_placeholder() {
        let mut store = seeded(fixture_rows());
        let report = run(&mut store, &AbidConfig::default(), &tag_type(), &tag_spec(), &small_batches());

        assert_eq!(
            report.fallbacks,
            vec![FallbackRecord { key: "4".to_string(), field: AbidField::Timestamp }]
        );
        let Some(row) = store.rows.get(&4) else { panic!("row 4 should survive") };
        let Some(FieldValue::Text(abid)) = row.fields.get(ABID_COLUMN) else {
            panic!("row 4 should carry abid text");
        };
        let parsed = Abid::parse(abid).unwrap_or_else(|err| panic!("stored abid parses: {err}"));
        assert!(parsed.is_placeholder());
    }

    #[test]
    fn rerun_is_a_no_op() {
        let mut store = seeded(fixture_rows());
        let first = run(&mut store, &AbidConfig::default(), &tag_type(), &tag_spec(), &small_batches());
        assert!(first.is_success());
        let after_first = store.rows.clone();

        let second = run(&mut store, &AbidConfig::default(), &tag_type(), &tag_spec(), &small_batches());
        assert!(second.is_success(), "{second:?}");
        assert_eq!(second.migrated, 0);
        assert_eq!(second.unchanged, 4);
        assert!(second.deleted.is_empty());
        assert_eq!(store.rows, after_first);
    }

    #[test]
    fn missing_prefix_fails_each_record_without_writing() {
        let mut store = seeded(fixture_rows());
        let before = store.rows.clone();
        let spec = IdentifierSourceSpec { prefix: Some("obj_".to_string()), ..tag_spec() };
        let report = run(&mut store, &AbidConfig::default(), &tag_type(), &spec, &small_batches());

        assert!(report.fatal.is_none());
        assert_eq!(report.failed.len(), 4);
        assert!(report.failed[0].error.contains("Tag.abid_prefix must be defined"));
        assert_eq!(report.migrated, 0);
        assert!(!report.is_success());
        // The irrecoverable row is still removed; naming runs before derivation.
        assert_eq!(store.rows.len(), before.len() - 1);
        assert!(store.rows.values().all(|record| matches!(record.key, FieldValue::Integer(_))));
    }

    #[test]
    fn colliding_identifiers_abort_and_roll_back_the_batch() {
        let mut store = seeded(vec![
            tag_row(1, "News", "news", Some("2024-08-20 03:33:00")),
            tag_row(2, "News", "news", Some("2024-08-20 03:33:00")),
        ]);
        let before = store.rows.clone();
        let spec = IdentifierSourceSpec { rand: FieldSource::Constant { value: text("ABCDEF") }, ..tag_spec() };
        let report = run(&mut store, &AbidConfig::default(), &tag_type(), &spec, &small_batches());

        let Some(fatal) = report.fatal else { panic!("collision should be fatal") };
        assert_eq!(fatal.kind, FatalKind::UniqueViolation);
        assert_eq!(fatal.record_type, "Tag");
        assert!(fatal.record_key.is_some_and(|key| key.starts_with("2 -> tag_")));
        assert_eq!(report.batches_committed, 0);
        assert_eq!(report.migrated, 0);
        assert_eq!(store.rows, before);
    }

    #[test]
    fn corrupted_writes_are_detected_and_rolled_back() {
        let mut store = seeded(fixture_rows());
        store.corrupt_writes = true;
        let before = store.rows.clone();
        let report = run(&mut store, &AbidConfig::default(), &tag_type(), &tag_spec(), &small_batches());

        let Some(fatal) = report.fatal else { panic!("corruption should be fatal") };
        assert_eq!(fatal.kind, FatalKind::IdentityCorruption);
        assert_eq!(fatal.record_key.as_deref(), Some("1"));
        assert_eq!(store.rows, before);
    }

    #[test]
    fn interrupted_run_resumes_from_committed_batches() {
        let mut store = seeded(fixture_rows());
        store.fail_commit_at = Some(2);
        let interrupted = run(&mut store, &AbidConfig::default(), &tag_type(), &tag_spec(), &small_batches());

        let Some(fatal) = interrupted.fatal else { panic!("commit failure should be fatal") };
        assert_eq!(fatal.kind, FatalKind::Store);
        assert_eq!(interrupted.batches_committed, 1);
        assert_eq!(interrupted.migrated, 2);

        store.fail_commit_at = None;
        let resumed = run(&mut store, &AbidConfig::default(), &tag_type(), &tag_spec(), &small_batches());
        assert!(resumed.is_success(), "{resumed:?}");
        assert_eq!(resumed.unchanged, 2);
        assert_eq!(resumed.migrated, 2);
        assert_eq!(resumed.deleted, vec!["3".to_string()]);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut store = seeded(fixture_rows());
        let options = BackfillOptions { batch_size: 0, progress_every: 0 };
        let report = run(&mut store, &AbidConfig::default(), &tag_type(), &tag_spec(), &options);

        assert_eq!(report.fatal.map(|fatal| fatal.kind), Some(FatalKind::InvalidOptions));
        assert_eq!(store.commits, 0);
    }

    #[test]
    fn plan_stops_after_a_fatal_record_type() {
        let mut store = seeded(fixture_rows());
        let broken = RecordTypePlan {
            record_type: RecordType { table: "bad table".to_string(), ..tag_type() },
            source: tag_spec(),
        };
        let good = RecordTypePlan { record_type: tag_type(), source: tag_spec() };
        let reports = run_plan(&mut store, &AbidConfig::default(), &[&broken, &good], &small_batches());

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].fatal.as_ref().map(|fatal| fatal.kind), Some(FatalKind::Store));
    }
}
