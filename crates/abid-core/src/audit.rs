//! Recompute identifiers from persisted inputs and compare them with what is stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::backfill::{BackfillBatch, BackfillStore};
use crate::codec::{abid_from_values, Abid, AbidConfig, AbidPrefix};
use crate::derive::Derivation;
use crate::error::{AbidError, StoreError};
use crate::source::{
    FieldValue, RecordType, ABID_COLUMN, IDENTITY_COLUMNS, ABID_PREFIX_COLUMN, ABID_RAND_COLUMN, ABID_SUBTYPE_COLUMN,
    ABID_TS_COLUMN, ABID_URI_COLUMN,
};

/// Identity state of one stored record: its key plus the identity columns.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PersistedIdentity {
    pub key: FieldValue,
    pub abid: Option<String>,
    pub prefix: Option<String>,
    pub ts: Option<String>,
    pub uri: Option<String>,
    pub subtype: Option<String>,
    /// Kept as stored: integer seeds stay INTEGER and text seeds stay TEXT, so a
    /// signed text seed is not read back as a number.
    pub rand: FieldValue,
}

impl PersistedIdentity {
    /// The state a record should have after `derivation` was written.
    ///
    /// # Errors
    /// Returns [`AbidError::TimestampOutOfRange`] when the timestamp cannot be formatted.
    pub fn from_derivation(derivation: &Derivation) -> Result<Self, AbidError> {
        let inputs = &derivation.inputs;
        let ts = inputs
            .ts
            .format(&Rfc3339)
            .map_err(|_| AbidError::TimestampOutOfRange(inputs.ts.to_string()))?;
        Ok(Self {
            key: FieldValue::Blob(derivation.abid.to_bytes().to_vec()),
            abid: Some(derivation.abid.to_string()),
            prefix: Some(inputs.prefix.to_string()),
            ts: Some(ts),
            uri: Some(inputs.uri.clone()),
            subtype: Some(inputs.subtype.clone()),
            rand: FieldValue::from(inputs.rand.clone()),
        })
    }

    #[must_use]
    pub fn from_fields(key: FieldValue, fields: &BTreeMap<String, FieldValue>) -> Self {
        let text = |column: &str| fields.get(column).and_then(FieldValue::as_text);
        Self {
            key,
            abid: text(ABID_COLUMN),
            prefix: text(ABID_PREFIX_COLUMN),
            ts: text(ABID_TS_COLUMN),
            uri: text(ABID_URI_COLUMN),
            subtype: text(ABID_SUBTYPE_COLUMN),
            rand: fields.get(ABID_RAND_COLUMN).cloned().unwrap_or_default(),
        }
    }

    /// Identity column updates, key excluded.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, FieldValue)> {
        let mut fields: Vec<(String, FieldValue)> = [
            (ABID_COLUMN, &self.abid),
            (ABID_PREFIX_COLUMN, &self.prefix),
            (ABID_TS_COLUMN, &self.ts),
            (ABID_URI_COLUMN, &self.uri),
            (ABID_SUBTYPE_COLUMN, &self.subtype),
        ]
        .into_iter()
        .map(|(column, value)| {
            let value = value.clone().map_or(FieldValue::Null, FieldValue::Text);
            (column.to_string(), value)
        })
        .collect();
        fields.push((ABID_RAND_COLUMN.to_string(), self.rand.clone()));
        fields
    }

    #[must_use]
    pub fn is_migrated(&self) -> bool {
        self.abid.is_some() && matches!(self.key, FieldValue::Blob(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AuditIssue {
    #[error("record has not been migrated")]
    Unmigrated,
    #[error("persisted inputs are unusable: {0}")]
    InvalidInputs(String),
    #[error("stored key {stored} does not match recomputed {expected}")]
    KeyMismatch { stored: String, expected: String },
    #[error("stored abid {stored} does not match recomputed {expected}")]
    TextMismatch { stored: String, expected: String },
}

/// Recompute the identifier from the persisted inputs and check it against the stored
/// key and `abid` text.
///
/// # Errors
/// Returns the first [`AuditIssue`] found.
pub fn recompute(config: &AbidConfig, identity: &PersistedIdentity) -> Result<Abid, AuditIssue> {
    let FieldValue::Blob(stored_key) = &identity.key else {
        return Err(AuditIssue::Unmigrated);
    };
    let Some(stored_text) = identity.abid.as_deref() else {
        return Err(AuditIssue::Unmigrated);
    };

    let invalid = |err: AbidError| AuditIssue::InvalidInputs(err.to_string());
    let missing = |column: &str| AuditIssue::InvalidInputs(format!("{column} is empty"));

    let prefix = AbidPrefix::parse(identity.prefix.as_deref().ok_or_else(|| missing(ABID_PREFIX_COLUMN))?)
        .map_err(invalid)?;
    let ts_text = identity.ts.as_deref().ok_or_else(|| missing(ABID_TS_COLUMN))?;
    let ts = OffsetDateTime::parse(ts_text, &Rfc3339)
        .map_err(|err| AuditIssue::InvalidInputs(format!("{ABID_TS_COLUMN} {ts_text:?}: {err}")))?;
    let uri = identity.uri.as_deref().ok_or_else(|| missing(ABID_URI_COLUMN))?;
    let subtype = identity.subtype.as_deref().ok_or_else(|| missing(ABID_SUBTYPE_COLUMN))?;
    let rand = identity.rand.to_rand_seed().ok_or_else(|| missing(ABID_RAND_COLUMN))?;

    let expected = abid_from_values(config, &prefix, ts, uri, subtype, &rand)
        .map_err(invalid)?;

    let stored = Abid::from_bytes(&prefix, stored_key).map_err(invalid)?;
    if !stored.equivalent(&expected) {
        return Err(AuditIssue::KeyMismatch {
            stored: stored.to_string(),
            expected: expected.to_string(),
        });
    }
    if stored_text != expected.to_string() {
        return Err(AuditIssue::TextMismatch {
            stored: stored_text.to_string(),
            expected: expected.to_string(),
        });
    }
    Ok(expected)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditMismatch {
    pub key: String,
    pub issue: AuditIssue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditReport {
    pub record_type: String,
    pub checked: u64,
    pub unmigrated: u64,
    pub mismatches: Vec<AuditMismatch>,
}

impl AuditReport {
    #[must_use]
    pub fn new(record_type: &str) -> Self {
        Self { record_type: record_type.to_string(), ..Self::default() }
    }

    pub fn record(&mut self, config: &AbidConfig, identity: &PersistedIdentity) {
        self.checked += 1;
        match recompute(config, identity) {
            Ok(_) => {}
            Err(AuditIssue::Unmigrated) => self.unmigrated += 1,
            Err(issue) => {
                tracing::warn!("{} {}: audit failed: {}", self.record_type, identity.key, issue);
                self.mismatches.push(AuditMismatch { key: identity.key.to_string(), issue });
            }
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Audit every stored record of one type inside a single read transaction opened with
/// [`BackfillStore::begin_read`].
///
/// # Errors
/// Returns a [`StoreError`] when the records cannot be read.
pub fn audit_store<S: BackfillStore>(
    store: &mut S,
    config: &AbidConfig,
    record_type: &RecordType,
    page_size: usize,
) -> Result<AuditReport, StoreError> {
    record_type.validate()?;
    let mut columns = vec![record_type.key_column.clone()];
    columns.extend(IDENTITY_COLUMNS.iter().map(ToString::to_string));

    let mut report = AuditReport::new(&record_type.name);
    let mut batch = store.begin_read()?;
    let mut cursor = None;
    loop {
        let page = batch.load_page(record_type, &columns, cursor, page_size.max(1))?;
        for record in &page {
            report.record(config, &PersistedIdentity::from_fields(record.key.clone(), &record.fields));
        }
        match page.last() {
            Some(last) if page.len() >= page_size.max(1) => cursor = Some(last.cursor),
            _ => break,
        }
    }
    batch.commit()?;
    Ok(report)
}
