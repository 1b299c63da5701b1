//! Declarative description of where each identifier input comes from.
//!
//! Sources are a closed set of column lookups and simple transforms. Nothing here
//! evaluates expressions.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::codec::RandSeed;
use crate::derive::{AbidInputs, SubjectFallbacks};
use crate::error::StoreError;

pub const ABID_COLUMN: &str = "abid";
pub const ABID_PREFIX_COLUMN: &str = "abid_prefix";
pub const ABID_TS_COLUMN: &str = "abid_ts";
pub const ABID_URI_COLUMN: &str = "abid_uri";
pub const ABID_SUBTYPE_COLUMN: &str = "abid_subtype";
pub const ABID_RAND_COLUMN: &str = "abid_rand";

pub const IDENTITY_COLUMNS: [&str; 6] = [
    ABID_COLUMN,
    ABID_PREFIX_COLUMN,
    ABID_TS_COLUMN,
    ABID_URI_COLUMN,
    ABID_SUBTYPE_COLUMN,
    ABID_RAND_COLUMN,
];

/// A single column value as read from storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl FieldValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Null, empty text, and whitespace-only text are all "absent".
    #[must_use]
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(text) => text.trim().is_empty(),
            Self::Integer(_) | Self::Blob(_) => false,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Integer(value) => Some(value.to_string()),
            Self::Text(text) => Some(text.clone()),
            Self::Blob(_) => Some(self.to_string()),
        }
    }

    #[must_use]
    pub fn to_rand_seed(&self) -> Option<RandSeed> {
        if self.is_absent() {
            return None;
        }
        Some(match self {
            Self::Integer(value) => RandSeed::Integer(*value),
            Self::Blob(bytes) => match Uuid::from_slice(bytes) {
                Ok(uuid) => RandSeed::Uuid(uuid),
                Err(_) => RandSeed::Text(hex::encode(bytes)),
            },
            Self::Text(text) => RandSeed::Text(text.trim().to_string()),
            Self::Null => return None,
        })
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
            Self::Blob(bytes) => match Uuid::from_slice(bytes) {
                Ok(uuid) => write!(f, "{}", uuid.hyphenated()),
                Err(_) => write!(f, "x'{}'", hex::encode(bytes)),
            },
        }
    }
}

impl From<RandSeed> for FieldValue {
    fn from(value: RandSeed) -> Self {
        match value {
            RandSeed::Integer(value) => Self::Integer(value),
            RandSeed::Uuid(uuid) => Self::Text(uuid.hyphenated().to_string()),
            RandSeed::Text(text) => Self::Text(text),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Slugify,
    Lowercase,
    Trim,
}

impl Transform {
    #[must_use]
    pub fn apply(self, value: &str) -> String {
        match self {
            Self::Slugify => slugify(value),
            Self::Lowercase => value.to_lowercase(),
            Self::Trim => value.trim().to_string(),
        }
    }
}

#[must_use]
pub fn slugify(value: &str) -> String {
    value.trim().to_lowercase().replace(' ', "_")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldSource {
    #[default]
    Unset,
    Field {
        column: String,
    },
    Derived {
        column: String,
        transform: Transform,
    },
    Constant {
        value: FieldValue,
    },
}

impl FieldSource {
    #[must_use]
    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Field { column } | Self::Derived { column, .. } => Some(column),
            Self::Unset | Self::Constant { .. } => None,
        }
    }

    #[must_use]
    pub fn resolve(&self, fields: &BTreeMap<String, FieldValue>) -> FieldValue {
        match self {
            Self::Unset => FieldValue::Null,
            Self::Field { column } => fields.get(column).cloned().unwrap_or_default(),
            Self::Derived { column, transform } => match fields.get(column) {
                Some(FieldValue::Text(text)) => FieldValue::Text(transform.apply(text)),
                Some(other) => other.clone(),
                None => FieldValue::Null,
            },
            Self::Constant { value } => value.clone(),
        }
    }
}

/// Slug/name pair that must both be populated before an identifier is derived.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NamingRule {
    pub name_column: String,
    pub slug_column: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Naming {
    Intact,
    /// Column updates that fill the missing half from the other half.
    Repaired(Vec<(String, FieldValue)>),
    Irrecoverable,
}

impl NamingRule {
    #[must_use]
    pub fn normalize(&self, fields: &mut BTreeMap<String, FieldValue>) -> Naming {
        let name = text_of(fields.get(&self.name_column));
        let slug = text_of(fields.get(&self.slug_column));

        let updates = match (name, slug) {
            (Some(_), Some(_)) => return Naming::Intact,
            (None, None) => return Naming::Irrecoverable,
            (Some(name), None) => vec![(self.slug_column.clone(), FieldValue::Text(slugify(&name)))],
            (None, Some(slug)) => vec![(self.name_column.clone(), FieldValue::Text(slug))],
        };

        for (column, value) in &updates {
            fields.insert(column.clone(), value.clone());
        }
        Naming::Repaired(updates)
    }
}

fn text_of(value: Option<&FieldValue>) -> Option<String> {
    value
        .filter(|value| !value.is_absent())
        .and_then(FieldValue::as_text)
        .filter(|text| !text.trim().is_empty())
}

/// Where a record type lives and which columns identify it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordType {
    pub name: String,
    pub table: String,
    pub key_column: String,
    pub legacy_key_column: String,
    #[serde(default)]
    pub secondary_id_column: Option<String>,
    #[serde(default)]
    pub display_column: Option<String>,
    #[serde(default)]
    pub naming: Option<NamingRule>,
}

impl RecordType {
    /// # Errors
    /// Returns [`StoreError::Layout`] when a table or column name is not a plain identifier.
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut names = vec![
            self.table.as_str(),
            self.key_column.as_str(),
            self.legacy_key_column.as_str(),
        ];
        names.extend(self.secondary_id_column.as_deref());
        names.extend(self.display_column.as_deref());
        if let Some(naming) = &self.naming {
            names.push(&naming.name_column);
            names.push(&naming.slug_column);
        }

        for name in names {
            if !is_simple_identifier(name) {
                return Err(StoreError::Layout(format!(
                    "{}: {name:?} is not a simple identifier",
                    self.name
                )));
            }
        }
        if self.key_column == self.legacy_key_column {
            return Err(StoreError::Layout(format!(
                "{}: legacy key column must differ from the key column",
                self.name
            )));
        }
        Ok(())
    }

    /// Every column the migrator reads for this type, without duplicates.
    #[must_use]
    pub fn columns(&self, spec: &IdentifierSourceSpec) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        let mut push = |column: &str| {
            if !columns.iter().any(|existing| existing == column) {
                columns.push(column.to_string());
            }
        };

        push(self.key_column.as_str());
        push(self.legacy_key_column.as_str());
        if let Some(column) = &self.secondary_id_column {
            push(column);
        }
        if let Some(column) = &self.display_column {
            push(column);
        }
        if let Some(naming) = &self.naming {
            push(naming.name_column.as_str());
            push(naming.slug_column.as_str());
        }
        for column in spec.columns() {
            push(column);
        }
        for column in IDENTITY_COLUMNS {
            push(column);
        }
        columns
    }

    /// The legacy key: the stashed column once migrated, otherwise the current key.
    #[must_use]
    pub fn legacy_key(&self, key: &FieldValue, fields: &BTreeMap<String, FieldValue>) -> FieldValue {
        match fields.get(&self.legacy_key_column) {
            Some(value) if !value.is_null() => value.clone(),
            _ => key.clone(),
        }
    }

    #[must_use]
    pub fn subject(&self, key: &FieldValue, fields: &BTreeMap<String, FieldValue>) -> SubjectFallbacks {
        let legacy = self.legacy_key(key, fields);
        let legacy_key = legacy
            .to_rand_seed()
            .unwrap_or_else(|| RandSeed::Text(legacy.to_string()));

        let display = self
            .display_column
            .as_ref()
            .and_then(|column| text_of(fields.get(column)))
            .unwrap_or_else(|| format!("{} object ({legacy})", self.name));

        let secondary_id = self
            .secondary_id_column
            .as_ref()
            .and_then(|column| fields.get(column))
            .and_then(FieldValue::to_rand_seed);

        SubjectFallbacks {
            type_name: self.name.clone(),
            display,
            secondary_id,
            legacy_key,
        }
    }
}

#[must_use]
pub fn is_simple_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Per record type: its prefix and where each of the four inputs comes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentifierSourceSpec {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub ts: FieldSource,
    #[serde(default)]
    pub uri: FieldSource,
    #[serde(default)]
    pub subtype: FieldSource,
    #[serde(default)]
    pub rand: FieldSource,
}

impl IdentifierSourceSpec {
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        [&self.ts, &self.uri, &self.subtype, &self.rand]
            .into_iter()
            .filter_map(FieldSource::column)
            .collect()
    }

    #[must_use]
    pub fn resolve(&self, record_type: &str, fields: &BTreeMap<String, FieldValue>) -> AbidInputs {
        let ts = self.ts.resolve(fields);
        AbidInputs {
            ts: parse_timestamp(record_type, &ts),
            uri: self.uri.resolve(fields).as_text().filter(|text| !text.trim().is_empty()),
            subtype: self
                .subtype
                .resolve(fields)
                .as_text()
                .filter(|text| !text.trim().is_empty()),
            rand: self.rand.resolve(fields).to_rand_seed(),
        }
    }
}

/// RFC 3339 text, SQLite `YYYY-MM-DD HH:MM:SS[.fff]` text, or integer unix seconds.
/// Unparseable values are logged and treated as absent.
#[must_use]
pub fn parse_timestamp(record_type: &str, value: &FieldValue) -> Option<OffsetDateTime> {
    match value {
        FieldValue::Null | FieldValue::Blob(_) => None,
        FieldValue::Integer(seconds) => OffsetDateTime::from_unix_timestamp(*seconds).ok(),
        FieldValue::Text(text) => {
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            let with_t = text.replacen(' ', "T", 1);
            let parsed = OffsetDateTime::parse(text, &Rfc3339)
                .or_else(|_| OffsetDateTime::parse(&with_t, &Rfc3339))
                .or_else(|_| OffsetDateTime::parse(&format!("{with_t}Z"), &Rfc3339));
            match parsed {
                Ok(ts) => Some(ts),
                Err(_) => {
                    tracing::warn!("{}: ignoring unparseable timestamp {:?}", record_type, text);
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordTypePlan {
    pub record_type: RecordType,
    pub source: IdentifierSourceSpec,
}

/// A JSON backfill plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct BackfillPlan {
    #[serde(default)]
    pub uri_salt: Option<String>,
    pub record_types: Vec<RecordTypePlan>,
}

impl BackfillPlan {
    #[must_use]
    pub fn record_type(&self, name: &str) -> Option<&RecordTypePlan> {
        self.record_types.iter().find(|plan| plan.record_type.name == name)
    }
}
