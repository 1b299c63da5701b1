use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codec::{abid_from_values, Abid, AbidConfig, AbidPrefix, RandSeed};
use crate::error::AbidError;

/// Role inputs as resolved from a record. `None` and empty strings mean "absent".
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AbidInputs {
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub ts: Option<OffsetDateTime>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub rand: Option<RandSeed>,
}

/// Per-record values used when a role input is absent.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SubjectFallbacks {
    pub type_name: String,
    /// The record's default string form, e.g. `Tag object (7)`.
    pub display: String,
    pub secondary_id: Option<RandSeed>,
    pub legacy_key: RandSeed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AbidField {
    Timestamp,
    Uri,
    Subtype,
    Rand,
}

impl AbidField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Uri => "uri",
            Self::Subtype => "subtype",
            Self::Rand => "rand",
        }
    }
}

/// The inputs actually hashed into an identifier, after fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedInputs {
    pub prefix: AbidPrefix,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub uri: String,
    pub subtype: String,
    pub rand: RandSeed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Derivation {
    pub abid: Abid,
    pub inputs: ResolvedInputs,
    pub fallbacks: Vec<AbidField>,
}

impl Derivation {
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        !self.fallbacks.is_empty()
    }
}

/// Derive the identifier of one record, filling absent role inputs from `subject`.
///
/// Fallbacks are not fatal: each one is logged and listed in [`Derivation::fallbacks`].
/// A missing timestamp becomes the Unix epoch, which marks the result as a placeholder.
///
/// # Errors
/// Returns [`AbidError::MissingPrefix`] before looking at any input when the record
/// type has no usable prefix, and [`AbidError::TimestampOutOfRange`] for timestamps
/// that cannot be encoded.
pub fn derive(
    config: &AbidConfig,
    prefix: Option<&str>,
    inputs: &AbidInputs,
    subject: &SubjectFallbacks,
) -> Result<Derivation, AbidError> {
    let prefix = AbidPrefix::for_type(prefix, &subject.type_name)?;
    let mut fallbacks = Vec::new();

    let ts = inputs.ts.unwrap_or_else(|| {
        note_fallback(&mut fallbacks, subject, AbidField::Timestamp);
        OffsetDateTime::UNIX_EPOCH
    });

    let uri = present_text(inputs.uri.as_deref()).unwrap_or_else(|| {
        note_fallback(&mut fallbacks, subject, AbidField::Uri);
        subject.display.clone()
    });

    let subtype = present_text(inputs.subtype.as_deref()).unwrap_or_else(|| {
        note_fallback(&mut fallbacks, subject, AbidField::Subtype);
        subject.type_name.clone()
    });

    let rand = match inputs.rand.as_ref().filter(|seed| !seed.is_empty()) {
        Some(seed) => seed.clone(),
        None => {
            note_fallback(&mut fallbacks, subject, AbidField::Rand);
            subject
                .secondary_id
                .clone()
                .filter(|seed| !seed.is_empty())
                .unwrap_or_else(|| subject.legacy_key.clone())
        }
    };

    let abid = abid_from_values(config, &prefix, ts, &uri, &subtype, &rand)?;
    Ok(Derivation {
        abid,
        inputs: ResolvedInputs { prefix, ts, uri, subtype, rand },
        fallbacks,
    })
}

fn present_text(value: Option<&str>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty()).map(ToString::to_string)
}

fn note_fallback(fallbacks: &mut Vec<AbidField>, subject: &SubjectFallbacks, field: AbidField) {
    tracing::warn!(
        "{} {}: abid {} input is missing, using fallback value",
        subject.type_name,
        subject.legacy_key,
        field.as_str()
    );
    fallbacks.push(field);
}
