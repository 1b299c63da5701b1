//! ABID layout: `prefix(4) | ts(10) | uri(8) | subtype(2) | rand(6)`.
//!
//! The 26-character suffix is Crockford base32 and shares the ULID layout, so the
//! same 128-bit value can be carried as ABID text, TypeID text, ULID text, UUID
//! text, or 16 raw bytes.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;
use url::Url;
use uuid::Uuid;

use crate::error::{malformed, AbidError};

pub const ABID_PREFIX_LEN: usize = 4;
pub const ABID_SUFFIX_LEN: usize = 26;
pub const ABID_LEN: usize = ABID_PREFIX_LEN + ABID_SUFFIX_LEN;
pub const ABID_TS_LEN: usize = 10;
pub const ABID_URI_LEN: usize = 8;
pub const ABID_SUBTYPE_LEN: usize = 2;
pub const ABID_RAND_LEN: usize = 6;

/// Placeholder prefix of records whose type never declared one.
pub const UNSET_PREFIX: &str = "obj_";
pub const DEFAULT_URI_SALT: &str = "687c2fff14e3a7780faa5a40c237b19b5b51b089";

const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const MAX_TIMESTAMP_MS: u64 = (1 << 48) - 1;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AbidConfig {
    pub uri_salt: String,
}

impl Default for AbidConfig {
    fn default() -> Self {
        Self { uri_salt: DEFAULT_URI_SALT.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct AbidPrefix(String);

impl AbidPrefix {
    /// Normalize `tag` / `tag_` into the canonical `tag_` form.
    ///
    /// # Errors
    /// Returns [`AbidError::InvalidPrefix`] unless the input is three lowercase ASCII
    /// letters with an optional trailing underscore, or when it is the unset placeholder.
    pub fn parse(raw: &str) -> Result<Self, AbidError> {
        let stem = raw.strip_suffix('_').unwrap_or(raw);
        if stem.len() != ABID_PREFIX_LEN - 1 || !stem.bytes().all(|byte| byte.is_ascii_lowercase())
        {
            return Err(AbidError::InvalidPrefix {
                raw: raw.to_string(),
                reason: "expected three lowercase ascii letters and an optional trailing underscore"
                    .to_string(),
            });
        }

        let canonical = format!("{stem}_");
        if canonical == UNSET_PREFIX {
            return Err(AbidError::InvalidPrefix {
                raw: raw.to_string(),
                reason: format!("{UNSET_PREFIX} is the unset placeholder"),
            });
        }

        Ok(Self(canonical))
    }

    /// Resolve the prefix declared for a record type, treating absent, empty, and
    /// placeholder values as missing.
    ///
    /// # Errors
    /// Returns [`AbidError::MissingPrefix`] for a missing prefix and
    /// [`AbidError::InvalidPrefix`] for a malformed one.
    pub fn for_type(raw: Option<&str>, type_name: &str) -> Result<Self, AbidError> {
        let raw = raw.map(str::trim).unwrap_or_default();
        if raw.is_empty() || raw == UNSET_PREFIX || raw == UNSET_PREFIX.trim_end_matches('_') {
            return Err(AbidError::MissingPrefix {
                type_name: type_name.to_string(),
                suggested: suggested_prefix(type_name),
            });
        }
        Self::parse(raw)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix without the trailing underscore, as used by TypeID.
    #[must_use]
    pub fn stem(&self) -> &str {
        self.0.trim_end_matches('_')
    }
}

impl Display for AbidPrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AbidPrefix {
    type Error = AbidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AbidPrefix> for String {
    fn from(value: AbidPrefix) -> Self {
        value.0
    }
}

fn suggested_prefix(type_name: &str) -> String {
    let stem = type_name
        .chars()
        .filter(char::is_ascii_alphabetic)
        .take(ABID_PREFIX_LEN - 1)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("{stem}_")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// `tag_01J5PXGNF01B69B23C03000007`
    Abid,
    /// `tag_01j5pxgnf01b69b23c03000007`
    TypeId,
    /// `01J5PXGNF01B69B23C03000007`, sorts by timestamp.
    Ulid,
    /// `01916dd8-55e0-0acc-9588-6c00c0000007`
    Uuid,
    /// 16 big-endian bytes, the storage primary key.
    Binary,
}

impl Representation {
    pub const ALL: [Self; 5] = [Self::Abid, Self::TypeId, Self::Ulid, Self::Uuid, Self::Binary];
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Encoded {
    Text(String),
    Binary([u8; 16]),
}

/// Seed for the collision-resistant `rand` component.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(untagged)]
pub enum RandSeed {
    Integer(i64),
    Uuid(Uuid),
    Text(String),
}

impl RandSeed {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Text(text) if text.trim().is_empty())
    }
}

impl Display for RandSeed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Uuid(value) => write!(f, "{}", value.hyphenated()),
            Self::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Abid {
    prefix: AbidPrefixKey,
    value: Ulid,
}

// Prefixes are three ascii letters; storing them inline keeps `Abid` `Copy`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct AbidPrefixKey([u8; ABID_PREFIX_LEN]);

impl AbidPrefixKey {
    fn new(prefix: &AbidPrefix) -> Self {
        let mut bytes = [b'_'; ABID_PREFIX_LEN];
        bytes.copy_from_slice(prefix.as_str().as_bytes());
        Self(bytes)
    }

    fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or(UNSET_PREFIX)
    }
}

impl Abid {
    #[must_use]
    pub fn from_ulid(prefix: &AbidPrefix, value: Ulid) -> Self {
        Self { prefix: AbidPrefixKey::new(prefix), value }
    }

    #[must_use]
    pub fn from_uuid(prefix: &AbidPrefix, value: Uuid) -> Self {
        Self::from_ulid(prefix, ulid_from_bytes(*value.as_bytes()))
    }

    /// Decode the binary primary-key form.
    ///
    /// # Errors
    /// Returns [`AbidError::Malformed`] unless exactly 16 bytes are given.
    pub fn from_bytes(prefix: &AbidPrefix, bytes: &[u8]) -> Result<Self, AbidError> {
        let raw: [u8; 16] = bytes.try_into().map_err(|_| {
            malformed(
                &hex::encode(bytes),
                format!("expected 16 bytes, found {}", bytes.len()),
            )
        })?;
        Ok(Self::from_ulid(prefix, ulid_from_bytes(raw)))
    }

    /// Assemble an identifier from its already-encoded components.
    ///
    /// # Errors
    /// Returns [`AbidError::Malformed`] when a component has the wrong width or
    /// falls outside the Crockford base32 alphabet.
    pub fn from_parts(
        prefix: &AbidPrefix,
        ts: &str,
        uri: &str,
        subtype: &str,
        rand: &str,
    ) -> Result<Self, AbidError> {
        for (name, part, width) in [
            ("ts", ts, ABID_TS_LEN),
            ("uri", uri, ABID_URI_LEN),
            ("subtype", subtype, ABID_SUBTYPE_LEN),
            ("rand", rand, ABID_RAND_LEN),
        ] {
            if part.len() != width {
                return Err(malformed(
                    part,
                    format!("{name} component must be {width} characters, found {}", part.len()),
                ));
            }
        }

        let suffix = format!("{ts}{uri}{subtype}{rand}");
        Ok(Self::from_ulid(prefix, decode_suffix(&suffix, &suffix)?))
    }

    /// Parse a typed representation: ABID (`tag_01J5...`) or TypeID (`tag_01j5...`).
    ///
    /// # Errors
    /// Returns [`AbidError::Malformed`] on wrong length, bad prefix, characters
    /// outside the alphabet, or a value that overflows 128 bits.
    pub fn parse(input: &str) -> Result<Self, AbidError> {
        let trimmed = input.trim();
        if !trimmed.is_ascii() {
            return Err(malformed(input, "identifiers are ascii"));
        }
        if trimmed.len() != ABID_LEN {
            return Err(malformed(
                input,
                format!("expected {ABID_LEN} characters, found {}", trimmed.len()),
            ));
        }

        let (prefix_raw, suffix) = trimmed.split_at(ABID_PREFIX_LEN);
        if !prefix_raw.ends_with('_') {
            return Err(malformed(input, "prefix must end with an underscore"));
        }
        let prefix = AbidPrefix::parse(&prefix_raw.to_ascii_lowercase())
            .map_err(|err| malformed(input, err.to_string()))?;

        Ok(Self::from_ulid(&prefix, decode_suffix(input, suffix)?))
    }

    /// Parse any text representation, using `prefix` for the forms that do not carry one.
    ///
    /// # Errors
    /// Returns [`AbidError::Malformed`] when the input matches no representation or
    /// carries a prefix other than `prefix`.
    pub fn parse_with_prefix(prefix: &AbidPrefix, input: &str) -> Result<Self, AbidError> {
        let trimmed = input.trim();
        match trimmed.len() {
            ABID_LEN => {
                let abid = Self::parse(trimmed)?;
                if abid.prefix() != prefix.as_str() {
                    return Err(malformed(
                        input,
                        format!("expected prefix {prefix}, found {}", abid.prefix()),
                    ));
                }
                Ok(abid)
            }
            ABID_SUFFIX_LEN => Ok(Self::from_ulid(prefix, decode_suffix(input, trimmed)?)),
            32 | 36 => {
                let uuid = Uuid::parse_str(trimmed).map_err(|err| malformed(input, err.to_string()))?;
                Ok(Self::from_uuid(prefix, uuid))
            }
            other => Err(malformed(
                input,
                format!("no identifier representation is {other} characters long"),
            )),
        }
    }

    /// Decode any [`Encoded`] value produced by [`Abid::encode`].
    ///
    /// # Errors
    /// Returns [`AbidError::Malformed`] for text that is not a valid representation.
    pub fn decode(prefix: &AbidPrefix, encoded: &Encoded) -> Result<Self, AbidError> {
        match encoded {
            Encoded::Text(text) => Self::parse_with_prefix(prefix, text),
            Encoded::Binary(bytes) => Ok(Self::from_ulid(prefix, ulid_from_bytes(*bytes))),
        }
    }

    #[must_use]
    pub fn encode(&self, representation: Representation) -> Encoded {
        match representation {
            Representation::Abid => Encoded::Text(self.to_string()),
            Representation::TypeId => Encoded::Text(format!(
                "{}{}",
                self.prefix(),
                self.value.to_string().to_ascii_lowercase()
            )),
            Representation::Ulid => Encoded::Text(self.value.to_string()),
            Representation::Uuid => Encoded::Text(self.uuid().hyphenated().to_string()),
            Representation::Binary => Encoded::Binary(self.to_bytes()),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        self.prefix.as_str()
    }

    #[must_use]
    pub fn ulid(&self) -> Ulid {
        self.value
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.to_bytes())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 16] {
        self.value.0.to_be_bytes()
    }

    #[must_use]
    pub fn suffix(&self) -> String {
        self.value.to_string()
    }

    #[must_use]
    pub fn ts_part(&self) -> String {
        self.suffix()[..ABID_TS_LEN].to_string()
    }

    #[must_use]
    pub fn uri_part(&self) -> String {
        let start = ABID_TS_LEN;
        self.suffix()[start..start + ABID_URI_LEN].to_string()
    }

    #[must_use]
    pub fn subtype_part(&self) -> String {
        let start = ABID_TS_LEN + ABID_URI_LEN;
        self.suffix()[start..start + ABID_SUBTYPE_LEN].to_string()
    }

    #[must_use]
    pub fn rand_part(&self) -> String {
        self.suffix()[ABID_SUFFIX_LEN - ABID_RAND_LEN..].to_string()
    }

    #[must_use]
    pub fn timestamp_ms(&self) -> u64 {
        self.value.timestamp_ms()
    }

    /// Timestamp component, or `None` when it lies beyond the supported calendar range.
    #[must_use]
    pub fn timestamp(&self) -> Option<OffsetDateTime> {
        let millis = i64::try_from(self.timestamp_ms()).ok()?;
        OffsetDateTime::UNIX_EPOCH.checked_add(time::Duration::milliseconds(millis))
    }

    /// True for identifiers derived without a timestamp (epoch placeholder).
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.timestamp_ms() == 0
    }

    /// Compare the underlying 128-bit values, ignoring prefix and representation.
    #[must_use]
    pub fn equivalent(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Display for Abid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.prefix(), self.value)
    }
}

impl FromStr for Abid {
    type Err = AbidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Abid {
    type Error = AbidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Abid> for String {
    fn from(value: Abid) -> Self {
        value.to_string()
    }
}

#[must_use]
pub fn equivalent(a: &Abid, b: &Abid) -> bool {
    a.equivalent(b)
}

/// Derive an identifier from fully resolved inputs. No fallbacks are applied here.
///
/// # Errors
/// Returns [`AbidError::TimestampOutOfRange`] for timestamps before the Unix epoch
/// or beyond 48 bits of milliseconds.
pub fn abid_from_values(
    config: &AbidConfig,
    prefix: &AbidPrefix,
    ts: OffsetDateTime,
    uri: &str,
    subtype: &str,
    rand: &RandSeed,
) -> Result<Abid, AbidError> {
    Abid::from_parts(
        prefix,
        &ts_part(ts)?,
        &uri_part(uri, &config.uri_salt),
        &subtype_part(subtype),
        &rand_part(rand),
    )
}

/// Encode a timestamp as the 10-character millisecond component.
///
/// # Errors
/// Returns [`AbidError::TimestampOutOfRange`] for timestamps that do not fit.
pub fn ts_part(ts: OffsetDateTime) -> Result<String, AbidError> {
    let millis = ts.unix_timestamp_nanos().div_euclid(1_000_000);
    let millis = u64::try_from(millis)
        .ok()
        .filter(|millis| *millis <= MAX_TIMESTAMP_MS)
        .ok_or_else(|| AbidError::TimestampOutOfRange(ts.to_string()))?;
    Ok(Ulid::from_parts(millis, 0).to_string()[..ABID_TS_LEN].to_string())
}

/// Uppercase hex SHA-256 of the URI (its host, for URLs) followed by the salt.
#[must_use]
pub fn uri_hash(uri: &str, salt: &str) -> String {
    let subject = url_host(uri).unwrap_or_else(|| uri.to_string());
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode_upper(hasher.finalize())
}

fn url_host(uri: &str) -> Option<String> {
    if !uri.contains("://") {
        return None;
    }
    let parsed = Url::parse(uri).ok()?;
    let host = parsed.host_str().filter(|host| !host.is_empty())?;
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[must_use]
pub fn uri_part(uri: &str, salt: &str) -> String {
    uri_hash(uri, salt)[..ABID_URI_LEN].to_string()
}

#[must_use]
pub fn subtype_part(subtype: &str) -> String {
    let upper = subtype.to_ascii_uppercase();
    if upper.len() == ABID_SUBTYPE_LEN && is_crockford(&upper) {
        return upper;
    }
    sha256_hex(subtype.as_bytes())[..ABID_SUBTYPE_LEN].to_string()
}

#[must_use]
pub fn rand_part(seed: &RandSeed) -> String {
    match seed {
        RandSeed::Integer(value) => pad_tail(&value.unsigned_abs().to_string()),
        RandSeed::Uuid(uuid) => {
            let encoded = ulid_from_bytes(*uuid.as_bytes()).to_string();
            encoded[ABID_SUFFIX_LEN - ABID_RAND_LEN..].to_string()
        }
        RandSeed::Text(text) => {
            let text = text.trim();
            if let Ok(uuid) = Uuid::parse_str(text) {
                return rand_part(&RandSeed::Uuid(uuid));
            }
            let upper = text.to_ascii_uppercase();
            if is_crockford(&upper) {
                return pad_tail(&upper);
            }
            let digest = sha256_hex(text.as_bytes());
            digest[digest.len() - ABID_RAND_LEN..].to_string()
        }
    }
}

fn pad_tail(value: &str) -> String {
    let tail = &value[value.len().saturating_sub(ABID_RAND_LEN)..];
    format!("{tail:0>width$}", width = ABID_RAND_LEN)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(bytes))
}

fn is_crockford(value: &str) -> bool {
    value.bytes().all(|byte| CROCKFORD_ALPHABET.contains(&byte.to_ascii_uppercase()))
}

fn ulid_from_bytes(bytes: [u8; 16]) -> Ulid {
    Ulid(u128::from_be_bytes(bytes))
}

fn decode_suffix(input: &str, suffix: &str) -> Result<Ulid, AbidError> {
    if !is_crockford(suffix) {
        return Err(malformed(input, "contains characters outside the Crockford base32 alphabet"));
    }
    if suffix.len() != ABID_SUFFIX_LEN {
        return Err(malformed(
            input,
            format!("expected {ABID_SUFFIX_LEN} base32 characters, found {}", suffix.len()),
        ));
    }
    // 26 base32 chars carry 130 bits; the leading char may only use the low 3.
    if suffix.as_bytes()[0] > b'7' {
        return Err(malformed(input, "value overflows 128 bits"));
    }
    Ulid::from_string(&suffix.to_ascii_uppercase()).map_err(|err| malformed(input, err.to_string()))
}
