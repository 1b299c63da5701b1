//! Archive-box style identifiers (ABIDs) and the backfill migrator that assigns them
//! to records keyed by legacy integers.

pub mod audit;
pub mod backfill;
pub mod codec;
pub mod derive;
pub mod error;
pub mod source;

pub use audit::{audit_store, recompute, AuditIssue, AuditReport, PersistedIdentity};
pub use backfill::{
    run, run_plan, BackfillBatch, BackfillError, BackfillOptions, BackfillStore, FatalError,
    FatalKind, MigrationReport, RecordUpdate, StoredRecord,
};
pub use codec::{
    abid_from_values, equivalent, Abid, AbidConfig, AbidPrefix, Encoded, RandSeed,
    Representation, DEFAULT_URI_SALT, UNSET_PREFIX,
};
pub use derive::{derive, AbidField, AbidInputs, Derivation, ResolvedInputs, SubjectFallbacks};
pub use error::{AbidError, StoreError};
pub use source::{
    BackfillPlan, FieldSource, FieldValue, IdentifierSourceSpec, NamingRule, RecordType,
    RecordTypePlan, Transform,
};
