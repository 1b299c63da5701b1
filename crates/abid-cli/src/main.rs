use std::fs;
use std::path::{Path, PathBuf};

use abid_core::source::parse_timestamp;
use abid_core::{
    derive, Abid, AbidConfig, AbidInputs, AbidPrefix, BackfillOptions, BackfillPlan, Encoded,
    FieldValue, RandSeed, RecordTypePlan, Representation, SubjectFallbacks, DEFAULT_URI_SALT,
};
use abid_store_sqlite::SqliteStore;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "abid")]
#[command(about = "ABID identifier codec and backfill CLI")]
struct Cli {
    #[arg(long, default_value = "./index.sqlite3")]
    db: PathBuf,

    /// Salt mixed into the uri component hash.
    #[arg(long, default_value = DEFAULT_URI_SALT)]
    uri_salt: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Derive an identifier from explicit inputs.
    Derive(DeriveArgs),
    /// Decode any identifier representation.
    Parse(ParseArgs),
    /// Check whether two identifiers carry the same value.
    Equivalent(EquivalentArgs),
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Args)]
struct DeriveArgs {
    #[arg(long)]
    prefix: Option<String>,
    /// RFC 3339 timestamp.
    #[arg(long)]
    ts: Option<String>,
    #[arg(long)]
    uri: Option<String>,
    #[arg(long)]
    subtype: Option<String>,
    #[arg(long)]
    rand: Option<String>,
    #[arg(long)]
    type_name: String,
    #[arg(long)]
    legacy_key: String,
    #[arg(long)]
    secondary_id: Option<String>,
    /// Default string form of the record; defaults to `<type> object (<legacy key>)`.
    #[arg(long)]
    display: Option<String>,
}

#[derive(Debug, Args)]
struct ParseArgs {
    value: String,
    #[arg(long)]
    prefix: Option<String>,
}

#[derive(Debug, Args)]
struct EquivalentArgs {
    a: String,
    b: String,
    #[arg(long)]
    prefix: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backfill(DbBackfillArgs),
    Audit(DbAuditArgs),
    IntegrityCheck,
    Tags,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    #[arg(long, default_value_t = abid_core::backfill::DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[derive(Debug, Args)]
struct DbBackfillArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long)]
    record_type: Option<String>,
    #[arg(long, default_value_t = abid_core::backfill::DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[derive(Debug, Args)]
struct DbAuditArgs {
    #[arg(long)]
    plan: PathBuf,
    #[arg(long)]
    record_type: Option<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AbidConfig { uri_salt: cli.uri_salt };
    match cli.command {
        Command::Derive(args) => run_derive(&args, &config),
        Command::Parse(args) => run_parse(&args),
        Command::Equivalent(args) => run_equivalent(&args),
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &config, &mut store)
        }
    }
}

fn run_derive(args: &DeriveArgs, config: &AbidConfig) -> Result<()> {
    let ts = match args.ts.as_deref() {
        Some(raw) => Some(
            parse_timestamp(&args.type_name, &FieldValue::Text(raw.to_string()))
                .ok_or_else(|| anyhow!("--ts {raw:?} is not a valid timestamp"))?,
        ),
        None => None,
    };

    let legacy_key = seed_from_arg(&args.legacy_key);
    let inputs = AbidInputs {
        ts,
        uri: args.uri.clone(),
        subtype: args.subtype.clone(),
        rand: args.rand.as_deref().map(seed_from_arg),
    };
    let subject = SubjectFallbacks {
        type_name: args.type_name.clone(),
        display: args
            .display
            .clone()
            .unwrap_or_else(|| format!("{} object ({legacy_key})", args.type_name)),
        secondary_id: args.secondary_id.as_deref().map(seed_from_arg),
        legacy_key,
    };

    let derivation = derive(config, args.prefix.as_deref(), &inputs, &subject)?;
    let mut payload = representations(&derivation.abid);
    if let Value::Object(object) = &mut payload {
        object.insert("inputs".to_string(), serde_json::to_value(&derivation.inputs)?);
        object.insert("fallbacks".to_string(), serde_json::to_value(&derivation.fallbacks)?);
    }
    emit_json(payload)
}

fn run_parse(args: &ParseArgs) -> Result<()> {
    let abid = parse_any(&args.value, args.prefix.as_deref())?;
    emit_json(representations(&abid))
}

fn run_equivalent(args: &EquivalentArgs) -> Result<()> {
    let a = parse_any(&args.a, args.prefix.as_deref())?;
    let b = parse_any(&args.b, args.prefix.as_deref())?;
    emit_json(serde_json::json!({
        "equivalent": abid_core::equivalent(&a, &b),
        "a": a.to_string(),
        "b": b.to_string(),
    }))
}

fn run_db(command: DbCommand, config: &AbidConfig, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, config, store),
        DbCommand::Backfill(args) => run_db_backfill(&args, config, store),
        DbCommand::Audit(args) => run_db_audit(&args, config, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
        DbCommand::Tags => run_db_tags(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, config: &AbidConfig, store: &mut SqliteStore) -> Result<()> {
    if args.dry_run {
        let before = store.schema_status()?;
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    let options = BackfillOptions { batch_size: args.batch_size, ..BackfillOptions::default() };
    let outcome = store.migrate(config, &options)?;
    let applied_versions = outcome
        .before
        .pending_versions
        .iter()
        .copied()
        .filter(|version| *version <= outcome.after.current_version)
        .collect::<Vec<_>>();
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": outcome.before.current_version,
        "applied_versions": applied_versions,
        "after_version": outcome.after.current_version,
        "target_version": outcome.after.target_version,
        "up_to_date": outcome.after.pending_versions.is_empty(),
        "backfill": outcome.backfill,
    }))?;

    if !outcome.is_complete() {
        return Err(anyhow!(
            "migration stopped at version {}; rerun `db migrate` after fixing the reported records",
            outcome.after.current_version
        ));
    }
    Ok(())
}

fn run_db_backfill(args: &DbBackfillArgs, config: &AbidConfig, store: &mut SqliteStore) -> Result<()> {
    let plan = read_plan(&args.plan)?;
    let config = plan_config(&plan, config);
    let selected = select_plans(&plan, args.record_type.as_deref())?;
    let options = BackfillOptions { batch_size: args.batch_size, ..BackfillOptions::default() };

    let reports = store.backfill(&config, &selected, &options);
    let success = reports.len() == selected.len() && reports.iter().all(abid_core::MigrationReport::is_success);
    emit_json(serde_json::json!({
        "success": success,
        "reports": reports,
    }))?;

    if !success {
        return Err(anyhow!("backfill did not complete; see reports for failed records"));
    }
    Ok(())
}

fn run_db_audit(args: &DbAuditArgs, config: &AbidConfig, store: &mut SqliteStore) -> Result<()> {
    let plan = read_plan(&args.plan)?;
    let config = plan_config(&plan, config);
    let selected = select_plans(&plan, args.record_type.as_deref())?;

    let mut reports = Vec::with_capacity(selected.len());
    for entry in selected {
        reports.push(store.audit(&config, &entry.record_type, abid_core::backfill::DEFAULT_BATCH_SIZE)?);
    }
    let clean = reports.iter().all(abid_core::AuditReport::is_clean);
    emit_json(serde_json::json!({
        "clean": clean,
        "reports": reports,
    }))?;

    if !clean {
        return Err(anyhow!("audit found identifiers that do not match their persisted inputs"));
    }
    Ok(())
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_db_tags(store: &SqliteStore) -> Result<()> {
    let tags = store.list_tags()?;
    emit_json(serde_json::json!({
        "count": tags.len(),
        "tags": tags,
    }))
}

fn read_plan(path: &Path) -> Result<BackfillPlan> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read backfill plan {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse backfill plan {}", path.display()))
}

fn plan_config(plan: &BackfillPlan, config: &AbidConfig) -> AbidConfig {
    match &plan.uri_salt {
        Some(uri_salt) => AbidConfig { uri_salt: uri_salt.clone() },
        None => config.clone(),
    }
}

fn select_plans<'a>(plan: &'a BackfillPlan, record_type: Option<&str>) -> Result<Vec<&'a RecordTypePlan>> {
    match record_type {
        Some(name) => plan
            .record_type(name)
            .map(|entry| vec![entry])
            .ok_or_else(|| anyhow!("record type {name} is not in the plan")),
        None => Ok(plan.record_types.iter().collect()),
    }
}

fn parse_any(value: &str, prefix: Option<&str>) -> Result<Abid> {
    let abid = match prefix {
        Some(prefix) => Abid::parse_with_prefix(&AbidPrefix::parse(prefix)?, value)?,
        None => Abid::parse(value)?,
    };
    Ok(abid)
}

fn seed_from_arg(raw: &str) -> RandSeed {
    raw.trim()
        .parse::<i64>()
        .map_or_else(|_| RandSeed::Text(raw.trim().to_string()), RandSeed::Integer)
}

fn representations(abid: &Abid) -> Value {
    let text = |representation: Representation| match abid.encode(representation) {
        Encoded::Text(text) => text,
        Encoded::Binary(bytes) => hex::encode(bytes),
    };
    serde_json::json!({
        "abid": text(Representation::Abid),
        "typeid": text(Representation::TypeId),
        "ulid": text(Representation::Ulid),
        "uuid": text(Representation::Uuid),
        "hex": text(Representation::Binary),
        "prefix": abid.prefix(),
        "parts": {
            "ts": abid.ts_part(),
            "uri": abid.uri_part(),
            "subtype": abid.subtype_part(),
            "rand": abid.rand_part(),
        },
        "timestamp": abid.timestamp().and_then(|ts| ts.format(&Rfc3339).ok()),
        "placeholder": abid.is_placeholder(),
    })
}
