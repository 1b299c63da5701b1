use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

const LEGACY_ARCHIVE_SQL: &str = r"
CREATE TABLE core_snapshot (
  id INTEGER PRIMARY KEY,
  url TEXT NOT NULL UNIQUE,
  title TEXT,
  added TEXT NOT NULL
);
CREATE TABLE core_tag (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL DEFAULT '',
  slug TEXT NOT NULL DEFAULT '',
  created TEXT
);
CREATE TABLE core_snapshot_tags (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  snapshot_id INTEGER NOT NULL,
  tag_id INTEGER NOT NULL,
  UNIQUE(snapshot_id, tag_id),
  FOREIGN KEY (snapshot_id) REFERENCES core_snapshot(id) ON DELETE CASCADE,
  FOREIGN KEY (tag_id) REFERENCES core_tag(id) ON DELETE CASCADE
);

INSERT INTO core_snapshot(id, url, title, added) VALUES
  (1, 'https://example.com/a', NULL, '2024-08-20 00:00:00'),
  (2, 'https://example.com/b', NULL, '2024-08-20 00:00:00');
INSERT INTO core_tag(id, name, slug, created) VALUES
  (7, 'Example', 'example', '2024-08-20 03:33:00'),
  (8, 'Hello World', '', '2024-08-21 10:00:00'),
  (9, '', '', '2024-08-22 10:00:00');
INSERT INTO core_snapshot_tags(snapshot_id, tag_id) VALUES (1, 7), (2, 7), (2, 9);
";

const TAG_PLAN_JSON: &str = r#"{
  "record_types": [{
    "record_type": {
      "name": "Tag", "table": "core_tag",
      "key_column": "id", "legacy_key_column": "old_id",
      "naming": {"name_column": "name", "slug_column": "slug"}
    },
    "source": {
      "prefix": "tag_",
      "ts": {"kind": "field", "column": "created"},
      "uri": {"kind": "field", "column": "slug"},
      "subtype": {"kind": "constant", "value": "03"},
      "rand": {"kind": "field", "column": "old_id"}
    }
  }]
}"#;

fn run_abid<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_abid"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute abid binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_abid(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "abid command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn seed_legacy_archive(path: &Path) {
    let conn = rusqlite::Connection::open(path)
        .unwrap_or_else(|err| panic!("failed to open {}: {err}", path.display()));
    conn.execute_batch(LEGACY_ARCHIVE_SQL)
        .unwrap_or_else(|err| panic!("failed to seed legacy archive: {err}"));
}

fn write_plan(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("plan.json");
    fs::write(&path, TAG_PLAN_JSON).unwrap_or_else(|err| panic!("failed to write plan: {err}"));
    path
}

fn sandbox() -> tempfile::TempDir {
    tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"))
}

#[test]
fn derive_prints_every_representation() {
    let payload = run_json([
        "derive",
        "--prefix",
        "tag_",
        "--ts",
        "2024-08-20T03:33:00Z",
        "--uri",
        "example",
        "--subtype",
        "03",
        "--rand",
        "7",
        "--type-name",
        "Tag",
        "--legacy-key",
        "7",
    ]);

    assert_eq!(as_str(&payload, "contract_version"), "cli.v1");
    assert_eq!(as_str(&payload, "abid"), "tag_01J5PXGNF01B69B23C03000007");
    assert_eq!(as_str(&payload, "typeid"), "tag_01j5pxgnf01b69b23c03000007");
    assert_eq!(as_str(&payload, "ulid"), "01J5PXGNF01B69B23C03000007");
    assert_eq!(as_str(&payload, "uuid"), "01916dd8-55e0-0acc-9588-6c00c0000007");
    assert_eq!(as_str(&payload, "timestamp"), "2024-08-20T03:33:00Z");
    assert!(!as_bool(&payload, "placeholder"));
    assert_eq!(payload.get("fallbacks"), Some(&Value::Array(Vec::new())));
}

#[test]
fn derive_with_absent_inputs_reports_fallbacks() {
    let payload = run_json(["derive", "--prefix", "tag", "--type-name", "Tag", "--legacy-key", "7"]);

    assert_eq!(as_str(&payload, "abid"), "tag_0000000000CDBB265F15000007");
    assert!(as_bool(&payload, "placeholder"));
    let fallbacks = payload
        .get("fallbacks")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    assert_eq!(fallbacks, vec!["timestamp", "uri", "subtype", "rand"]);
}

#[test]
fn derive_without_prefix_names_the_type() {
    let output = run_abid(["derive", "--type-name", "ArchiveResult", "--legacy-key", "3"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ArchiveResult.abid_prefix must be defined"), "{stderr}");
    assert!(stderr.contains("arc_"), "{stderr}");
}

#[test]
fn parse_and_equivalent_accept_every_text_form() {
    let from_uuid = run_json([
        "parse",
        "01916dd8-55e0-0acc-9588-6c00c0000007",
        "--prefix",
        "tag_",
    ]);
    assert_eq!(as_str(&from_uuid, "abid"), "tag_01J5PXGNF01B69B23C03000007");
    assert_eq!(from_uuid.pointer("/parts/rand").and_then(Value::as_str), Some("000007"));

    let equivalent = run_json([
        "equivalent",
        "tag_01j5pxgnf01b69b23c03000007",
        "01J5PXGNF01B69B23C03000007",
        "--prefix",
        "tag_",
    ]);
    assert!(as_bool(&equivalent, "equivalent"));

    let malformed = run_abid(["parse", "tag_01J5PXGNF01B69B23C0300000U"]);
    assert!(!malformed.status.success());
}

#[test]
fn db_migrate_backfills_legacy_tags() {
    let dir = sandbox();
    let db = dir.path().join("index.sqlite3");
    seed_legacy_archive(&db);

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 1);
    assert!(as_bool(&status, "inferred_from_legacy"));

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(
        dry_run.get("would_apply_versions"),
        Some(&serde_json::json!([2, 3]))
    );

    let migrate = run_json(["--db", path_str(&db), "db", "migrate", "--batch-size", "2"]);
    assert_eq!(as_i64(&migrate, "after_version"), 3);
    assert!(as_bool(&migrate, "up_to_date"));
    assert_eq!(migrate.get("applied_versions"), Some(&serde_json::json!([2, 3])));
    assert_eq!(migrate.pointer("/backfill/migrated").and_then(Value::as_i64), Some(2));
    assert_eq!(migrate.pointer("/backfill/deleted"), Some(&serde_json::json!(["9"])));

    let tags = run_json(["--db", path_str(&db), "db", "tags"]);
    assert_eq!(as_i64(&tags, "count"), 2);
    let example = tags
        .get("tags")
        .and_then(Value::as_array)
        .and_then(|items| items.iter().find(|tag| tag.get("old_id") == Some(&Value::from(7))))
        .unwrap_or_else(|| panic!("tag 7 missing from {tags}"));
    assert_eq!(as_str(example, "abid"), "tag_01J5PXGNF01B69B23C03000007");
    assert_eq!(as_i64(example, "snapshots"), 2);

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert!(as_bool(&integrity, "quick_check_ok"));
    assert_eq!(integrity.get("foreign_key_violations"), Some(&serde_json::json!([])));
    assert_eq!(as_i64(&integrity, "unmigrated_tags"), 0);
}

#[test]
fn plan_backfill_is_idempotent_and_audits_clean() {
    let dir = sandbox();
    let db = dir.path().join("index.sqlite3");
    seed_legacy_archive(&db);
    let plan = write_plan(dir.path());

    run_json(["--db", path_str(&db), "db", "migrate"]);

    let backfill = run_json([
        "--db",
        path_str(&db),
        "db",
        "backfill",
        "--plan",
        path_str(&plan),
        "--record-type",
        "Tag",
    ]);
    assert!(as_bool(&backfill, "success"));
    assert_eq!(backfill.pointer("/reports/0/migrated").and_then(Value::as_i64), Some(0));
    assert_eq!(backfill.pointer("/reports/0/unchanged").and_then(Value::as_i64), Some(2));

    let audit = run_json(["--db", path_str(&db), "db", "audit", "--plan", path_str(&plan)]);
    assert!(as_bool(&audit, "clean"));
    assert_eq!(audit.pointer("/reports/0/checked").and_then(Value::as_i64), Some(2));

    let conn = rusqlite::Connection::open(&db)
        .unwrap_or_else(|err| panic!("failed to reopen {}: {err}", db.display()));
    conn.execute("UPDATE core_tag SET abid_uri = 'tampered' WHERE old_id = 7", [])
        .unwrap_or_else(|err| panic!("failed to tamper with tag 7: {err}"));
    drop(conn);

    let tampered = run_abid(["--db", path_str(&db), "db", "audit", "--plan", path_str(&plan)]);
    assert!(!tampered.status.success());
    let payload = parse_stdout(&tampered);
    assert!(!as_bool(&payload, "clean"));
    assert_eq!(
        payload.pointer("/reports/0/mismatches/0/issue/kind").and_then(Value::as_str),
        Some("key_mismatch")
    );
}

#[test]
fn backfill_rejects_unknown_record_type() {
    let dir = sandbox();
    let db = dir.path().join("index.sqlite3");
    let plan = write_plan(dir.path());

    let output = run_abid([
        "--db",
        path_str(&db),
        "db",
        "backfill",
        "--plan",
        path_str(&plan),
        "--record-type",
        "Snapshot",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("record type Snapshot is not in the plan"));
}
