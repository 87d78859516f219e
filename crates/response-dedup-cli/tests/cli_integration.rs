use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::{json, Value};

const R1: &str = "01J00000000000000000000001";
const R2: &str = "01J00000000000000000000002";
const R3: &str = "01J00000000000000000000003";
const R4: &str = "01J00000000000000000000004";
const R5: &str = "01J00000000000000000000005";

const CONFIG_YAML: &str = "\
chunk_size: 2
modules:
  baseline:
    profile_update_codes: [email, phone]
";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_rdd<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_rdd"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rdd binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rdd(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rdd command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn write_file(path: &Path, body: &str) {
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
}

fn write_ndjson(path: &Path, rows: &[Value]) {
    let body = rows.iter().map(Value::to_string).collect::<Vec<_>>().join("\n");
    write_file(path, &body);
}

fn response_row(
    id: &str,
    participant: &str,
    authored: &str,
    ingested_at: &str,
    answers: Value,
) -> Value {
    json!({
        "response_id": id,
        "participant_id": participant,
        "module_id": "baseline",
        "external_id": format!("ext-{participant}"),
        "authored": authored,
        "ingested_at": ingested_at,
        "answers": answers
    })
}

/// Partial submission, fuller resubmission, then a repeat sharing the first authored time.
fn scenario_rows() -> Vec<Value> {
    vec![
        response_row(
            R1,
            "P-1",
            "2024-03-01T09:00:00Z",
            "2024-03-01T09:00:05Z",
            json!({"basics": "A"}),
        ),
        response_row(
            R2,
            "P-1",
            "2024-03-01T10:00:00Z",
            "2024-03-01T10:00:05Z",
            json!({"basics": "A", "extra": "B"}),
        ),
        response_row(
            R3,
            "P-1",
            "2024-03-01T09:00:00Z",
            "2024-03-01T11:00:05Z",
            json!({"basics": "A"}),
        ),
        response_row(
            R4,
            "P-2",
            "2024-03-02T09:00:00Z",
            "2024-03-02T09:00:05Z",
            json!({"email": "p2@example.org"}),
        ),
        response_row(R5, "P-2", "2024-03-02T10:00:00Z", "2024-03-02T10:00:05Z", json!({})),
    ]
}

struct Sandbox {
    dir: PathBuf,
    db: PathBuf,
    config: PathBuf,
}

impl Sandbox {
    fn seeded(prefix: &str) -> Self {
        let dir = unique_temp_dir(prefix);
        let db = dir.join("responses.sqlite3");
        let config = dir.join("dedup.yaml");
        write_file(&config, CONFIG_YAML);

        let input = dir.join("responses.ndjson");
        write_ndjson(&input, &scenario_rows());
        let ingested =
            run_json(["--db", path_str(&db), "response", "ingest", "--in", path_str(&input)]);
        assert_eq!(as_i64(&ingested, "ingested"), 5);

        Self { dir, db, config }
    }

    fn db(&self) -> &str {
        path_str(&self.db)
    }

    fn config(&self) -> &str {
        path_str(&self.config)
    }

    fn responses(&self) -> Vec<Value> {
        let listed = run_json(["--db", self.db(), "response", "list"]);
        listed
            .get("responses")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_else(|| panic!("missing responses array: {listed}"))
    }

    fn response(&self, id: &str) -> Value {
        self.responses()
            .into_iter()
            .find(|row| row["response_id"] == id)
            .unwrap_or_else(|| panic!("response {id} not listed"))
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn db_commands_cover_schema_version_migrate_integrity_and_backup() {
    let sandbox = unique_temp_dir("rdd-db-commands");
    let db = sandbox.join("responses.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    validate_schema("db-schema-version.response.schema.json", &before);

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(dry_run["would_apply_versions"], json!([1, 2]));
    validate_schema("db-migrate.response.schema.json", &dry_run);
    let after_dry_run = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&after_dry_run, "current_version"), 0);

    let migrated = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrated, "after_version"), 2);
    assert_eq!(migrated["up_to_date"], json!(true));
    validate_schema("db-migrate.response.schema.json", &migrated);

    let report = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(report["quick_check_ok"], json!(true));
    assert_eq!(report["dangling_duplicate_pointers"], json!([]));

    let backup = sandbox.join("backups/responses.backup.sqlite3");
    let backed_up = run_json(["--db", path_str(&db), "db", "backup", "--out", path_str(&backup)]);
    assert_eq!(backed_up["status"], "ok");
    assert!(backup.exists());

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn dry_runs_refuse_unmigrated_database_without_writing() {
    let sandbox = unique_temp_dir("rdd-dry-run-unmigrated");
    let db = sandbox.join("responses.sqlite3");
    let config = sandbox.join("dedup.yaml");
    write_file(&config, CONFIG_YAML);

    let flag = run_rdd(["--db", path_str(&db), "flag-duplicates", "--dry-run"]);
    assert!(!flag.status.success());
    let classify = run_rdd([
        "--db",
        path_str(&db),
        "classify",
        "--config",
        path_str(&config),
        "--all",
        "--dry-run",
    ]);
    assert!(!classify.status.success());
    assert!(String::from_utf8_lossy(&classify.stderr).contains("db migrate"));

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 0);
    assert_eq!(status["pending_versions"], json!([1, 2]));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn classify_resolves_partial_full_and_repeat_scenario() {
    let sandbox = Sandbox::seeded("rdd-classify-scenario");

    let summary =
        run_json(["--db", sandbox.db(), "classify", "--config", sandbox.config(), "--all"]);
    validate_schema("classify.response.schema.json", &summary);
    assert_eq!(as_i64(&summary, "histories_processed"), 2);
    assert_eq!(as_i64(&summary, "rows_written"), 5);
    assert_eq!(as_i64(&summary, "batches_committed"), 3);
    assert_eq!(summary["by_classification"]["duplicate"], json!(2));
    assert_eq!(summary["by_classification"]["complete"], json!(1));

    let r1 = sandbox.response(R1);
    let r2 = sandbox.response(R2);
    let r3 = sandbox.response(R3);
    assert_eq!(r1["classification"], "duplicate");
    assert_eq!(r1["duplicate_of"], R2);
    assert_eq!(r3["classification"], "duplicate");
    assert_eq!(r3["duplicate_of"], R2);
    assert_eq!(r2["classification"], "complete");
    assert_eq!(r2["duplicate_of"], Value::Null);

    let r5 = sandbox.response(R5);
    assert_eq!(r5["classification"], "no_answer_values");
    let reason = r5["reason"].as_str().unwrap_or_default();
    assert!(reason.contains("no complete submission in history"), "unexpected reason: {reason}");

    let listed = run_json(["--db", sandbox.db(), "response", "list", "--participant", "P-1"]);
    validate_schema("response-list.response.schema.json", &listed);
    assert_eq!(as_i64(&listed, "count"), 3);

    let rerun =
        run_json(["--db", sandbox.db(), "classify", "--config", sandbox.config(), "--all"]);
    assert_eq!(as_i64(&rerun, "rows_written"), 0);
    assert_eq!(as_i64(&rerun, "rows_unchanged"), 5);
}

#[test]
fn classify_dry_run_reports_without_writing() {
    let sandbox = Sandbox::seeded("rdd-classify-dry-run");

    let summary = run_json([
        "--db",
        sandbox.db(),
        "classify",
        "--config",
        sandbox.config(),
        "--participant",
        "P-1",
        "--dry-run",
        "--verbose",
    ]);
    validate_schema("classify.response.schema.json", &summary);
    assert_eq!(summary["dry_run"], json!(true));
    assert_eq!(as_i64(&summary, "rows_changed"), 3);
    assert_eq!(as_i64(&summary, "rows_written"), 0);
    assert_eq!(summary["results"].as_array().map(Vec::len), Some(3));

    for row in sandbox.responses() {
        assert_eq!(row["classification"], Value::Null);
    }
}

#[test]
fn classify_reads_participants_from_file() {
    let sandbox = Sandbox::seeded("rdd-classify-participant-file");
    let participants = sandbox.dir.join("participants.txt");
    write_file(&participants, "# follow-up cohort\nP-2\n\n");

    let summary = run_json([
        "--db",
        sandbox.db(),
        "classify",
        "--config",
        sandbox.config(),
        "--participant-file",
        path_str(&participants),
        "--module",
        "baseline",
    ]);
    assert_eq!(as_i64(&summary, "histories_processed"), 1);
    assert_eq!(sandbox.response(R4)["classification"], "partial");
    assert_eq!(sandbox.response(R1)["classification"], Value::Null);
}

#[test]
fn classify_rejects_unknown_module_before_writing() {
    let sandbox = Sandbox::seeded("rdd-classify-unknown-module");
    let extra = sandbox.dir.join("followup.ndjson");
    let mut followup = response_row(
        "01J00000000000000000000006",
        "P-3",
        "2024-03-03T09:00:00Z",
        "2024-03-03T09:00:05Z",
        json!({"basics": "C"}),
    );
    followup["module_id"] = json!("followup");
    write_ndjson(&extra, &[followup]);
    run_json(["--db", sandbox.db(), "response", "ingest", "--in", path_str(&extra)]);

    let output = run_rdd(["--db", sandbox.db(), "classify", "--config", sandbox.config(), "--all"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown module: followup"), "unexpected stderr: {stderr}");

    for row in sandbox.responses() {
        assert_eq!(row["classification"], Value::Null);
    }
}

#[test]
fn classify_requires_exactly_one_selection() {
    let sandbox = Sandbox::seeded("rdd-classify-selection");

    let missing = run_rdd(["--db", sandbox.db(), "classify", "--config", sandbox.config()]);
    assert!(!missing.status.success());

    let conflicting = run_rdd([
        "--db",
        sandbox.db(),
        "classify",
        "--config",
        sandbox.config(),
        "--all",
        "--participant",
        "P-1",
    ]);
    assert!(!conflicting.status.success());
}

#[test]
fn flag_duplicates_converges_and_tracks_watermark() {
    let sandbox = unique_temp_dir("rdd-flag-duplicates");
    let db = sandbox.join("responses.sqlite3");
    let input = sandbox.join("repeats.ndjson");
    let rows = (1..=3)
        .map(|n| {
            response_row(
                &format!("01J0000000000000000000001{n}"),
                "P-9",
                &format!("2024-04-0{n}T08:00:00Z"),
                &format!("2024-04-0{n}T08:00:05Z"),
                json!({"basics": "A", "symptoms": ["cough", "fatigue"]}),
            )
        })
        .collect::<Vec<_>>();
    write_ndjson(&input, &rows);
    run_json(["--db", path_str(&db), "response", "ingest", "--in", path_str(&input)]);

    let dry_run = run_json(["--db", path_str(&db), "flag-duplicates", "--dry-run"]);
    validate_schema("flag-duplicates.response.schema.json", &dry_run);
    assert_eq!(as_i64(&dry_run, "rows_flagged"), 2);
    assert_eq!(as_i64(&dry_run, "rows_written"), 0);

    let first = run_json(["--db", path_str(&db), "flag-duplicates", "--incremental"]);
    validate_schema("flag-duplicates.response.schema.json", &first);
    assert_eq!(as_i64(&first, "rows_written"), 2);
    assert_eq!(as_i64(&first, "new_watermark"), 3);

    let second = run_json(["--db", path_str(&db), "flag-duplicates", "--incremental"]);
    assert_eq!(as_i64(&second, "rows_written"), 0);
    assert_eq!(as_i64(&second, "since_watermark"), 3);

    let full_rescan = run_json(["--db", path_str(&db), "flag-duplicates"]);
    assert_eq!(as_i64(&full_rescan, "rows_written"), 0);

    let listed = run_json(["--db", path_str(&db), "response", "list"]);
    let canonical = "01J00000000000000000000013";
    for row in listed["responses"].as_array().cloned().unwrap_or_default() {
        if row["response_id"] == canonical {
            assert_eq!(row["duplicate_of"], Value::Null);
        } else {
            assert_eq!(row["classification"], "duplicate");
            assert_eq!(row["duplicate_of"], canonical);
        }
    }

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn ingest_reports_the_offending_line() {
    let sandbox = unique_temp_dir("rdd-ingest-errors");
    let db = sandbox.join("responses.sqlite3");
    let input = sandbox.join("broken.ndjson");
    write_file(
        &input,
        &format!(
            "{}\n{{\"participant_id\": \"P-1\"}}\n",
            response_row(R1, "P-1", "2024-03-01T09:00:00Z", "2024-03-01T09:00:05Z", json!({}))
        ),
    );

    let output = run_rdd(["--db", path_str(&db), "response", "ingest", "--in", path_str(&input)]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("line 2"), "unexpected stderr: {stderr}");

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn ingest_output_validates_against_schema() {
    let sandbox = unique_temp_dir("rdd-ingest-schema");
    let db = sandbox.join("responses.sqlite3");
    let input = sandbox.join("responses.ndjson");
    write_ndjson(&input, &scenario_rows());

    let ingested = run_json(["--db", path_str(&db), "response", "ingest", "--in", path_str(&input)]);
    validate_schema("response-ingest.response.schema.json", &ingested);
    assert_eq!(ingested["response_ids"], json!([R1, R2, R3, R4, R5]));

    let _ = fs::remove_dir_all(&sandbox);
}
