use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use response_dedup_core::{
    run_classification_pass, run_flagging_pass, ClassificationOptions, EngineConfig,
    FlaggingOptions, HistorySelection, ParticipantSelection, PointerPolicy,
};
use response_dedup_store_sqlite::{NewResponse, ResponseFilter, SqliteStore};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV_VAR: &str = "RDD_LOG";

#[derive(Debug, Parser)]
#[command(name = "rdd")]
#[command(about = "Response duplicate detection and classification")]
struct Cli {
    #[arg(long, default_value = "./responses.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Response {
        #[command(subcommand)]
        command: Box<ResponseCommand>,
    },
    /// Flag verbatim repeats across the whole response table.
    FlagDuplicates(FlagDuplicatesArgs),
    /// Classify participant module histories.
    Classify(ClassifyArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ResponseCommand {
    /// Ingest newline-delimited JSON responses.
    Ingest(IngestArgs),
    List(ListArgs),
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    participant: Option<String>,
    #[arg(long)]
    module: Option<String>,
}

#[derive(Debug, Args)]
struct PassArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long, value_enum)]
    pointer_policy: Option<PointerPolicyArg>,
}

#[derive(Debug, Args)]
struct FlagDuplicatesArgs {
    /// Only revisit classes touched since the last recorded run.
    #[arg(long, default_value_t = false)]
    incremental: bool,
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(flatten)]
    pass: PassArgs,
}

#[derive(Debug, Args)]
struct ClassifyArgs {
    #[arg(long)]
    config: PathBuf,
    #[command(flatten)]
    selection: SelectionArgs,
    #[arg(long)]
    module: Option<String>,
    /// Include every per-row result in the output.
    #[arg(long, default_value_t = false)]
    verbose: bool,
    #[arg(long)]
    workers: Option<usize>,
    #[command(flatten)]
    pass: PassArgs,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct SelectionArgs {
    #[arg(long, default_value_t = false)]
    all: bool,
    #[arg(long = "participant")]
    participants: Vec<String>,
    /// File with one participant id per line.
    #[arg(long)]
    participant_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PointerPolicyArg {
    Canonical,
    Immediate,
}

impl PointerPolicyArg {
    fn into_policy(self) -> PointerPolicy {
        match self {
            Self::Canonical => PointerPolicy::Canonical,
            Self::Immediate => PointerPolicy::Immediate,
        }
    }
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

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Response { command } => run_response(*command, &mut store),
        Command::FlagDuplicates(args) => run_flag_duplicates(&args, &mut store),
        Command::Classify(args) => run_classify(&args, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
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

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_response(command: ResponseCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        ResponseCommand::Ingest(args) => {
            let file = fs::File::open(&args.input).with_context(|| {
                format!("failed to open response file {}", args.input.display())
            })?;

            let mut response_ids = Vec::new();
            for (index, line) in BufReader::new(file).lines().enumerate() {
                let line_number = index + 1;
                let line = line.with_context(|| {
                    format!("failed to read line {line_number} of {}", args.input.display())
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                let new: NewResponse = serde_json::from_str(&line)
                    .with_context(|| format!("invalid response on line {line_number}"))?;
                let stored = store
                    .insert_response(&new)
                    .with_context(|| format!("failed to ingest line {line_number}"))?;
                response_ids.push(stored.response_id.to_string());
            }

            info!(count = response_ids.len(), "ingested responses");
            emit_json(serde_json::json!({
                "ingested": response_ids.len(),
                "response_ids": response_ids
            }))
        }
        ResponseCommand::List(args) => {
            let responses = store.list_responses(&ResponseFilter {
                participant_id: args.participant,
                module_id: args.module,
            })?;
            emit_json(serde_json::json!({
                "count": responses.len(),
                "responses": responses
            }))
        }
    }
}

fn run_flag_duplicates(args: &FlagDuplicatesArgs, store: &mut SqliteStore) -> Result<()> {
    prepare_schema(store, args.pass.dry_run)?;
    let config = resolve_config(args.config.as_deref(), &args.pass, None)?;
    let options = FlaggingOptions {
        incremental: args.incremental,
        dry_run: args.pass.dry_run,
        ..FlaggingOptions::from_config(&config)
    };

    let summary = run_flagging_pass(store, &options)?;
    emit_json(serde_json::to_value(&summary).context("failed to serialize flagging summary")?)
}

fn run_classify(args: &ClassifyArgs, store: &mut SqliteStore) -> Result<()> {
    prepare_schema(store, args.pass.dry_run)?;
    let config = resolve_config(Some(args.config.as_path()), &args.pass, args.workers)?;
    let selection = HistorySelection {
        participants: participant_selection(&args.selection)?,
        module_id: args.module.clone(),
    };
    let options = ClassificationOptions { dry_run: args.pass.dry_run, verbose: args.verbose };

    let summary = run_classification_pass(store, &config, &selection, options)?;
    emit_json(serde_json::to_value(&summary).context("failed to serialize classification summary")?)
}

/// Migrate before a pass; a dry run only checks that nothing is pending.
fn prepare_schema(store: &mut SqliteStore, dry_run: bool) -> Result<()> {
    if !dry_run {
        return store.migrate();
    }
    let status = store.schema_status()?;
    if status.pending_versions.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "dry run needs an up-to-date schema; pending versions {:?} (run `rdd db migrate`)",
            status.pending_versions
        ))
    }
}

/// Load the engine config (defaults when no file is given) and apply CLI overrides.
fn resolve_config(
    path: Option<&Path>,
    pass: &PassArgs,
    workers: Option<usize>,
) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };

    if let Some(chunk_size) = pass.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(policy) = pass.pointer_policy {
        config.pointer_policy = policy.into_policy();
    }
    if let Some(workers) = workers {
        config.workers = workers;
    }

    config.validate()?;
    Ok(config)
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn participant_selection(args: &SelectionArgs) -> Result<ParticipantSelection> {
    if args.all {
        return Ok(ParticipantSelection::All);
    }

    let mut participants = args.participants.clone();
    if let Some(path) = args.participant_file.as_deref() {
        participants.extend(read_participant_file(path)?);
    }

    let participants = participants
        .into_iter()
        .map(|participant| participant.trim().to_string())
        .filter(|participant| !participant.is_empty())
        .collect::<Vec<_>>();
    if participants.is_empty() {
        return Err(anyhow!("participant selection MUST name at least one participant id"));
    }
    Ok(ParticipantSelection::Only(participants))
}

fn read_participant_file(path: &Path) -> Result<Vec<String>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read participant file {}", path.display()))?;
    Ok(body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
