use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dbmaint_api::{ConfigOverrides, DbMaintainConfig, DbMaintainer};
use dbmaint_core::{ExecutedScript, Script, ScriptUpdateAnalysis, ScriptUpdateSet};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "dbm")]
#[command(about = "Keeps a SQLite database in line with a directory of versioned scripts")]
struct Cli {
    #[arg(long, default_value = "./dbmaint.sqlite3")]
    db: PathBuf,

    /// YAML configuration; `./dbmaintain.yaml` is used when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Script location (directory or single file); repeat to scan several.
    #[arg(long = "scripts")]
    scripts: Vec<PathBuf>,

    #[arg(long, default_value_t = false)]
    from_scratch: bool,

    #[arg(long, default_value_t = false)]
    allow_out_of_sequence_patches: bool,

    #[arg(long, default_value_t = false)]
    ignore_deletions: bool,

    #[arg(long, default_value_t = false)]
    no_last_modification_dates: bool,

    #[arg(long, default_value_t = false)]
    auto_create_history_table: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply new and changed scripts.
    Update(UpdateArgs),
    /// Report how the scripts differ from the executed-script history.
    Analyze,
    /// Fail when the scripts cannot be applied incrementally.
    Check,
    MarkUpToDate,
    MarkErrorPerformed,
    MarkErrorReverted,
    /// Drop every database object and empty the history.
    Clear,
    History,
    Scripts,
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
}

#[derive(Debug, Args)]
struct UpdateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum StoreCommand {
    SchemaVersion,
    Migrate(StoreMigrateArgs),
}

#[derive(Debug, Args)]
struct StoreMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            script_locations: self.scripts.clone(),
            from_scratch: self.from_scratch,
            allow_out_of_sequence_patches: self.allow_out_of_sequence_patches,
            ignore_deletions: self.ignore_deletions,
            no_last_modification_dates: self.no_last_modification_dates,
            auto_create_history_table: self.auto_create_history_table,
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
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

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = DbMaintainConfig::load(cli.config.as_deref())?;
    config.apply(&cli.overrides());
    let mut maintainer = DbMaintainer::open(config, &cli.db)?;
    debug!(
        db = %cli.db.display(),
        table = %maintainer.config().executed_scripts_table,
        "opened target database"
    );

    match cli.command {
        Command::Update(args) => run_update(&args, &mut maintainer),
        Command::Analyze => run_analyze(&mut maintainer),
        Command::Check => run_check(&mut maintainer),
        Command::MarkUpToDate => run_mark_up_to_date(&mut maintainer),
        Command::MarkErrorPerformed => {
            let marked = maintainer.mark_error_script_performed()?;
            emit_json(serde_json::json!({ "marked_scripts": marked }))
        }
        Command::MarkErrorReverted => {
            let removed = maintainer.mark_error_script_reverted()?;
            emit_json(serde_json::json!({ "removed_scripts": removed }))
        }
        Command::Clear => {
            let outcome = maintainer.clear_database()?;
            emit_json(serde_json::to_value(outcome)?)
        }
        Command::History => run_history(&mut maintainer),
        Command::Scripts => run_scripts(&maintainer),
        Command::Store { command } => run_store(command, &mut maintainer),
    }
}

fn run_update(args: &UpdateArgs, maintainer: &mut DbMaintainer) -> Result<()> {
    let outcome = maintainer.update_database(args.dry_run)?;
    emit_json(serde_json::to_value(outcome).context("failed to encode update outcome")?)
}

fn run_analyze(maintainer: &mut DbMaintainer) -> Result<()> {
    let analysis = maintainer.analyze()?;
    emit_json(analysis_json(&analysis)?)
}

fn run_check(maintainer: &mut DbMaintainer) -> Result<()> {
    let analysis = maintainer.check_script_updates()?;
    emit_json(analysis_json(&analysis)?)
}

fn run_mark_up_to_date(maintainer: &mut DbMaintainer) -> Result<()> {
    let registered = maintainer.mark_database_as_up_to_date()?;
    emit_json(serde_json::json!({ "registered_scripts": registered }))
}

fn run_history(maintainer: &mut DbMaintainer) -> Result<()> {
    let executed = maintainer.executed_scripts()?;
    let rows = executed.iter().map(executed_script_json).collect::<Result<Vec<_>>>()?;
    emit_json(serde_json::json!({ "executed_scripts": rows }))
}

fn run_scripts(maintainer: &DbMaintainer) -> Result<()> {
    let repository = maintainer.scripts()?;
    let rows = repository.all_scripts().iter().map(script_json).collect::<Vec<_>>();
    emit_json(serde_json::json!({ "scripts": rows }))
}

fn run_store(command: StoreCommand, maintainer: &mut DbMaintainer) -> Result<()> {
    match command {
        StoreCommand::SchemaVersion => {
            let status = maintainer.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy,
                "history_table_exists": status.history_table_exists
            }))
        }
        StoreCommand::Migrate(args) => {
            let result = maintainer.migrate_store(args.dry_run)?;
            emit_json(serde_json::to_value(result)?)
        }
    }
}

fn analysis_json(analysis: &ScriptUpdateAnalysis) -> Result<Value> {
    let updates = &analysis.updates;
    let categories: [(&str, &ScriptUpdateSet); 8] = [
        ("regular", updates.regularly_added_or_modified()),
        ("irregular", updates.irregular_script_updates()),
        ("repeatable_deletion", updates.regularly_deleted_repeatable()),
        ("patch", updates.regularly_added_patch()),
        ("preprocessing", updates.preprocessing_updates()),
        ("postprocessing", updates.postprocessing_updates()),
        ("renamed", updates.regularly_renamed()),
        ("ignored", updates.ignored()),
    ];

    let mut rows = Vec::new();
    for (category, set) in categories {
        for update in set {
            rows.push(serde_json::json!({
                "category": category,
                "update_type": update.update_type.as_str(),
                "file_name": update.script.file_name,
                "renamed_to": update.renamed_to.as_ref().map(|script| script.file_name.clone()),
            }));
        }
    }

    Ok(serde_json::json!({
        "up_to_date": updates.is_empty(),
        "has_irregular_updates": updates.has_irregular_updates(),
        "updates": rows,
        "diagnostics": serde_json::to_value(&analysis.diagnostics)?,
    }))
}

fn script_json(script: &Script) -> Value {
    serde_json::json!({
        "file_name": script.file_name,
        "script_indexes": script.indexes.as_ref().map(ToString::to_string),
        "kind": script.kind.as_str(),
        "patch": script.patch,
        "checksum": script.checksum,
        "file_last_modified_at": script.last_modified_at,
    })
}

fn executed_script_json(executed: &ExecutedScript) -> Result<Value> {
    let mut row = script_json(&executed.script);
    if let Value::Object(object) = &mut row {
        object.insert(
            "executed_at".to_string(),
            Value::String(
                executed.executed_at.format(&Rfc3339).context("failed to format executed_at")?,
            ),
        );
        object.insert("succeeded".to_string(), Value::Bool(executed.succeeded));
    }
    Ok(row)
}
