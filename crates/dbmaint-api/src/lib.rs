use std::path::Path;

use anyhow::{Context, Result};
use dbmaint_core::{
    ChangeAcknowledgement, Diagnostic, ExecutedScript, ExecutionPlan, HistoryOperation,
    MarkerAcknowledgement, NoAcknowledgement, Script, ScriptRepository, ScriptUpdateAnalysis,
    ScriptUpdatesAnalyzer,
};
use dbmaint_repository::ScriptScanner;
use dbmaint_store_sqlite::{SchemaStatus, SqliteDatabase};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

mod config;
mod runner;

pub use config::{ConfigOverrides, DbMaintainConfig, DEFAULT_CONFIG_FILE};
pub use runner::{FileExtensionDispatcher, ScriptRunner, ShellScriptRunner, SqlScriptRunner};

/// Refusals to update that callers may want to tell apart from I/O failures.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error(
        "irregular script updates found and from-scratch updates are disabled:\n  {}",
        .0.join("\n  ")
    )]
    IrregularUpdates(Vec<String>),
    #[error(
        "scripts failed during a previous update and are unchanged: {}; fix the database, then run \
         `mark-error-performed` or `mark-error-reverted`, or enable from-scratch updates",
        .0.join(", ")
    )]
    FailedScripts(Vec<String>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    UpToDate,
    Bookkeeping,
    Incremental,
    FromScratch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenamedScript {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub mode: UpdateMode,
    pub dry_run: bool,
    /// Scripts run, or that would run on a dry run, in execution order.
    pub executed_scripts: Vec<String>,
    pub renamed_scripts: Vec<RenamedScript>,
    pub deleted_scripts: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClearOutcome {
    pub dropped_objects: Vec<String>,
    pub cleared_history_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Keeps one SQLite database in line with a script repository.
pub struct DbMaintainer {
    config: DbMaintainConfig,
    scanner: ScriptScanner,
    database: SqliteDatabase,
    runner: Box<dyn ScriptRunner>,
}

impl DbMaintainer {
    /// Open `db_path` and dispatch scripts by extension with the configured shell.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid or the database cannot be opened.
    pub fn open(config: DbMaintainConfig, db_path: &Path) -> Result<Self> {
        config.validate()?;
        let database = SqliteDatabase::open(db_path, &config.executed_scripts_table)?;
        let scanner = ScriptScanner::new(config.naming_conventions(), &config.script_extensions);
        let runner = Box::new(FileExtensionDispatcher::with_defaults(&config.shell_command));
        Ok(Self { config, scanner, database, runner })
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Box<dyn ScriptRunner>) -> Self {
        self.runner = runner;
        self
    }

    #[must_use]
    pub fn config(&self) -> &DbMaintainConfig {
        &self.config
    }

    #[must_use]
    pub fn database(&self) -> &SqliteDatabase {
        &self.database
    }

    /// # Errors
    /// Returns an error when a script location cannot be scanned.
    pub fn scripts(&self) -> Result<ScriptRepository> {
        self.scanner.scan(&self.config.script_locations)
    }

    /// # Errors
    /// Returns an error when the history table is missing or unreadable.
    pub fn executed_scripts(&mut self) -> Result<Vec<ExecutedScript>> {
        self.database.ensure_history_table(self.config.auto_create_executed_scripts_table)?;
        self.database.executed_scripts()
    }

    /// Classify the repository against the history without changing anything.
    ///
    /// # Errors
    /// Returns an error when scripts or history cannot be read.
    pub fn analyze(&mut self) -> Result<ScriptUpdateAnalysis> {
        let (_, _, analysis) = self.load_analysis()?;
        Ok(analysis)
    }

    /// # Errors
    /// Returns [`UpdateError::IrregularUpdates`] when the repository cannot be applied
    /// incrementally, or an error when scripts or history cannot be read.
    pub fn check_script_updates(&mut self) -> Result<ScriptUpdateAnalysis> {
        let analysis = self.analyze()?;
        if analysis.updates.has_irregular_updates() {
            return Err(irregular_updates_error(&analysis).into());
        }
        Ok(analysis)
    }

    /// Bring the database up to date, rebuilding it when allowed and required.
    ///
    /// Every script is recorded as failed before it runs and as succeeded afterwards, so a
    /// failing script stays visible in the history.
    ///
    /// # Errors
    /// Returns [`UpdateError`] when the update is refused, or an error when a script fails or
    /// the history cannot be maintained.
    pub fn update_database(&mut self, dry_run: bool) -> Result<UpdateOutcome> {
        let (repository, history, analysis) = self.load_analysis()?;
        for diagnostic in &analysis.diagnostics {
            warn!(%diagnostic, "script update diagnostic");
        }
        for ignored in analysis.updates.ignored() {
            info!(update = %ignored, "ignoring missing script");
        }

        let from_scratch = self.config.from_scratch_enabled
            && ((history.is_empty() && !repository.is_empty())
                || analysis.updates.has_irregular_updates()
                || !failed_unchanged_scripts(&history, &repository, &self.config).is_empty());

        if !from_scratch {
            if analysis.updates.has_irregular_updates() {
                return Err(irregular_updates_error(&analysis).into());
            }
            let failed = failed_unchanged_scripts(&history, &repository, &self.config);
            if !failed.is_empty() {
                return Err(UpdateError::FailedScripts(failed).into());
            }
        }

        let plan = if from_scratch {
            ExecutionPlan::from_scratch(&repository)
        } else {
            ExecutionPlan::incremental(&analysis.updates, &repository)
        };
        let mode = if from_scratch {
            UpdateMode::FromScratch
        } else if plan.is_empty() {
            UpdateMode::UpToDate
        } else if plan.scripts.is_empty() {
            UpdateMode::Bookkeeping
        } else {
            UpdateMode::Incremental
        };

        let outcome = UpdateOutcome {
            mode,
            dry_run,
            executed_scripts: plan.scripts.iter().map(|script| script.file_name.clone()).collect(),
            renamed_scripts: plan
                .history_operations
                .iter()
                .filter_map(|operation| match operation {
                    HistoryOperation::Rename { from, to } => {
                        Some(RenamedScript { from: from.clone(), to: to.file_name.clone() })
                    }
                    HistoryOperation::Delete { .. } => None,
                })
                .collect(),
            deleted_scripts: plan
                .history_operations
                .iter()
                .filter_map(|operation| match operation {
                    HistoryOperation::Delete { file_name } => Some(file_name.clone()),
                    HistoryOperation::Rename { .. } => None,
                })
                .collect(),
            diagnostics: analysis.diagnostics,
        };

        info!(
            mode = ?outcome.mode,
            dry_run,
            scripts = outcome.executed_scripts.len(),
            renames = outcome.renamed_scripts.len(),
            deletions = outcome.deleted_scripts.len(),
            "update planned"
        );
        if dry_run {
            return Ok(outcome);
        }

        if from_scratch {
            let dropped = self.database.clear_database()?;
            let cleared = self.database.delete_all_executed_scripts()?;
            info!(dropped = dropped.len(), cleared, "cleared database for from-scratch update");
        }
        self.apply_plan(&plan)?;

        Ok(outcome)
    }

    /// Record every current script as successfully executed without running anything.
    ///
    /// # Errors
    /// Returns an error when scripts cannot be scanned or the history cannot be written.
    pub fn mark_database_as_up_to_date(&mut self) -> Result<Vec<String>> {
        self.database.ensure_history_table(self.config.auto_create_executed_scripts_table)?;
        let repository = self.scripts()?;

        self.database.delete_all_executed_scripts()?;
        let executed_at = OffsetDateTime::now_utc();
        let mut registered = Vec::with_capacity(repository.len());
        for script in repository.all_scripts() {
            self.database.register_executed_script(&ExecutedScript {
                script: script.clone(),
                executed_at,
                succeeded: true,
            })?;
            registered.push(script.file_name.clone());
        }

        info!(scripts = registered.len(), "marked database as up to date");
        Ok(registered)
    }

    /// The failed script was fixed by hand: record it as succeeded.
    ///
    /// # Errors
    /// Returns an error when the history cannot be updated.
    pub fn mark_error_script_performed(&mut self) -> Result<usize> {
        self.database.ensure_history_table(self.config.auto_create_executed_scripts_table)?;
        let marked = self.database.mark_failed_scripts_as_successful()?;
        info!(scripts = marked, "marked failed scripts as performed");
        Ok(marked)
    }

    /// The effects of the failed script were undone by hand: forget it so it runs again.
    ///
    /// # Errors
    /// Returns an error when the history cannot be updated.
    pub fn mark_error_script_reverted(&mut self) -> Result<usize> {
        self.database.ensure_history_table(self.config.auto_create_executed_scripts_table)?;
        let removed = self.database.delete_failed_scripts()?;
        info!(scripts = removed, "removed failed scripts from history");
        Ok(removed)
    }

    /// Drop all database objects and empty the history.
    ///
    /// # Errors
    /// Returns an error when an object cannot be dropped or the history cannot be cleared.
    pub fn clear_database(&mut self) -> Result<ClearOutcome> {
        let dropped_objects = self.database.clear_database()?;
        let cleared_history_entries =
            if self.database.table_exists(self.database.executed_scripts_table())? {
                self.database.delete_all_executed_scripts()?
            } else {
                0
            };

        info!(dropped = dropped_objects.len(), cleared_history_entries, "cleared database");
        Ok(ClearOutcome { dropped_objects, cleared_history_entries })
    }

    /// # Errors
    /// Returns an error when store metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.database.schema_status()
    }

    /// Apply pending store migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate_store(&mut self, dry_run: bool) -> Result<MigrateResult> {
        let before = self.database.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        self.database.migrate()?;
        let after = self.database.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    fn load_analysis(
        &mut self,
    ) -> Result<(ScriptRepository, Vec<ExecutedScript>, ScriptUpdateAnalysis)> {
        let history = self.executed_scripts()?;
        let repository = self.scripts()?;

        let marker;
        let acknowledgement: &dyn ChangeAcknowledgement =
            match self.config.acknowledged_change_marker.as_deref() {
                Some(text) if !text.is_empty() => {
                    marker = MarkerAcknowledgement::new(text);
                    &marker
                }
                _ => &NoAcknowledgement,
            };

        let analysis = ScriptUpdatesAnalyzer::new(self.config.analyzer_policy(), acknowledgement)
            .analyze(&repository, &history);
        Ok((repository, history, analysis))
    }

    fn apply_plan(&mut self, plan: &ExecutionPlan) -> Result<()> {
        for operation in &plan.history_operations {
            match operation {
                HistoryOperation::Rename { from, to } => {
                    self.database.rename_executed_script(from, to)?;
                    info!(from = %from, to = %to.file_name, "renamed executed script");
                }
                HistoryOperation::Delete { file_name } => {
                    self.database.delete_executed_script(file_name)?;
                    info!(script = %file_name, "removed executed script from history");
                }
            }
        }

        for script in &plan.scripts {
            self.execute_script(script)?;
        }
        Ok(())
    }

    fn execute_script(&mut self, script: &Script) -> Result<()> {
        let content = script
            .content
            .read_to_string()
            .with_context(|| format!("failed to read script {}", script.file_name))?;

        self.database.register_executed_script(&ExecutedScript {
            script: script.clone(),
            executed_at: OffsetDateTime::now_utc(),
            succeeded: false,
        })?;
        self.runner
            .execute(script, &content, &self.database)
            .with_context(|| format!("script {} failed; it is recorded as failed", script.file_name))?;
        self.database.mark_succeeded(&script.file_name)?;

        info!(script = %script.file_name, "executed script");
        Ok(())
    }
}

fn irregular_updates_error(analysis: &ScriptUpdateAnalysis) -> UpdateError {
    UpdateError::IrregularUpdates(
        analysis.updates.irregular_updates().iter().map(|update| update.describe()).collect(),
    )
}

/// Incremental or repeatable scripts whose last run failed and that were not edited since.
fn failed_unchanged_scripts(
    history: &[ExecutedScript],
    repository: &ScriptRepository,
    config: &DbMaintainConfig,
) -> Vec<String> {
    history
        .iter()
        .filter(|executed| !executed.succeeded)
        .filter(|executed| executed.script.is_incremental() || executed.script.is_repeatable())
        .filter(|executed| {
            repository.find(&executed.script.file_name).is_some_and(|current| {
                executed.script.content_equals(current, config.use_last_modification_dates)
            })
        })
        .map(|executed| executed.script.file_name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

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

    struct Workspace {
        root: PathBuf,
    }

    impl Workspace {
        fn new(prefix: &str) -> Self {
            let root = unique_temp_dir(prefix);
            fs::create_dir_all(root.join("scripts"))
                .unwrap_or_else(|err| panic!("failed to create scripts dir: {err}"));
            Self { root }
        }

        fn write(&self, relative: &str, body: &str) {
            let path = self.root.join("scripts").join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .unwrap_or_else(|err| panic!("failed to create {}: {err}", parent.display()));
            }
            fs::write(&path, body)
                .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
        }

        fn remove(&self, relative: &str) {
            let path = self.root.join("scripts").join(relative);
            fs::remove_file(&path)
                .unwrap_or_else(|err| panic!("failed to remove {}: {err}", path.display()));
        }

        fn config(&self) -> DbMaintainConfig {
            DbMaintainConfig {
                script_locations: vec![self.root.join("scripts")],
                auto_create_executed_scripts_table: true,
                use_last_modification_dates: false,
                ..DbMaintainConfig::default()
            }
        }

        fn maintainer(&self, config: DbMaintainConfig) -> DbMaintainer {
            match DbMaintainer::open(config, &self.root.join("db.sqlite3")) {
                Ok(maintainer) => maintainer,
                Err(err) => panic!("failed to open maintainer: {err:#}"),
            }
        }
    }

    impl Drop for Workspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    fn update_error(result: Result<UpdateOutcome>) -> UpdateError {
        match result {
            Ok(outcome) => panic!("expected update to be refused, got {outcome:?}"),
            Err(err) => match err.downcast::<UpdateError>() {
                Ok(update_error) => update_error,
                Err(err) => panic!("expected UpdateError, got {err:#}"),
            },
        }
    }

    fn count_rows(maintainer: &DbMaintainer, table: &str) -> Result<Option<i64>> {
        maintainer.database().query_optional_i64(&format!("SELECT COUNT(*) FROM {table}"))
    }

    #[test]
    fn incremental_updates_apply_new_scripts_in_order() -> Result<()> {
        let workspace = Workspace::new("dbmaint-api-incremental");
        workspace.write("V1__create.sql", "CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT);");
        workspace.write("V2__seed.sql", "INSERT INTO person(name) VALUES ('ada');");
        workspace.write("R__view.sql", "DROP VIEW IF EXISTS people; CREATE VIEW people AS SELECT name FROM person;");
        workspace.write("postprocessing/analyze.sql", "ANALYZE;");

        let mut maintainer = workspace.maintainer(workspace.config());
        let first = maintainer.update_database(false)?;
        assert_eq!(first.mode, UpdateMode::Incremental);
        assert_eq!(
            first.executed_scripts,
            vec!["V1__create.sql", "V2__seed.sql", "R__view.sql", "postprocessing/analyze.sql"]
        );
        assert_eq!(count_rows(&maintainer, "people")?, Some(1));

        let second = maintainer.update_database(false)?;
        assert_eq!(second.mode, UpdateMode::UpToDate);
        assert!(second.executed_scripts.is_empty());

        workspace.write("V3__more.sql", "INSERT INTO person(name) VALUES ('grace');");
        let third = maintainer.update_database(false)?;
        assert_eq!(third.executed_scripts, vec!["V3__more.sql", "postprocessing/analyze.sql"]);
        assert_eq!(count_rows(&maintainer, "person")?, Some(2));
        assert!(maintainer.executed_scripts()?.iter().all(|executed| executed.succeeded));
        Ok(())
    }

    #[test]
    fn dry_run_plans_without_touching_the_database() -> Result<()> {
        let workspace = Workspace::new("dbmaint-api-dry-run");
        workspace.write("V1__create.sql", "CREATE TABLE t (id INTEGER);");

        let mut maintainer = workspace.maintainer(workspace.config());
        let planned = maintainer.update_database(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.executed_scripts, vec!["V1__create.sql"]);
        assert!(!maintainer.database().table_exists("t")?);
        assert!(maintainer.executed_scripts()?.is_empty());
        Ok(())
    }

    #[test]
    fn edited_indexed_script_is_refused_or_rebuilt() -> Result<()> {
        let workspace = Workspace::new("dbmaint-api-irregular");
        workspace.write("V1__create.sql", "CREATE TABLE t (id INTEGER);");
        workspace.write("V2__seed.sql", "INSERT INTO t VALUES (1);");

        let mut maintainer = workspace.maintainer(workspace.config());
        maintainer.update_database(false)?;
        maintainer.database().execute_sql_script("INSERT INTO t VALUES (99);")?;

        workspace.write("V2__seed.sql", "INSERT INTO t VALUES (2);");
        match update_error(maintainer.update_database(false)) {
            UpdateError::IrregularUpdates(updates) => {
                assert_eq!(updates, vec!["indexed_script_updated: V2__seed.sql"]);
            }
            other @ UpdateError::FailedScripts(_) => panic!("unexpected error: {other}"),
        }
        assert!(maintainer.check_script_updates().is_err());

        let mut rebuilding = workspace.maintainer(DbMaintainConfig {
            from_scratch_enabled: true,
            ..workspace.config()
        });
        let rebuilt = rebuilding.update_database(false)?;
        assert_eq!(rebuilt.mode, UpdateMode::FromScratch);
        assert_eq!(count_rows(&rebuilding, "t")?, Some(1));
        assert_eq!(rebuilding.database().query_optional_i64("SELECT id FROM t")?, Some(2));
        assert!(rebuilding.check_script_updates()?.updates.is_empty());
        Ok(())
    }

    #[test]
    fn acknowledged_edit_is_recorded_without_running() -> Result<()> {
        let workspace = Workspace::new("dbmaint-api-acknowledged");
        workspace.write("V1__create.sql", "CREATE TABLE t (id INTEGER);");

        let mut maintainer = workspace.maintainer(workspace.config());
        maintainer.update_database(false)?;

        workspace.write(
            "V1__create.sql",
            &format!("{}\nCREATE TABLE t (id INTEGER);", dbmaint_core::DEFAULT_ACKNOWLEDGED_CHANGE_MARKER),
        );
        let outcome = maintainer.update_database(false)?;
        assert_eq!(outcome.mode, UpdateMode::Bookkeeping);
        assert_eq!(
            outcome.renamed_scripts,
            vec![RenamedScript { from: "V1__create.sql".to_string(), to: "V1__create.sql".to_string() }]
        );
        assert_eq!(maintainer.update_database(false)?.mode, UpdateMode::UpToDate);
        Ok(())
    }

    #[test]
    fn failed_script_blocks_until_marked() -> Result<()> {
        let workspace = Workspace::new("dbmaint-api-failure");
        workspace.write("V1__create.sql", "CREATE TABLE t (id INTEGER);");
        workspace.write("V2__broken.sql", "INSERT INTO missing VALUES (1);");
        workspace.write("V3__after.sql", "INSERT INTO t VALUES (3);");

        let mut maintainer = workspace.maintainer(workspace.config());
        assert!(maintainer.update_database(false).is_err());

        let history = maintainer.executed_scripts()?;
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|executed| executed.script.file_name == "V2__broken.sql" && !executed.succeeded));

        match update_error(maintainer.update_database(false)) {
            UpdateError::FailedScripts(scripts) => assert_eq!(scripts, vec!["V2__broken.sql"]),
            other @ UpdateError::IrregularUpdates(_) => panic!("unexpected error: {other}"),
        }

        maintainer.database().execute_sql_script("CREATE TABLE missing (id INTEGER); INSERT INTO missing VALUES (1);")?;
        assert_eq!(maintainer.mark_error_script_performed()?, 1);

        let outcome = maintainer.update_database(false)?;
        assert_eq!(outcome.executed_scripts, vec!["V3__after.sql"]);
        Ok(())
    }

    #[test]
    fn reverted_failure_runs_the_fixed_script_again() -> Result<()> {
        let workspace = Workspace::new("dbmaint-api-revert");
        workspace.write("R__view.sql", "INSERT INTO missing VALUES (1);");

        let mut maintainer = workspace.maintainer(workspace.config());
        assert!(maintainer.update_database(false).is_err());
        assert_eq!(maintainer.mark_error_script_reverted()?, 1);
        assert!(maintainer.executed_scripts()?.is_empty());

        workspace.write("R__view.sql", "CREATE VIEW v AS SELECT 1 AS one;");
        let outcome = maintainer.update_database(false)?;
        assert_eq!(outcome.executed_scripts, vec!["R__view.sql"]);
        Ok(())
    }

    #[test]
    fn renamed_and_deleted_repeatables_only_touch_history() -> Result<()> {
        let workspace = Workspace::new("dbmaint-api-bookkeeping");
        workspace.write("R__a.sql", "CREATE VIEW a AS SELECT 1;");
        workspace.write("R__b.sql", "CREATE VIEW b AS SELECT 2;");

        let recorded = Arc::new(Mutex::new(Vec::new()));
        let mut maintainer = workspace
            .maintainer(workspace.config())
            .with_runner(Box::new(RecordingRunner { executed: Arc::clone(&recorded) }));
        maintainer.update_database(false)?;

        workspace.write("R__renamed_a.sql", "CREATE VIEW a AS SELECT 1;");
        workspace.remove("R__a.sql");
        workspace.remove("R__b.sql");

        let outcome = maintainer.update_database(false)?;
        assert_eq!(outcome.mode, UpdateMode::Bookkeeping);
        assert_eq!(
            outcome.renamed_scripts,
            vec![RenamedScript { from: "R__a.sql".to_string(), to: "R__renamed_a.sql".to_string() }]
        );
        assert_eq!(outcome.deleted_scripts, vec!["R__b.sql"]);

        let names = maintainer
            .executed_scripts()?
            .into_iter()
            .map(|executed| executed.script.file_name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["R__renamed_a.sql"]);

        let executed = recorded.lock().map_err(|_| anyhow::anyhow!("runner lock poisoned"))?.clone();
        assert_eq!(executed, vec!["R__a.sql", "R__b.sql"]);
        Ok(())
    }

    #[test]
    fn mark_up_to_date_and_clear() -> Result<()> {
        let workspace = Workspace::new("dbmaint-api-mark");
        workspace.write("V1__create.sql", "CREATE TABLE t (id INTEGER);");
        workspace.write("R__view.sql", "CREATE VIEW v AS SELECT 1;");

        let mut maintainer = workspace.maintainer(workspace.config());
        let registered = maintainer.mark_database_as_up_to_date()?;
        assert_eq!(registered, vec!["V1__create.sql", "R__view.sql"]);
        assert_eq!(maintainer.update_database(false)?.mode, UpdateMode::UpToDate);
        assert!(!maintainer.database().table_exists("t")?);

        maintainer.database().execute_sql_script("CREATE TABLE leftover (id INTEGER);")?;
        let cleared = maintainer.clear_database()?;
        assert_eq!(cleared.dropped_objects, vec!["leftover"]);
        assert_eq!(cleared.cleared_history_entries, 2);
        Ok(())
    }

    #[test]
    fn missing_history_table_is_an_error_without_auto_create() -> Result<()> {
        let workspace = Workspace::new("dbmaint-api-no-table");
        workspace.write("V1__create.sql", "CREATE TABLE t (id INTEGER);");

        let mut maintainer = workspace.maintainer(DbMaintainConfig {
            auto_create_executed_scripts_table: false,
            ..workspace.config()
        });
        let err = match maintainer.update_database(false) {
            Ok(outcome) => panic!("expected missing table error, got {outcome:?}"),
            Err(err) => format!("{err:#}"),
        };
        assert!(err.contains("dbmaintain_scripts does not exist"));

        let migrated = maintainer.migrate_store(false)?;
        assert_eq!(migrated.would_apply_versions, vec![1]);
        assert_eq!(migrated.up_to_date, Some(true));
        assert_eq!(maintainer.update_database(false)?.mode, UpdateMode::Incremental);
        Ok(())
    }

    struct RecordingRunner {
        executed: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptRunner for RecordingRunner {
        fn execute(&self, script: &Script, _content: &str, _database: &SqliteDatabase) -> Result<()> {
            self.executed
                .lock()
                .map_err(|_| anyhow::anyhow!("runner lock poisoned"))?
                .push(script.file_name.clone());
            Ok(())
        }
    }
}
