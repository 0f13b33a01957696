use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dbmaint_core::{ExecutedScript, Script, ScriptContent, ScriptIndexes, ScriptKind};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

pub const DEFAULT_EXECUTED_SCRIPTS_TABLE: &str = "dbmaintain_scripts";

const STORE_MIGRATIONS_TABLE: &str = "dbmaintain_store_migrations";

const LATEST_STORE_VERSION: i64 = 1;

const CREATE_STORE_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS dbmaintain_store_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

/// Executed-script history plus the SQLite database the scripts are applied to.
pub struct SqliteDatabase {
    conn: Connection,
    path: PathBuf,
    executed_scripts_table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub history_table_exists: bool,
}

impl SqliteDatabase {
    /// Open the target database and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the table name is not a plain SQL identifier, the database
    /// cannot be opened, or pragmas cannot be applied.
    pub fn open(path: &Path, executed_scripts_table: &str) -> Result<Self> {
        validate_identifier(executed_scripts_table)?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            executed_scripts_table: executed_scripts_table.to_string(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn executed_scripts_table(&self) -> &str {
        &self.executed_scripts_table
    }

    /// Report current and target layout versions of the history store.
    ///
    /// # Errors
    /// Returns an error when store metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_STORE_MIGRATIONS_SQL)
            .context("failed to apply dbmaintain_store_migrations table")?;

        let history_table_exists = table_exists(&self.conn, &self.executed_scripts_table)?;
        let recorded = current_store_version(&self.conn)?;
        let (current_version, inferred_from_legacy) = if recorded > 0 {
            (recorded, false)
        } else if history_table_exists {
            (1, true)
        } else {
            (0, false)
        };

        let pending_versions = if current_version < LATEST_STORE_VERSION {
            ((current_version + 1)..=LATEST_STORE_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_STORE_VERSION,
            pending_versions,
            inferred_from_legacy,
            history_table_exists,
        })
    }

    /// Create the history table when needed and record the store layout version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the recorded version is unknown.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_STORE_MIGRATIONS_SQL)
            .context("failed to apply dbmaintain_store_migrations table")?;

        let version = current_store_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start store migration")?;
            if table_exists(&tx, &self.executed_scripts_table)? {
                debug!(table = %self.executed_scripts_table, "adopting existing executed scripts table");
            } else {
                tx.execute_batch(&create_history_table_sql(&self.executed_scripts_table))
                    .with_context(|| {
                        format!("failed to create table {}", self.executed_scripts_table)
                    })?;
                info!(table = %self.executed_scripts_table, "created executed scripts table");
            }
            record_store_version(&tx, 1)?;
            tx.commit().context("failed to commit store migration")?;
        }

        let version = current_store_version(&self.conn)?;
        if version != LATEST_STORE_VERSION {
            return Err(anyhow!(
                "unsupported store version {version}; expected {LATEST_STORE_VERSION}"
            ));
        }

        Ok(())
    }

    /// Make sure the history table is usable, creating it only when `auto_create` is set.
    ///
    /// # Errors
    /// Returns an error that includes the DDL to run when the table is missing and
    /// `auto_create` is off.
    pub fn ensure_history_table(&mut self, auto_create: bool) -> Result<()> {
        if table_exists(&self.conn, &self.executed_scripts_table)? {
            return Ok(());
        }

        if auto_create {
            return self.migrate();
        }

        Err(anyhow!(
            "executed scripts table {table} does not exist; enable auto_create_executed_scripts_table, \
             run `dbm store migrate`, or create it manually:\n{sql}",
            table = self.executed_scripts_table,
            sql = create_history_table_sql(&self.executed_scripts_table).trim()
        ))
    }

    /// List the executed-script history ordered by file name.
    ///
    /// # Errors
    /// Returns an error when the table cannot be read or holds invalid rows.
    pub fn executed_scripts(&self) -> Result<Vec<ExecutedScript>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT file_name, file_last_modified_at, checksum, script_indexes, kind, patch,
                        executed_at, succeeded
                 FROM {} ORDER BY file_name",
                self.executed_scripts_table
            ))
            .with_context(|| format!("failed to query {}", self.executed_scripts_table))?;

        let mut rows = stmt.query([])?;
        let mut executed = Vec::new();
        while let Some(row) = rows.next()? {
            executed.push(executed_script_from_row(row)?);
        }
        Ok(executed)
    }

    /// Insert or replace the history entry for `executed.script.file_name`.
    ///
    /// # Errors
    /// Returns an error when the row cannot be written.
    pub fn register_executed_script(&self, executed: &ExecutedScript) -> Result<()> {
        let script = &executed.script;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {}(
                        file_name, file_last_modified_at, checksum, script_indexes, kind, patch,
                        executed_at, succeeded
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(file_name) DO UPDATE SET
                        file_last_modified_at = excluded.file_last_modified_at,
                        checksum = excluded.checksum,
                        script_indexes = excluded.script_indexes,
                        kind = excluded.kind,
                        patch = excluded.patch,
                        executed_at = excluded.executed_at,
                        succeeded = excluded.succeeded",
                    self.executed_scripts_table
                ),
                params![
                    script.file_name,
                    script.last_modified_at,
                    script.checksum,
                    script.indexes.as_ref().map(ToString::to_string),
                    script.kind.as_str(),
                    i64::from(script.patch),
                    rfc3339(executed.executed_at)?,
                    i64::from(executed.succeeded),
                ],
            )
            .with_context(|| format!("failed to register executed script {}", script.file_name))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when no history entry exists for `file_name`.
    pub fn mark_succeeded(&self, file_name: &str) -> Result<()> {
        let updated = self
            .conn
            .execute(
                &format!(
                    "UPDATE {} SET succeeded = 1 WHERE file_name = ?1",
                    self.executed_scripts_table
                ),
                params![file_name],
            )
            .with_context(|| format!("failed to mark {file_name} as succeeded"))?;

        if updated == 0 {
            return Err(anyhow!("no executed script registered for {file_name}"));
        }
        Ok(())
    }

    /// Move the history entry of `from` to the identity and metadata of `to`, keeping its
    /// execution time and outcome.
    ///
    /// # Errors
    /// Returns an error when no entry exists for `from` or the update fails.
    pub fn rename_executed_script(&mut self, from: &str, to: &Script) -> Result<()> {
        let table = self.executed_scripts_table.clone();
        let tx = self.conn.transaction().context("failed to start rename transaction")?;

        if from != to.file_name {
            tx.execute(&format!("DELETE FROM {table} WHERE file_name = ?1"), params![to.file_name])
                .with_context(|| format!("failed to clear history entry {}", to.file_name))?;
        }

        let updated = tx
            .execute(
                &format!(
                    "UPDATE {table} SET
                        file_name = ?1, file_last_modified_at = ?2, checksum = ?3,
                        script_indexes = ?4, kind = ?5, patch = ?6
                     WHERE file_name = ?7"
                ),
                params![
                    to.file_name,
                    to.last_modified_at,
                    to.checksum,
                    to.indexes.as_ref().map(ToString::to_string),
                    to.kind.as_str(),
                    i64::from(to.patch),
                    from,
                ],
            )
            .with_context(|| format!("failed to rename executed script {from}"))?;

        if updated == 0 {
            return Err(anyhow!("no executed script registered for {from}"));
        }

        tx.commit().context("failed to commit rename transaction")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_executed_script(&self, file_name: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE file_name = ?1", self.executed_scripts_table),
                params![file_name],
            )
            .with_context(|| format!("failed to delete executed script {file_name}"))?;
        Ok(deleted > 0)
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_all_executed_scripts(&self) -> Result<usize> {
        self.conn
            .execute(&format!("DELETE FROM {}", self.executed_scripts_table), [])
            .context("failed to clear executed scripts")
    }

    /// # Errors
    /// Returns an error when the update fails.
    pub fn mark_failed_scripts_as_successful(&self) -> Result<usize> {
        self.conn
            .execute(
                &format!(
                    "UPDATE {} SET succeeded = 1 WHERE succeeded = 0",
                    self.executed_scripts_table
                ),
                [],
            )
            .context("failed to mark failed scripts as successful")
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_failed_scripts(&self) -> Result<usize> {
        self.conn
            .execute(
                &format!("DELETE FROM {} WHERE succeeded = 0", self.executed_scripts_table),
                [],
            )
            .context("failed to delete failed scripts")
    }

    /// Run a batch of SQL statements against the target database.
    ///
    /// # Errors
    /// Returns the SQLite error of the first failing statement.
    pub fn execute_sql_script(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).context("sql script failed")
    }

    /// Drop every view, trigger and table except the history and store-migration tables.
    /// Indexes go with their tables. Returns the dropped object names.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be listed or an object cannot be dropped.
    pub fn clear_database(&self) -> Result<Vec<String>> {
        let objects = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT type, name FROM sqlite_master
                     WHERE type IN ('view', 'trigger', 'table')
                       AND name NOT LIKE 'sqlite_%'
                       AND name NOT IN (?1, ?2)
                     ORDER BY CASE type WHEN 'view' THEN 0 WHEN 'trigger' THEN 1 ELSE 2 END, name",
                )
                .context("failed to list database objects")?;
            let rows = stmt.query_map(
                params![self.executed_scripts_table, STORE_MIGRATIONS_TABLE],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read database objects")?
        };

        self.conn
            .execute_batch("PRAGMA foreign_keys = OFF;")
            .context("failed to disable foreign keys")?;

        let mut dropped = Vec::new();
        let mut outcome = Ok(());
        for (object_type, name) in objects {
            let statement = format!("DROP {} IF EXISTS \"{}\"", object_type.to_uppercase(), name.replace('"', "\"\""));
            if let Err(err) = self.conn.execute_batch(&statement) {
                outcome = Err(anyhow!(err).context(format!("failed to drop {object_type} {name}")));
                break;
            }
            debug!(object_type = %object_type, name = %name, "dropped database object");
            dropped.push(name);
        }

        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to re-enable foreign keys")?;
        outcome?;

        Ok(dropped)
    }

    /// Run one query returning a single value; used to inspect the target database.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn query_optional_i64(&self, sql: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(sql, [], |row| row.get::<_, i64>(0))
            .optional()
            .with_context(|| format!("query failed: {sql}"))
    }

    /// # Errors
    /// Returns an error when the schema cannot be queried.
    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        table_exists(&self.conn, table_name)
    }
}

fn create_history_table_sql(table: &str) -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS {table} (
  file_name TEXT PRIMARY KEY,
  file_last_modified_at INTEGER NOT NULL,
  checksum TEXT NOT NULL,
  script_indexes TEXT,
  kind TEXT NOT NULL CHECK (kind IN ('preprocessing', 'incremental', 'repeatable', 'postprocessing')),
  patch INTEGER NOT NULL CHECK (patch IN (0, 1)),
  executed_at TEXT NOT NULL,
  succeeded INTEGER NOT NULL CHECK (succeeded IN (0, 1))
);
"
    )
}

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Ok(());
    }
    Err(anyhow!("invalid executed scripts table name `{name}`: use letters, digits and underscores"))
}

fn executed_script_from_row(row: &Row<'_>) -> Result<ExecutedScript> {
    let file_name: String = row.get(0)?;
    let raw_indexes: Option<String> = row.get(3)?;
    let raw_kind: String = row.get(4)?;
    let raw_executed_at: String = row.get(6)?;

    let kind = ScriptKind::parse(&raw_kind)
        .ok_or_else(|| anyhow!("invalid script kind `{raw_kind}` for {file_name}"))?;
    let indexes = match raw_indexes.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            ScriptIndexes::parse(raw)
                .with_context(|| format!("invalid script indexes for {file_name}"))?,
        ),
    };

    Ok(ExecutedScript {
        script: Script {
            indexes,
            kind,
            patch: row.get::<_, i64>(5)? != 0,
            checksum: row.get(2)?,
            last_modified_at: row.get(1)?,
            content: ScriptContent::Unavailable,
            file_name,
        },
        executed_at: parse_rfc3339(&raw_executed_at)?,
        succeeded: row.get::<_, i64>(7)? != 0,
    })
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_store_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM dbmaintain_store_migrations",
            [],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to read current store version")?;
    Ok(version)
}

fn record_store_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO dbmaintain_store_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record store version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_migrated() -> Result<SqliteDatabase> {
        let mut database = SqliteDatabase::open(Path::new(":memory:"), DEFAULT_EXECUTED_SCRIPTS_TABLE)?;
        database.migrate()?;
        Ok(database)
    }

    fn executed(file_name: &str, indexes: Option<&[u64]>, kind: ScriptKind, succeeded: bool) -> ExecutedScript {
        ExecutedScript {
            script: Script {
                file_name: file_name.to_string(),
                indexes: indexes.map(|indexes| ScriptIndexes::new(indexes.to_vec())),
                kind,
                patch: false,
                checksum: format!("sum-{file_name}"),
                last_modified_at: 1_700_000_000_000,
                content: ScriptContent::Unavailable,
            },
            executed_at: OffsetDateTime::UNIX_EPOCH,
            succeeded,
        }
    }

    #[test]
    fn fresh_database_reports_pending_store_version() -> Result<()> {
        let mut database = SqliteDatabase::open(Path::new(":memory:"), DEFAULT_EXECUTED_SCRIPTS_TABLE)?;

        let before = database.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);
        assert!(!before.history_table_exists);

        database.migrate()?;
        let after = database.schema_status()?;
        assert_eq!(after.current_version, LATEST_STORE_VERSION);
        assert!(after.pending_versions.is_empty());
        assert!(after.history_table_exists);
        assert!(!after.inferred_from_legacy);

        database.migrate()?;
        assert_eq!(database.schema_status()?, after);
        Ok(())
    }

    #[test]
    fn manually_created_history_table_is_adopted() -> Result<()> {
        let mut database = SqliteDatabase::open(Path::new(":memory:"), "custom_history")?;
        database.conn.execute_batch(&create_history_table_sql("custom_history"))?;

        let status = database.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.inferred_from_legacy);

        database.migrate()?;
        assert!(!database.schema_status()?.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn missing_history_table_explains_how_to_create_it() -> Result<()> {
        let mut database = SqliteDatabase::open(Path::new(":memory:"), DEFAULT_EXECUTED_SCRIPTS_TABLE)?;

        let err = match database.ensure_history_table(false) {
            Ok(()) => panic!("expected missing table error"),
            Err(err) => err.to_string(),
        };
        assert!(err.contains("does not exist"));
        assert!(err.contains("CREATE TABLE IF NOT EXISTS dbmaintain_scripts"));

        database.ensure_history_table(true)?;
        assert!(database.table_exists(DEFAULT_EXECUTED_SCRIPTS_TABLE)?);
        Ok(())
    }

    #[test]
    fn invalid_table_names_are_rejected() {
        for name in ["", "1table", "scripts; DROP TABLE x", "a-b"] {
            assert!(SqliteDatabase::open(Path::new(":memory:"), name).is_err(), "{name} accepted");
        }
    }

    #[test]
    fn history_round_trips_and_upserts() -> Result<()> {
        let database = open_migrated()?;
        let mut first = executed("01_base/V1__init.sql", Some(&[1, 1]), ScriptKind::Incremental, false);
        first.script.patch = true;
        database.register_executed_script(&first)?;
        database.register_executed_script(&executed("R__view.sql", None, ScriptKind::Repeatable, true))?;

        let listed = database.executed_scripts()?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], first);

        first.succeeded = true;
        first.script.checksum = "updated".to_string();
        database.register_executed_script(&first)?;
        let listed = database.executed_scripts()?;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].script.checksum, "updated");
        assert!(listed[0].succeeded);
        Ok(())
    }

    #[test]
    fn rename_moves_identity_and_keeps_outcome() -> Result<()> {
        let mut database = open_migrated()?;
        database.register_executed_script(&executed("V1__old.sql", Some(&[1]), ScriptKind::Incremental, true))?;

        let target = executed("V1__new.sql", Some(&[1]), ScriptKind::Incremental, false).script;
        database.rename_executed_script("V1__old.sql", &target)?;

        let listed = database.executed_scripts()?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].script, target);
        assert!(listed[0].succeeded);

        assert!(database.rename_executed_script("V1__absent.sql", &target).is_err());
        Ok(())
    }

    #[test]
    fn failed_scripts_can_be_marked_or_deleted() -> Result<()> {
        let database = open_migrated()?;
        database.register_executed_script(&executed("V1__a.sql", Some(&[1]), ScriptKind::Incremental, false))?;
        database.register_executed_script(&executed("V2__b.sql", Some(&[2]), ScriptKind::Incremental, true))?;
        database.register_executed_script(&executed("R__c.sql", None, ScriptKind::Repeatable, false))?;

        assert_eq!(database.mark_failed_scripts_as_successful()?, 2);
        assert!(database.executed_scripts()?.iter().all(|executed| executed.succeeded));

        database.register_executed_script(&executed("R__c.sql", None, ScriptKind::Repeatable, false))?;
        assert_eq!(database.delete_failed_scripts()?, 1);
        assert_eq!(database.executed_scripts()?.len(), 2);

        database.mark_succeeded("V1__a.sql")?;
        assert!(database.mark_succeeded("R__c.sql").is_err());
        assert!(database.delete_executed_script("V1__a.sql")?);
        assert!(!database.delete_executed_script("V1__a.sql")?);
        assert_eq!(database.delete_all_executed_scripts()?, 1);
        Ok(())
    }

    #[test]
    fn clear_database_keeps_bookkeeping_tables() -> Result<()> {
        let database = open_migrated()?;
        database.execute_sql_script(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id));
             CREATE INDEX child_parent ON child(parent_id);
             CREATE VIEW child_view AS SELECT * FROM child;
             CREATE TRIGGER child_insert AFTER INSERT ON child BEGIN SELECT 1; END;
             INSERT INTO parent(id) VALUES (1);
             INSERT INTO child(id, parent_id) VALUES (1, 1);",
        )?;
        database.register_executed_script(&executed("V1__a.sql", Some(&[1]), ScriptKind::Incremental, true))?;

        let dropped = database.clear_database()?;
        assert_eq!(dropped, vec!["child_view", "child_insert", "child", "parent"]);
        assert!(!database.table_exists("parent")?);
        assert!(database.table_exists(DEFAULT_EXECUTED_SCRIPTS_TABLE)?);
        assert!(database.table_exists(STORE_MIGRATIONS_TABLE)?);
        assert_eq!(database.executed_scripts()?.len(), 1);
        Ok(())
    }

    #[test]
    fn failing_sql_reports_an_error() -> Result<()> {
        let database = open_migrated()?;
        assert!(database.execute_sql_script("CREATE TABLE broken (").is_err());
        database.execute_sql_script("CREATE TABLE ok (id INTEGER); INSERT INTO ok VALUES (7);")?;
        assert_eq!(database.query_optional_i64("SELECT id FROM ok")?, Some(7));
        Ok(())
    }
}
