use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{anyhow, Context, Result};
use dbmaint_core::Script;
use dbmaint_store_sqlite::SqliteDatabase;
use tracing::debug;

/// Executes the body of one script against the target database.
pub trait ScriptRunner {
    /// # Errors
    /// Returns an error when the script fails; the update run stops there.
    fn execute(&self, script: &Script, content: &str, database: &SqliteDatabase) -> Result<()>;
}

/// Runs SQL through the target database connection as one batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlScriptRunner;

impl ScriptRunner for SqlScriptRunner {
    fn execute(&self, script: &Script, content: &str, database: &SqliteDatabase) -> Result<()> {
        database
            .execute_sql_script(content)
            .with_context(|| format!("failed to execute sql script {}", script.file_name))
    }
}

/// Pipes the script into `<command> -s`, exporting the database path as `DBMAINT_DATABASE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellScriptRunner {
    command: String,
}

impl ShellScriptRunner {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

impl ScriptRunner for ShellScriptRunner {
    fn execute(&self, script: &Script, content: &str, database: &SqliteDatabase) -> Result<()> {
        let mut child = Command::new(&self.command)
            .arg("-s")
            .env("DBMAINT_DATABASE", database.path())
            .env("DBMAINT_SCRIPT", &script.file_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start `{}` for {}", self.command, script.file_name))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin of `{}` is not available", self.command))?;
        let body = content.to_string();
        let writer = thread::spawn(move || stdin.write_all(body.as_bytes()));

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for shell script {}", script.file_name))?;
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(err)) => {
                return Err(anyhow!(err).context(format!("failed to send {} to the shell", script.file_name)))
            }
            Err(_) => return Err(anyhow!("stdin writer for {} panicked", script.file_name)),
        }

        debug!(
            script = %script.file_name,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "shell script finished"
        );

        if !output.status.success() {
            return Err(anyhow!(
                "shell script {} failed with {}: {}",
                script.file_name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Routes each script to the runner registered for its file extension.
#[derive(Default)]
pub struct FileExtensionDispatcher {
    runners: Vec<(String, Box<dyn ScriptRunner>)>,
}

impl FileExtensionDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `.sql` and `.ddl` through the database connection, `.sh` through `shell_command`.
    #[must_use]
    pub fn with_defaults(shell_command: &str) -> Self {
        Self::new()
            .register("sql", Box::new(SqlScriptRunner))
            .register("ddl", Box::new(SqlScriptRunner))
            .register("sh", Box::new(ShellScriptRunner::new(shell_command)))
    }

    #[must_use]
    pub fn register(mut self, extension: &str, runner: Box<dyn ScriptRunner>) -> Self {
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        self.runners.retain(|(registered, _)| *registered != extension);
        self.runners.push((extension, runner));
        self
    }

    fn runner_for(&self, script: &Script) -> Result<&dyn ScriptRunner> {
        let extension = script
            .file_name
            .rsplit_once('.')
            .map(|(_, extension)| extension.to_ascii_lowercase())
            .ok_or_else(|| anyhow!("script {} has no file extension", script.file_name))?;

        self.runners
            .iter()
            .find(|(registered, _)| *registered == extension)
            .map(|(_, runner)| runner.as_ref())
            .ok_or_else(|| {
                anyhow!("no script runner registered for .{extension} ({})", script.file_name)
            })
    }
}

impl ScriptRunner for FileExtensionDispatcher {
    fn execute(&self, script: &Script, content: &str, database: &SqliteDatabase) -> Result<()> {
        self.runner_for(script)?.execute(script, content, database)
    }
}
