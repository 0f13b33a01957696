use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{anyhow, Context, Result};
use dbmaint_core::{NamingConventions, Script, ScriptContent, ScriptRepository};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

/// Builds a [`ScriptRepository`] from script locations on disk.
#[derive(Debug, Clone)]
pub struct ScriptScanner {
    conventions: NamingConventions,
    extensions: Vec<String>,
}

impl ScriptScanner {
    /// Extensions are matched case-insensitively; a leading `.` is ignored.
    #[must_use]
    pub fn new(conventions: NamingConventions, extensions: &[String]) -> Self {
        let extensions = extensions
            .iter()
            .map(|extension| extension.trim_start_matches('.').to_ascii_lowercase())
            .filter(|extension| !extension.is_empty())
            .collect();
        Self { conventions, extensions }
    }

    #[must_use]
    pub fn conventions(&self) -> &NamingConventions {
        &self.conventions
    }

    /// Scan every location and validate the combined snapshot.
    ///
    /// # Errors
    /// Returns an error when a location is missing or unreadable, a name breaks the naming
    /// conventions, or two locations yield the same relative file name.
    pub fn scan(&self, locations: &[PathBuf]) -> Result<ScriptRepository> {
        let mut scripts = Vec::new();
        for location in locations {
            scripts.extend(self.scan_location(location)?);
        }

        let repository = ScriptRepository::new(scripts).context("invalid script repository")?;
        debug!(scripts = repository.len(), locations = locations.len(), "scanned script repository");
        Ok(repository)
    }

    /// Scan one directory, or a single script file, in file-name order.
    ///
    /// # Errors
    /// Returns an error when the location cannot be read or a file name cannot be classified.
    pub fn scan_location(&self, location: &Path) -> Result<Vec<Script>> {
        let metadata = fs::metadata(location)
            .with_context(|| format!("script location does not exist: {}", location.display()))?;

        if metadata.is_file() {
            let file_name = location
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("script file name is not valid UTF-8: {}", location.display()))?;
            return Ok(vec![self.load_script(location, file_name.to_string())?]);
        }

        let mut scripts = Vec::new();
        for entry in WalkDir::new(location)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()))
        {
            let entry = entry
                .with_context(|| format!("failed to walk script location {}", location.display()))?;
            if !entry.file_type().is_file() || !self.has_script_extension(entry.path()) {
                continue;
            }

            let file_name = relative_file_name(location, entry.path())?;
            scripts.push(self.load_script(entry.path(), file_name)?);
        }

        debug!(location = %location.display(), scripts = scripts.len(), "scanned script location");
        Ok(scripts)
    }

    fn has_script_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| {
                self.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(extension))
            })
    }

    fn load_script(&self, path: &Path, file_name: String) -> Result<Script> {
        let name = self
            .conventions
            .parse(&file_name)
            .with_context(|| format!("invalid script name {file_name}"))?;
        let bytes =
            fs::read(path).with_context(|| format!("failed to read script {}", path.display()))?;
        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to read metadata of {}", path.display()))?;
        let modified = metadata
            .modified()
            .with_context(|| format!("modification time unavailable for {}", path.display()))?;
        let millis = modified.duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_millis()).unwrap_or(0);

        Ok(Script {
            file_name,
            indexes: name.indexes,
            kind: name.kind,
            patch: name.patch,
            checksum: sha256_checksum(&bytes),
            last_modified_at: i64::try_from(millis).unwrap_or(i64::MAX),
            content: ScriptContent::File(path.to_path_buf()),
        })
    }
}

#[must_use]
pub fn sha256_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|name| name.starts_with('.'))
}

fn relative_file_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is not inside {}", path.display(), root.display()))?;

    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(
                segment
                    .to_str()
                    .ok_or_else(|| anyhow!("script path is not valid UTF-8: {}", path.display()))?,
            ),
            _ => return Err(anyhow!("unexpected component in script path {}", path.display())),
        }
    }
    Ok(segments.join("/"))
}
