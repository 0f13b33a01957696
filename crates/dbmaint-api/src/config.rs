use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dbmaint_core::{AnalyzerPolicy, NamingConventions, DEFAULT_ACKNOWLEDGED_CHANGE_MARKER};
use dbmaint_store_sqlite::DEFAULT_EXECUTED_SCRIPTS_TABLE;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "dbmaintain.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DbMaintainConfig {
    pub script_locations: Vec<PathBuf>,
    pub script_extensions: Vec<String>,
    pub preprocessing_dir: String,
    pub postprocessing_dir: String,
    pub patch_qualifier: String,
    /// Rebuild the database when irregular updates are found or nothing was executed yet.
    pub from_scratch_enabled: bool,
    pub auto_create_executed_scripts_table: bool,
    pub allow_out_of_sequence_execution_of_patches: bool,
    pub ignore_deletions: bool,
    pub use_last_modification_dates: bool,
    /// `null` disables acknowledged edits of incremental scripts.
    pub acknowledged_change_marker: Option<String>,
    pub executed_scripts_table: String,
    pub shell_command: String,
}

impl Default for DbMaintainConfig {
    fn default() -> Self {
        Self {
            script_locations: vec![PathBuf::from("scripts")],
            script_extensions: vec!["sql".to_string(), "ddl".to_string(), "sh".to_string()],
            preprocessing_dir: "preprocessing".to_string(),
            postprocessing_dir: "postprocessing".to_string(),
            patch_qualifier: "patch".to_string(),
            from_scratch_enabled: false,
            auto_create_executed_scripts_table: false,
            allow_out_of_sequence_execution_of_patches: false,
            ignore_deletions: false,
            use_last_modification_dates: true,
            acknowledged_change_marker: Some(DEFAULT_ACKNOWLEDGED_CHANGE_MARKER.to_string()),
            executed_scripts_table: DEFAULT_EXECUTED_SCRIPTS_TABLE.to_string(),
            shell_command: "sh".to_string(),
        }
    }
}

/// Command-line switches layered over the loaded configuration. Flags only ever enable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub script_locations: Vec<PathBuf>,
    pub from_scratch: bool,
    pub allow_out_of_sequence_patches: bool,
    pub ignore_deletions: bool,
    pub no_last_modification_dates: bool,
    pub auto_create_history_table: bool,
}

impl DbMaintainConfig {
    /// Load `path`, or `./dbmaintain.yaml` when it exists, or the defaults.
    ///
    /// # Errors
    /// Returns an error when an explicit file is missing, a file cannot be parsed, or the
    /// resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.is_file() {
                    Self::from_file(default_path)?
                } else {
                    debug!("no configuration file found; using defaults");
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        let config = Self::from_yaml_str(&body)
            .with_context(|| format!("invalid configuration file {}", path.display()))?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// # Errors
    /// Returns an error on malformed YAML or unknown keys.
    pub fn from_yaml_str(body: &str) -> Result<Self> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(body).context("failed to parse configuration YAML")
    }

    /// # Errors
    /// Returns an error when no script location or extension is configured, or a
    /// processing directory name is empty.
    pub fn validate(&self) -> Result<()> {
        if self.script_locations.is_empty() {
            return Err(anyhow!("script_locations MUST list at least one location"));
        }
        if self.script_extensions.iter().all(|extension| extension.trim().is_empty()) {
            return Err(anyhow!("script_extensions MUST list at least one extension"));
        }
        if self.preprocessing_dir.is_empty() || self.postprocessing_dir.is_empty() {
            return Err(anyhow!("preprocessing_dir and postprocessing_dir MUST be non-empty"));
        }
        if self.preprocessing_dir == self.postprocessing_dir {
            return Err(anyhow!("preprocessing_dir and postprocessing_dir MUST differ"));
        }
        Ok(())
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if !overrides.script_locations.is_empty() {
            self.script_locations.clone_from(&overrides.script_locations);
        }
        self.from_scratch_enabled |= overrides.from_scratch;
        self.allow_out_of_sequence_execution_of_patches |= overrides.allow_out_of_sequence_patches;
        self.ignore_deletions |= overrides.ignore_deletions;
        self.auto_create_executed_scripts_table |= overrides.auto_create_history_table;
        if overrides.no_last_modification_dates {
            self.use_last_modification_dates = false;
        }
    }

    #[must_use]
    pub fn naming_conventions(&self) -> NamingConventions {
        NamingConventions {
            preprocessing_dir: self.preprocessing_dir.clone(),
            postprocessing_dir: self.postprocessing_dir.clone(),
            patch_qualifier: self.patch_qualifier.clone(),
        }
    }

    #[must_use]
    pub fn analyzer_policy(&self) -> AnalyzerPolicy {
        AnalyzerPolicy {
            use_last_modification_dates: self.use_last_modification_dates,
            allow_out_of_sequence_execution_of_patches: self
                .allow_out_of_sequence_execution_of_patches,
            ignore_deletions: self.ignore_deletions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> DbMaintainConfig {
        match DbMaintainConfig::from_yaml_str(body) {
            Ok(config) => config,
            Err(err) => panic!("failed to parse config: {err:#}"),
        }
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = parse("");
        assert_eq!(config, DbMaintainConfig::default());
        assert_eq!(config.executed_scripts_table, "dbmaintain_scripts");
        assert!(config.use_last_modification_dates);
        assert_eq!(
            config.acknowledged_change_marker.as_deref(),
            Some(DEFAULT_ACKNOWLEDGED_CHANGE_MARKER)
        );
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = parse(
            "script_locations: [db/scripts, db/extra.sql]\n\
             from_scratch_enabled: true\n\
             acknowledged_change_marker: null\n\
             patch_qualifier: hotfix\n",
        );

        assert_eq!(
            config.script_locations,
            vec![PathBuf::from("db/scripts"), PathBuf::from("db/extra.sql")]
        );
        assert!(config.from_scratch_enabled);
        assert_eq!(config.acknowledged_change_marker, None);
        assert_eq!(config.naming_conventions().patch_qualifier, "hotfix");
        assert_eq!(config.script_extensions, vec!["sql", "ddl", "sh"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(DbMaintainConfig::from_yaml_str("script_location: [x]\n").is_err());
    }

    #[test]
    fn overrides_only_enable_switches() {
        let mut config = parse("ignore_deletions: true\n");
        config.apply(&ConfigOverrides {
            script_locations: vec![PathBuf::from("cli/scripts")],
            from_scratch: true,
            no_last_modification_dates: true,
            ..ConfigOverrides::default()
        });

        assert_eq!(config.script_locations, vec![PathBuf::from("cli/scripts")]);
        assert!(config.from_scratch_enabled);
        assert!(config.ignore_deletions);
        assert!(!config.allow_out_of_sequence_execution_of_patches);

        let policy = config.analyzer_policy();
        assert!(!policy.use_last_modification_dates);
        assert!(policy.ignore_deletions);
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut config = DbMaintainConfig { script_locations: Vec::new(), ..DbMaintainConfig::default() };
        assert!(config.validate().is_err());

        config.script_locations = vec![PathBuf::from("scripts")];
        config.postprocessing_dir = config.preprocessing_dir.clone();
        assert!(config.validate().is_err());

        assert!(DbMaintainConfig::default().validate().is_ok());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let missing = std::env::temp_dir().join("dbmaint-config-does-not-exist.yaml");
        assert!(DbMaintainConfig::load(Some(&missing)).is_err());
    }
}
