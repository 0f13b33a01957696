use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod analyzer;
mod naming;
mod plan;
mod updates;

pub use analyzer::{
    analyze_script_updates, AnalyzerPolicy, ChangeAcknowledgement, Diagnostic,
    MarkerAcknowledgement, NoAcknowledgement, ScriptUpdateAnalysis, ScriptUpdatesAnalyzer,
    DEFAULT_ACKNOWLEDGED_CHANGE_MARKER,
};
pub use naming::{NamingConventions, ScriptName};
pub use plan::{ExecutionPlan, HistoryOperation};
pub use updates::{ScriptUpdate, ScriptUpdateSet, ScriptUpdateType, ScriptUpdates};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MaintainError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("naming error: {0}")]
    Naming(String),
}

/// Ordering key of an indexed script, e.g. `01_schema/002_users.sql` has indexes `1.2`.
///
/// Keys compare element by element; a key that is a prefix of another sorts first.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ScriptIndexes(pub Vec<u64>);

impl ScriptIndexes {
    #[must_use]
    pub fn new(indexes: Vec<u64>) -> Self {
        Self(indexes)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    /// Parse the dotted form written by [`Display`], e.g. `1.2.10`.
    ///
    /// # Errors
    /// Returns [`MaintainError::Naming`] when the value is empty or any element is not a `u64`.
    pub fn parse(value: &str) -> Result<Self, MaintainError> {
        if value.trim().is_empty() {
            return Err(MaintainError::Naming("script indexes MUST be non-empty".to_string()));
        }

        let mut indexes = Vec::new();
        for part in value.split('.') {
            let index = part
                .parse::<u64>()
                .map_err(|err| MaintainError::Naming(format!("invalid script index `{part}`: {err}")))?;
            indexes.push(index);
        }
        Ok(Self(indexes))
    }
}

impl Display for ScriptIndexes {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let rendered = self.0.iter().map(u64::to_string).collect::<Vec<_>>().join(".");
        write!(f, "{rendered}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Preprocessing,
    Incremental,
    Repeatable,
    Postprocessing,
}

impl ScriptKind {
    /// Position of the kind in the script ordering once ordering keys are equal.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Preprocessing => 0,
            Self::Incremental => 1,
            Self::Repeatable => 2,
            Self::Postprocessing => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preprocessing => "preprocessing",
            Self::Incremental => "incremental",
            Self::Repeatable => "repeatable",
            Self::Postprocessing => "postprocessing",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "preprocessing" => Some(Self::Preprocessing),
            "incremental" => Some(Self::Incremental),
            "repeatable" => Some(Self::Repeatable),
            "postprocessing" => Some(Self::Postprocessing),
            _ => None,
        }
    }
}

impl Display for ScriptKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the body of a script can be read from. Reads happen on demand.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub enum ScriptContent {
    File(PathBuf),
    Inline(Arc<str>),
    /// History snapshots only carry metadata.
    #[default]
    Unavailable,
}

impl ScriptContent {
    #[must_use]
    pub fn inline(content: &str) -> Self {
        Self::Inline(Arc::from(content))
    }

    /// Read the full script body.
    ///
    /// # Errors
    /// Returns an I/O error when the file cannot be read or the content is unavailable.
    pub fn read_to_string(&self) -> io::Result<String> {
        match self {
            Self::File(path) => std::fs::read_to_string(path),
            Self::Inline(content) => Ok(content.to_string()),
            Self::Unavailable => Err(unavailable_content_error()),
        }
    }

    /// Check whether the body starts with `prefix`, reading no more than `prefix.len()` bytes.
    ///
    /// # Errors
    /// Returns an I/O error when the file cannot be read or the content is unavailable.
    pub fn starts_with(&self, prefix: &str) -> io::Result<bool> {
        match self {
            Self::File(path) => {
                let file = File::open(path)?;
                let limit = u64::try_from(prefix.len()).unwrap_or(u64::MAX);
                let mut head = Vec::with_capacity(prefix.len());
                file.take(limit).read_to_end(&mut head)?;
                Ok(head == prefix.as_bytes())
            }
            Self::Inline(content) => Ok(content.starts_with(prefix)),
            Self::Unavailable => Err(unavailable_content_error()),
        }
    }
}

fn unavailable_content_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "script content is not available")
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Script {
    /// Path relative to its script location, `/`-separated. Unique within a repository.
    pub file_name: String,
    pub indexes: Option<ScriptIndexes>,
    pub kind: ScriptKind,
    #[serde(default)]
    pub patch: bool,
    pub checksum: String,
    /// Milliseconds since the unix epoch.
    pub last_modified_at: i64,
    #[serde(skip)]
    pub content: ScriptContent,
}

impl Script {
    /// Validate the structural invariants of one script descriptor.
    ///
    /// # Errors
    /// Returns [`MaintainError::Validation`] when the name or checksum is empty, when the
    /// presence of an ordering key does not match the kind, or when a non-indexed script is
    /// flagged as a patch.
    pub fn validate(&self) -> Result<(), MaintainError> {
        if self.file_name.trim().is_empty() {
            return Err(MaintainError::Validation("file_name MUST be provided".to_string()));
        }

        if self.checksum.trim().is_empty() {
            return Err(MaintainError::Validation(format!(
                "checksum MUST be provided for script {}",
                self.file_name
            )));
        }

        match (&self.indexes, self.kind) {
            (None, ScriptKind::Incremental) => Err(MaintainError::Validation(format!(
                "incremental script {} MUST have script indexes",
                self.file_name
            ))),
            (Some(indexes), ScriptKind::Incremental) if indexes.0.is_empty() => {
                Err(MaintainError::Validation(format!(
                    "indexed script {} MUST have at least one index",
                    self.file_name
                )))
            }
            (Some(_), ScriptKind::Incremental) => Ok(()),
            (Some(_), kind) => Err(MaintainError::Validation(format!(
                "{kind} script {} MUST NOT have script indexes",
                self.file_name
            ))),
            (None, _) if self.patch => Err(MaintainError::Validation(format!(
                "only indexed scripts can be patch scripts: {}",
                self.file_name
            ))),
            (None, _) => Ok(()),
        }
    }

    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.kind == ScriptKind::Incremental
    }

    #[must_use]
    pub fn is_repeatable(&self) -> bool {
        self.kind == ScriptKind::Repeatable
    }

    #[must_use]
    pub fn is_preprocessing(&self) -> bool {
        self.kind == ScriptKind::Preprocessing
    }

    #[must_use]
    pub fn is_postprocessing(&self) -> bool {
        self.kind == ScriptKind::Postprocessing
    }

    /// Dotted ordering key, or an empty string for non-indexed scripts.
    #[must_use]
    pub fn indexes_string(&self) -> String {
        self.indexes.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    /// Whether `other` holds the same content as `self`.
    ///
    /// With `use_last_modification_dates`, identical modification times short-circuit to
    /// "unchanged" without looking at checksums.
    #[must_use]
    pub fn content_equals(&self, other: &Script, use_last_modification_dates: bool) -> bool {
        if use_last_modification_dates && self.last_modified_at == other.last_modified_at {
            return true;
        }
        self.checksum == other.checksum
    }
}

/// Total order over scripts: ordering key (indexed first), then kind, then file name.
#[must_use]
pub fn compare_scripts(lhs: &Script, rhs: &Script) -> Ordering {
    compare_indexes(lhs.indexes.as_ref(), rhs.indexes.as_ref())
        .then_with(|| lhs.kind.rank().cmp(&rhs.kind.rank()))
        .then_with(|| lhs.file_name.cmp(&rhs.file_name))
}

fn compare_indexes(lhs: Option<&ScriptIndexes>, rhs: Option<&ScriptIndexes>) -> Ordering {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => lhs.cmp(rhs),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutedScript {
    pub script: Script,
    #[serde(with = "time::serde::rfc3339")]
    pub executed_at: OffsetDateTime,
    pub succeeded: bool,
}

/// Snapshot of every script currently available, sorted with [`compare_scripts`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptRepository {
    scripts: Vec<Script>,
}

impl ScriptRepository {
    /// Build a repository snapshot.
    ///
    /// # Errors
    /// Returns [`MaintainError::Validation`] when a script is invalid or two scripts share a
    /// file name.
    pub fn new(mut scripts: Vec<Script>) -> Result<Self, MaintainError> {
        let mut names = BTreeSet::new();
        for script in &scripts {
            script.validate()?;
            if !names.insert(script.file_name.as_str()) {
                return Err(MaintainError::Validation(format!(
                    "duplicate script file name: {}",
                    script.file_name
                )));
            }
        }

        scripts.sort_by(compare_scripts);
        Ok(Self { scripts })
    }

    #[must_use]
    pub fn all_scripts(&self) -> &[Script] {
        &self.scripts
    }

    #[must_use]
    pub fn indexed_scripts(&self) -> Vec<&Script> {
        self.scripts_of_kind(ScriptKind::Incremental)
    }

    #[must_use]
    pub fn repeatable_scripts(&self) -> Vec<&Script> {
        self.scripts_of_kind(ScriptKind::Repeatable)
    }

    #[must_use]
    pub fn preprocessing_scripts(&self) -> Vec<&Script> {
        self.scripts_of_kind(ScriptKind::Preprocessing)
    }

    #[must_use]
    pub fn postprocessing_scripts(&self) -> Vec<&Script> {
        self.scripts_of_kind(ScriptKind::Postprocessing)
    }

    #[must_use]
    pub fn find(&self, file_name: &str) -> Option<&Script> {
        self.scripts.iter().find(|script| script.file_name == file_name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    fn scripts_of_kind(&self, kind: ScriptKind) -> Vec<&Script> {
        self.scripts.iter().filter(|script| script.kind == kind).collect()
    }
}
