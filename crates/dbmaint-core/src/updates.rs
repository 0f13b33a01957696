use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{compare_scripts, Script};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScriptUpdateType {
    HigherIndexScriptAdded,
    LowerIndexPatchScriptAdded,
    LowerIndexNonPatchScriptAdded,
    IndexedScriptUpdated,
    IndexedScriptRenamed,
    IndexedScriptRenamedScriptSequenceChanged,
    IndexedScriptDeleted,
    RepeatableScriptAdded,
    RepeatableScriptUpdated,
    RepeatableScriptDeleted,
    RepeatableScriptRenamed,
    PreprocessingScriptAdded,
    PreprocessingScriptUpdated,
    PreprocessingScriptDeleted,
    PreprocessingScriptRenamed,
    PreprocessingScriptFailureRerun,
    PostprocessingScriptAdded,
    PostprocessingScriptUpdated,
    PostprocessingScriptDeleted,
    PostprocessingScriptRenamed,
    PostprocessingScriptFailureRerun,
}

impl ScriptUpdateType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HigherIndexScriptAdded => "higher_index_script_added",
            Self::LowerIndexPatchScriptAdded => "lower_index_patch_script_added",
            Self::LowerIndexNonPatchScriptAdded => "lower_index_non_patch_script_added",
            Self::IndexedScriptUpdated => "indexed_script_updated",
            Self::IndexedScriptRenamed => "indexed_script_renamed",
            Self::IndexedScriptRenamedScriptSequenceChanged => {
                "indexed_script_renamed_script_sequence_changed"
            }
            Self::IndexedScriptDeleted => "indexed_script_deleted",
            Self::RepeatableScriptAdded => "repeatable_script_added",
            Self::RepeatableScriptUpdated => "repeatable_script_updated",
            Self::RepeatableScriptDeleted => "repeatable_script_deleted",
            Self::RepeatableScriptRenamed => "repeatable_script_renamed",
            Self::PreprocessingScriptAdded => "preprocessing_script_added",
            Self::PreprocessingScriptUpdated => "preprocessing_script_updated",
            Self::PreprocessingScriptDeleted => "preprocessing_script_deleted",
            Self::PreprocessingScriptRenamed => "preprocessing_script_renamed",
            Self::PreprocessingScriptFailureRerun => "preprocessing_script_failure_rerun",
            Self::PostprocessingScriptAdded => "postprocessing_script_added",
            Self::PostprocessingScriptUpdated => "postprocessing_script_updated",
            Self::PostprocessingScriptDeleted => "postprocessing_script_deleted",
            Self::PostprocessingScriptRenamed => "postprocessing_script_renamed",
            Self::PostprocessingScriptFailureRerun => "postprocessing_script_failure_rerun",
        }
    }

    /// Whether applying an update of this type runs a script.
    #[must_use]
    pub fn requires_execution(self) -> bool {
        matches!(
            self,
            Self::HigherIndexScriptAdded
                | Self::LowerIndexPatchScriptAdded
                | Self::LowerIndexNonPatchScriptAdded
                | Self::IndexedScriptUpdated
                | Self::RepeatableScriptAdded
                | Self::RepeatableScriptUpdated
                | Self::PreprocessingScriptAdded
                | Self::PreprocessingScriptUpdated
                | Self::PreprocessingScriptFailureRerun
                | Self::PostprocessingScriptAdded
                | Self::PostprocessingScriptUpdated
                | Self::PostprocessingScriptFailureRerun
        )
    }
}

impl Display for ScriptUpdateType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptUpdate {
    pub update_type: ScriptUpdateType,
    pub script: Script,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<Script>,
}

impl ScriptUpdate {
    #[must_use]
    pub fn new(update_type: ScriptUpdateType, script: Script) -> Self {
        Self { update_type, script, renamed_to: None }
    }

    #[must_use]
    pub fn renamed(update_type: ScriptUpdateType, from: Script, to: Script) -> Self {
        Self { update_type, script: from, renamed_to: Some(to) }
    }

    /// The script a plan would run for this update: the rename target when present.
    #[must_use]
    pub fn current_script(&self) -> &Script {
        self.renamed_to.as_ref().unwrap_or(&self.script)
    }

    /// Order by script, then renamed-to script (absent first), then update type.
    #[must_use]
    pub fn cmp(lhs: &Self, rhs: &Self) -> Ordering {
        compare_scripts(&lhs.script, &rhs.script)
            .then_with(|| match (&lhs.renamed_to, &rhs.renamed_to) {
                (Some(lhs), Some(rhs)) => compare_scripts(lhs, rhs),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| lhs.update_type.cmp(&rhs.update_type))
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match &self.renamed_to {
            Some(to) => format!("{}: {} -> {}", self.update_type, self.script.file_name, to.file_name),
            None => format!("{}: {}", self.update_type, self.script.file_name),
        }
    }
}

impl Display for ScriptUpdate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Updates kept sorted with [`ScriptUpdate::cmp`]; equal updates are stored once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "Vec<ScriptUpdate>", into = "Vec<ScriptUpdate>")]
pub struct ScriptUpdateSet {
    updates: Vec<ScriptUpdate>,
}

impl ScriptUpdateSet {
    pub fn insert(&mut self, update: ScriptUpdate) -> bool {
        match self.updates.binary_search_by(|probe| ScriptUpdate::cmp(probe, &update)) {
            Ok(_) => false,
            Err(position) => {
                self.updates.insert(position, update);
                true
            }
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[ScriptUpdate] {
        &self.updates
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScriptUpdate> {
        self.updates.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

impl From<Vec<ScriptUpdate>> for ScriptUpdateSet {
    fn from(updates: Vec<ScriptUpdate>) -> Self {
        let mut set = Self::default();
        for update in updates {
            set.insert(update);
        }
        set
    }
}

impl From<ScriptUpdateSet> for Vec<ScriptUpdate> {
    fn from(set: ScriptUpdateSet) -> Self {
        set.updates
    }
}

impl<'a> IntoIterator for &'a ScriptUpdateSet {
    type Item = &'a ScriptUpdate;
    type IntoIter = std::slice::Iter<'a, ScriptUpdate>;

    fn into_iter(self) -> Self::IntoIter {
        self.updates.iter()
    }
}

/// Classified difference between the script repository and the executed-script history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptUpdates {
    pub(crate) regularly_added_or_modified: ScriptUpdateSet,
    pub(crate) irregular: ScriptUpdateSet,
    pub(crate) regularly_deleted_repeatable: ScriptUpdateSet,
    pub(crate) regularly_added_patch: ScriptUpdateSet,
    pub(crate) preprocessing: ScriptUpdateSet,
    pub(crate) postprocessing: ScriptUpdateSet,
    pub(crate) regularly_renamed: ScriptUpdateSet,
    pub(crate) ignored: ScriptUpdateSet,
}

impl ScriptUpdates {
    #[must_use]
    pub fn regularly_added_or_modified(&self) -> &ScriptUpdateSet {
        &self.regularly_added_or_modified
    }

    #[must_use]
    pub fn irregular_script_updates(&self) -> &ScriptUpdateSet {
        &self.irregular
    }

    #[must_use]
    pub fn regularly_deleted_repeatable(&self) -> &ScriptUpdateSet {
        &self.regularly_deleted_repeatable
    }

    #[must_use]
    pub fn regularly_added_patch(&self) -> &ScriptUpdateSet {
        &self.regularly_added_patch
    }

    #[must_use]
    pub fn preprocessing_updates(&self) -> &ScriptUpdateSet {
        &self.preprocessing
    }

    #[must_use]
    pub fn postprocessing_updates(&self) -> &ScriptUpdateSet {
        &self.postprocessing
    }

    #[must_use]
    pub fn regularly_renamed(&self) -> &ScriptUpdateSet {
        &self.regularly_renamed
    }

    #[must_use]
    pub fn ignored(&self) -> &ScriptUpdateSet {
        &self.ignored
    }

    fn collections(&self) -> [&ScriptUpdateSet; 8] {
        [
            &self.regularly_added_or_modified,
            &self.irregular,
            &self.regularly_deleted_repeatable,
            &self.regularly_added_patch,
            &self.preprocessing,
            &self.postprocessing,
            &self.regularly_renamed,
            &self.ignored,
        ]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collections().iter().all(|set| set.is_empty())
    }

    #[must_use]
    pub fn has_irregular_updates(&self) -> bool {
        !self.irregular.is_empty()
    }

    /// Only repeatable deletions and regular renames: the history changes, no script runs.
    #[must_use]
    pub fn has_only_bookkeeping_updates(&self) -> bool {
        (!self.regularly_deleted_repeatable.is_empty() || !self.regularly_renamed.is_empty())
            && self.regularly_added_or_modified.is_empty()
            && self.irregular.is_empty()
            && self.regularly_added_patch.is_empty()
            && self.preprocessing.is_empty()
            && self.postprocessing.is_empty()
    }

    /// Whether a regular incremental update runs at least one script.
    #[must_use]
    pub fn requires_script_execution(&self) -> bool {
        !self.regularly_added_or_modified.is_empty()
            || !self.regularly_added_patch.is_empty()
            || self
                .preprocessing
                .iter()
                .chain(self.postprocessing.iter())
                .any(|update| update.update_type.requires_execution())
    }

    /// Regular additions and modifications merged with regular patch additions, in script order.
    #[must_use]
    pub fn regular_updates(&self) -> Vec<&ScriptUpdate> {
        let mut merged = self
            .regularly_added_or_modified
            .iter()
            .chain(self.regularly_added_patch.iter())
            .collect::<Vec<_>>();
        merged.sort_by(|lhs, rhs| ScriptUpdate::cmp(lhs, rhs));
        merged
    }

    #[must_use]
    pub fn irregular_updates(&self) -> Vec<&ScriptUpdate> {
        self.irregular.iter().collect()
    }

    /// Every update across all collections, for reporting.
    #[must_use]
    pub fn all_updates(&self) -> Vec<&ScriptUpdate> {
        self.collections().into_iter().flat_map(ScriptUpdateSet::iter).collect()
    }
}
