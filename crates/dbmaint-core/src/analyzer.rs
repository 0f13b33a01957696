use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::updates::{ScriptUpdate, ScriptUpdateType, ScriptUpdates};
use crate::{compare_scripts, ExecutedScript, Script, ScriptIndexes, ScriptKind, ScriptRepository};

pub const DEFAULT_ACKNOWLEDGED_CHANGE_MARKER: &str =
    "-- I have read and understand the implications of changing the incremental script";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyzerPolicy {
    /// Equal modification times mean unchanged content, whatever the checksums say.
    pub use_last_modification_dates: bool,
    pub allow_out_of_sequence_execution_of_patches: bool,
    /// Scripts missing from the repository are reported as ignored instead of deleted.
    pub ignore_deletions: bool,
}

impl Default for AnalyzerPolicy {
    fn default() -> Self {
        Self {
            use_last_modification_dates: true,
            allow_out_of_sequence_execution_of_patches: false,
            ignore_deletions: false,
        }
    }
}

/// Decides whether an edited incremental script may be recorded without a rebuild.
pub trait ChangeAcknowledgement {
    fn is_acknowledged(&self, script: &Script) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoAcknowledgement;

impl ChangeAcknowledgement for NoAcknowledgement {
    fn is_acknowledged(&self, _script: &Script) -> bool {
        false
    }
}

/// Accepts scripts whose content starts with a marker comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerAcknowledgement {
    marker: String,
}

impl MarkerAcknowledgement {
    #[must_use]
    pub fn new(marker: impl Into<String>) -> Self {
        Self { marker: marker.into() }
    }

    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl Default for MarkerAcknowledgement {
    fn default() -> Self {
        Self::new(DEFAULT_ACKNOWLEDGED_CHANGE_MARKER)
    }
}

impl ChangeAcknowledgement for MarkerAcknowledgement {
    fn is_acknowledged(&self, script: &Script) -> bool {
        !self.marker.is_empty() && script.content.starts_with(&self.marker).unwrap_or(false)
    }
}

/// Advisory findings produced while classifying. They never change the classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    SequenceChanged {
        from: String,
        to: String,
        from_indexes: ScriptIndexes,
        to_indexes: ScriptIndexes,
    },
    AmbiguousRename {
        file_name: String,
        candidates: Vec<String>,
    },
    RenameKindMismatch {
        file_name: String,
        candidate: String,
        executed_kind: ScriptKind,
        current_kind: ScriptKind,
    },
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SequenceChanged { from, to, from_indexes, to_indexes } => write!(
                f,
                "indexed script {from} was renamed to {to} and its index changed from {from_indexes} to {to_indexes}"
            ),
            Self::AmbiguousRename { file_name, candidates } => write!(
                f,
                "executed script {file_name} matches several unclaimed scripts by checksum ({}); treated as deleted",
                candidates.join(", ")
            ),
            Self::RenameKindMismatch { file_name, candidate, executed_kind, current_kind } => write!(
                f,
                "executed {executed_kind} script {file_name} has the checksum of {current_kind} script {candidate}; not treated as a rename"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptUpdateAnalysis {
    pub updates: ScriptUpdates,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct ScriptUpdatesAnalyzer<'a> {
    policy: AnalyzerPolicy,
    acknowledgement: &'a dyn ChangeAcknowledgement,
}

impl<'a> ScriptUpdatesAnalyzer<'a> {
    #[must_use]
    pub fn new(policy: AnalyzerPolicy, acknowledgement: &'a dyn ChangeAcknowledgement) -> Self {
        Self { policy, acknowledgement }
    }

    /// Classify the difference between `repository` and `executed`.
    ///
    /// Executed scripts are matched by file name first. Unmatched ones are then offered
    /// the still unclaimed scripts with the same checksum, in script order, and the scripts
    /// nobody claimed are additions. Neither input is modified.
    #[must_use]
    pub fn analyze(
        &self,
        repository: &ScriptRepository,
        executed: &[ExecutedScript],
    ) -> ScriptUpdateAnalysis {
        let mut history = executed.iter().collect::<Vec<_>>();
        history.sort_by(|lhs, rhs| compare_scripts(&lhs.script, &rhs.script));

        let mut analysis = Analysis::new(self.policy, self.acknowledgement, repository);

        let mut unmatched = Vec::new();
        for executed_script in &history {
            if !analysis.match_by_name(executed_script) {
                unmatched.push(*executed_script);
            }
        }

        for executed_script in unmatched {
            analysis.match_by_checksum(executed_script);
        }

        let highest_executed_index = history
            .iter()
            .filter(|executed_script| executed_script.script.is_incremental())
            .filter_map(|executed_script| executed_script.script.indexes.as_ref())
            .max();
        analysis.register_additions(repository, highest_executed_index);

        analysis.finish()
    }
}

/// Classify with the given policy and without accepting any edit of an incremental script.
#[must_use]
pub fn analyze_script_updates(
    repository: &ScriptRepository,
    executed: &[ExecutedScript],
    policy: AnalyzerPolicy,
) -> ScriptUpdateAnalysis {
    ScriptUpdatesAnalyzer::new(policy, &NoAcknowledgement).analyze(repository, executed)
}

struct Analysis<'s> {
    policy: AnalyzerPolicy,
    acknowledgement: &'s dyn ChangeAcknowledgement,
    by_name: HashMap<&'s str, &'s Script>,
    by_checksum: HashMap<&'s str, Vec<&'s Script>>,
    claimed: HashSet<&'s str>,
    updates: ScriptUpdates,
    diagnostics: Vec<Diagnostic>,
}

impl<'s> Analysis<'s> {
    fn new(
        policy: AnalyzerPolicy,
        acknowledgement: &'s dyn ChangeAcknowledgement,
        repository: &'s ScriptRepository,
    ) -> Self {
        let mut by_name = HashMap::new();
        let mut by_checksum: HashMap<&str, Vec<&Script>> = HashMap::new();
        for script in repository.all_scripts() {
            by_name.insert(script.file_name.as_str(), script);
            by_checksum.entry(script.checksum.as_str()).or_default().push(script);
        }

        Self {
            policy,
            acknowledgement,
            by_name,
            by_checksum,
            claimed: HashSet::new(),
            updates: ScriptUpdates::default(),
            diagnostics: Vec::new(),
        }
    }

    fn match_by_name(&mut self, executed: &ExecutedScript) -> bool {
        let Some(current) = self.by_name.get(executed.script.file_name.as_str()).copied() else {
            return false;
        };
        self.claimed.insert(current.file_name.as_str());

        let snapshot = &executed.script;
        if !snapshot.content_equals(current, self.policy.use_last_modification_dates) {
            if snapshot.is_incremental()
                && current.is_incremental()
                && self.acknowledgement.is_acknowledged(current)
            {
                self.register_rename(snapshot, current);
            } else {
                self.register_content_update(snapshot, current);
            }
        } else if !executed.succeeded {
            match current.kind {
                ScriptKind::Preprocessing => self.updates.preprocessing.insert(ScriptUpdate::new(
                    ScriptUpdateType::PreprocessingScriptFailureRerun,
                    current.clone(),
                )),
                ScriptKind::Postprocessing => self.updates.postprocessing.insert(ScriptUpdate::new(
                    ScriptUpdateType::PostprocessingScriptFailureRerun,
                    current.clone(),
                )),
                ScriptKind::Incremental | ScriptKind::Repeatable => false,
            };
        }
        true
    }

    fn register_content_update(&mut self, snapshot: &Script, current: &Script) {
        if snapshot.is_incremental() || current.is_incremental() {
            self.updates.irregular.insert(ScriptUpdate::new(
                ScriptUpdateType::IndexedScriptUpdated,
                current.clone(),
            ));
            return;
        }

        match current.kind {
            ScriptKind::Repeatable => self.updates.regularly_added_or_modified.insert(
                ScriptUpdate::new(ScriptUpdateType::RepeatableScriptUpdated, current.clone()),
            ),
            ScriptKind::Preprocessing => self.updates.preprocessing.insert(ScriptUpdate::new(
                ScriptUpdateType::PreprocessingScriptUpdated,
                current.clone(),
            )),
            ScriptKind::Postprocessing => self.updates.postprocessing.insert(ScriptUpdate::new(
                ScriptUpdateType::PostprocessingScriptUpdated,
                current.clone(),
            )),
            ScriptKind::Incremental => false,
        };
    }

    fn match_by_checksum(&mut self, executed: &ExecutedScript) {
        let snapshot = &executed.script;
        let candidates = self
            .by_checksum
            .get(snapshot.checksum.as_str())
            .map(|scripts| {
                scripts
                    .iter()
                    .copied()
                    .filter(|script| !self.claimed.contains(script.file_name.as_str()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        match *candidates.as_slice() {
            [candidate] if candidate.kind == snapshot.kind => {
                self.claimed.insert(candidate.file_name.as_str());
                self.register_rename(snapshot, candidate);
            }
            [candidate] => {
                self.diagnostics.push(Diagnostic::RenameKindMismatch {
                    file_name: snapshot.file_name.clone(),
                    candidate: candidate.file_name.clone(),
                    executed_kind: snapshot.kind,
                    current_kind: candidate.kind,
                });
                self.register_deletion(snapshot);
            }
            [] => self.register_deletion(snapshot),
            ref several => {
                self.diagnostics.push(Diagnostic::AmbiguousRename {
                    file_name: snapshot.file_name.clone(),
                    candidates: several.iter().map(|script| script.file_name.clone()).collect(),
                });
                self.register_deletion(snapshot);
            }
        }
    }

    fn register_rename(&mut self, from: &Script, to: &Script) {
        let update = |update_type| ScriptUpdate::renamed(update_type, from.clone(), to.clone());
        match to.kind {
            ScriptKind::Incremental => {
                if from.indexes == to.indexes {
                    self.updates
                        .regularly_renamed
                        .insert(update(ScriptUpdateType::IndexedScriptRenamed));
                } else {
                    if let (Some(from_indexes), Some(to_indexes)) = (&from.indexes, &to.indexes) {
                        self.diagnostics.push(Diagnostic::SequenceChanged {
                            from: from.file_name.clone(),
                            to: to.file_name.clone(),
                            from_indexes: from_indexes.clone(),
                            to_indexes: to_indexes.clone(),
                        });
                    }
                    self.updates.irregular.insert(update(
                        ScriptUpdateType::IndexedScriptRenamedScriptSequenceChanged,
                    ));
                }
            }
            ScriptKind::Repeatable => {
                self.updates
                    .regularly_renamed
                    .insert(update(ScriptUpdateType::RepeatableScriptRenamed));
            }
            ScriptKind::Preprocessing => {
                self.updates
                    .preprocessing
                    .insert(update(ScriptUpdateType::PreprocessingScriptRenamed));
            }
            ScriptKind::Postprocessing => {
                self.updates
                    .postprocessing
                    .insert(update(ScriptUpdateType::PostprocessingScriptRenamed));
            }
        }
    }

    fn register_deletion(&mut self, snapshot: &Script) {
        let update_type = match snapshot.kind {
            ScriptKind::Incremental => ScriptUpdateType::IndexedScriptDeleted,
            ScriptKind::Repeatable => ScriptUpdateType::RepeatableScriptDeleted,
            ScriptKind::Preprocessing => ScriptUpdateType::PreprocessingScriptDeleted,
            ScriptKind::Postprocessing => ScriptUpdateType::PostprocessingScriptDeleted,
        };
        let update = ScriptUpdate::new(update_type, snapshot.clone());

        if self.policy.ignore_deletions {
            self.updates.ignored.insert(update);
            return;
        }

        match snapshot.kind {
            ScriptKind::Incremental => self.updates.irregular.insert(update),
            ScriptKind::Repeatable => self.updates.regularly_deleted_repeatable.insert(update),
            ScriptKind::Preprocessing => self.updates.preprocessing.insert(update),
            ScriptKind::Postprocessing => self.updates.postprocessing.insert(update),
        };
    }

    fn register_additions(
        &mut self,
        repository: &'s ScriptRepository,
        highest_executed_index: Option<&ScriptIndexes>,
    ) {
        for script in repository.all_scripts() {
            if self.claimed.contains(script.file_name.as_str()) {
                continue;
            }

            match script.kind {
                ScriptKind::Repeatable => {
                    self.updates.regularly_added_or_modified.insert(ScriptUpdate::new(
                        ScriptUpdateType::RepeatableScriptAdded,
                        script.clone(),
                    ));
                }
                ScriptKind::Preprocessing => {
                    self.updates.preprocessing.insert(ScriptUpdate::new(
                        ScriptUpdateType::PreprocessingScriptAdded,
                        script.clone(),
                    ));
                }
                ScriptKind::Postprocessing => {
                    self.updates.postprocessing.insert(ScriptUpdate::new(
                        ScriptUpdateType::PostprocessingScriptAdded,
                        script.clone(),
                    ));
                }
                ScriptKind::Incremental => self.register_indexed_addition(script, highest_executed_index),
            }
        }
    }

    fn register_indexed_addition(&mut self, script: &Script, highest_executed_index: Option<&ScriptIndexes>) {
        let is_higher = match (highest_executed_index, script.indexes.as_ref()) {
            (None, _) => true,
            (Some(highest), Some(indexes)) => indexes > highest,
            (Some(_), None) => false,
        };

        if is_higher {
            self.updates.regularly_added_or_modified.insert(ScriptUpdate::new(
                ScriptUpdateType::HigherIndexScriptAdded,
                script.clone(),
            ));
        } else if script.patch && self.policy.allow_out_of_sequence_execution_of_patches {
            self.updates.regularly_added_patch.insert(ScriptUpdate::new(
                ScriptUpdateType::LowerIndexPatchScriptAdded,
                script.clone(),
            ));
        } else if script.patch {
            self.updates.irregular.insert(ScriptUpdate::new(
                ScriptUpdateType::LowerIndexPatchScriptAdded,
                script.clone(),
            ));
        } else {
            self.updates.irregular.insert(ScriptUpdate::new(
                ScriptUpdateType::LowerIndexNonPatchScriptAdded,
                script.clone(),
            ));
        }
    }

    fn finish(self) -> ScriptUpdateAnalysis {
        ScriptUpdateAnalysis { updates: self.updates, diagnostics: self.diagnostics }
    }
}
