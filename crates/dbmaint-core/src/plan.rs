use serde::{Deserialize, Serialize};

use crate::updates::ScriptUpdates;
use crate::{compare_scripts, Script, ScriptKind, ScriptRepository};

/// History change applied without running a script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum HistoryOperation {
    Rename { from: String, to: Script },
    Delete { file_name: String },
}

/// Ordered work for one update run: history bookkeeping first, then scripts to execute.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub history_operations: Vec<HistoryOperation>,
    pub scripts: Vec<Script>,
}

impl ExecutionPlan {
    /// Plan a regular update from a report without irregular updates.
    ///
    /// Every current pre- and post-processing script runs around the regular updates, so
    /// they do not depend on which processing script changed.
    #[must_use]
    pub fn incremental(updates: &ScriptUpdates, repository: &ScriptRepository) -> Self {
        let mut history_operations = Vec::new();

        let renames = updates
            .regularly_renamed()
            .iter()
            .chain(updates.preprocessing_updates().iter())
            .chain(updates.postprocessing_updates().iter());
        for update in renames {
            if let Some(to) = &update.renamed_to {
                history_operations.push(HistoryOperation::Rename {
                    from: update.script.file_name.clone(),
                    to: to.clone(),
                });
            }
        }

        let deletions = updates
            .regularly_deleted_repeatable()
            .iter()
            .chain(updates.preprocessing_updates().iter())
            .chain(updates.postprocessing_updates().iter())
            .filter(|update| update.renamed_to.is_none() && !update.update_type.requires_execution());
        for update in deletions {
            history_operations.push(HistoryOperation::Delete {
                file_name: update.script.file_name.clone(),
            });
        }

        let mut scripts = Vec::new();
        if updates.requires_script_execution() {
            scripts.extend(repository.preprocessing_scripts().into_iter().cloned());
            scripts.extend(updates.regular_updates().into_iter().map(|update| update.current_script().clone()));
            scripts.extend(repository.postprocessing_scripts().into_iter().cloned());
        }

        Self { history_operations, scripts }
    }

    /// Plan a rebuild of an empty database: pre-processing, indexed and repeatable scripts in
    /// script order, then post-processing.
    #[must_use]
    pub fn from_scratch(repository: &ScriptRepository) -> Self {
        let mut body = repository
            .all_scripts()
            .iter()
            .filter(|script| matches!(script.kind, ScriptKind::Incremental | ScriptKind::Repeatable))
            .cloned()
            .collect::<Vec<_>>();
        body.sort_by(compare_scripts);

        let mut scripts = repository.preprocessing_scripts().into_iter().cloned().collect::<Vec<_>>();
        scripts.extend(body);
        scripts.extend(repository.postprocessing_scripts().into_iter().cloned());

        Self { history_operations: Vec::new(), scripts }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history_operations.is_empty() && self.scripts.is_empty()
    }
}
