use serde::{Deserialize, Serialize};

use crate::{MaintainError, ScriptIndexes, ScriptKind};

/// Rules that derive ordering key, kind and patch flag from a script's relative file name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamingConventions {
    pub preprocessing_dir: String,
    pub postprocessing_dir: String,
    pub patch_qualifier: String,
}

impl Default for NamingConventions {
    fn default() -> Self {
        Self {
            preprocessing_dir: "preprocessing".to_string(),
            postprocessing_dir: "postprocessing".to_string(),
            patch_qualifier: "patch".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptName {
    pub indexes: Option<ScriptIndexes>,
    pub kind: ScriptKind,
    pub patch: bool,
}

struct Segment<'a> {
    indexes: Vec<u64>,
    description: &'a str,
}

impl NamingConventions {
    /// Classify a `/`-separated file name relative to its script location.
    ///
    /// Each segment may carry indexes: `V1.2__desc`, `V1_2__desc` and `01_desc` are indexed,
    /// `R__desc` and plain names are not. A script is incremental when its file segment is
    /// indexed; its ordering key is then the indexes of all indexed directory segments
    /// followed by the file's own.
    ///
    /// # Errors
    /// Returns [`MaintainError::Naming`] for empty names or segments, a `V<n>` segment without
    /// the `__` separator, or an index that does not fit in a `u64`.
    pub fn parse(&self, file_name: &str) -> Result<ScriptName, MaintainError> {
        let segments = file_name.split('/').collect::<Vec<_>>();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(MaintainError::Naming(format!("invalid script file name `{file_name}`")));
        }

        let Some((file_segment, directories)) = segments.split_last() else {
            return Err(MaintainError::Naming("script file name MUST be provided".to_string()));
        };

        if directories.first() == Some(&self.preprocessing_dir.as_str()) {
            return Ok(ScriptName { indexes: None, kind: ScriptKind::Preprocessing, patch: false });
        }
        if directories.first() == Some(&self.postprocessing_dir.as_str()) {
            return Ok(ScriptName { indexes: None, kind: ScriptKind::Postprocessing, patch: false });
        }

        let file = parse_segment(strip_extension(file_segment))?;
        if file.indexes.is_empty() {
            return Ok(ScriptName { indexes: None, kind: ScriptKind::Repeatable, patch: false });
        }

        let mut indexes = Vec::new();
        for directory in directories {
            indexes.extend(parse_segment(directory)?.indexes);
        }
        indexes.extend(file.indexes);

        Ok(ScriptName {
            indexes: Some(ScriptIndexes::new(indexes)),
            kind: ScriptKind::Incremental,
            patch: self.is_patch(file.description),
        })
    }

    fn is_patch(&self, description: &str) -> bool {
        if self.patch_qualifier.is_empty() {
            return false;
        }
        description.split('_').any(|token| {
            token
                .strip_prefix('#')
                .is_some_and(|qualifier| qualifier.eq_ignore_ascii_case(&self.patch_qualifier))
        })
    }
}

fn strip_extension(segment: &str) -> &str {
    match segment.rsplit_once('.') {
        Some((stem, extension))
            if !stem.is_empty()
                && !extension.is_empty()
                && extension.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            stem
        }
        _ => segment,
    }
}

fn parse_segment(segment: &str) -> Result<Segment<'_>, MaintainError> {
    if let Some(description) = segment.strip_prefix("R__") {
        return Ok(Segment { indexes: Vec::new(), description });
    }

    if let Some(rest) = segment.strip_prefix('V') {
        if rest.starts_with(|c: char| c.is_ascii_digit()) {
            let Some((version, description)) = rest.split_once("__") else {
                return Err(MaintainError::Naming(format!(
                    "versioned segment `{segment}` MUST separate its version with `__`"
                )));
            };
            let indexes = version
                .split(['.', '_'])
                .map(|part| parse_index(part, segment))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Segment { indexes, description });
        }
    }

    let digits = segment.len() - segment.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        let (index, rest) = segment.split_at(digits);
        if rest.is_empty() || rest.starts_with('_') {
            let description = rest.strip_prefix('_').unwrap_or(rest);
            return Ok(Segment { indexes: vec![parse_index(index, segment)?], description });
        }
    }

    Ok(Segment { indexes: Vec::new(), description: segment })
}

fn parse_index(part: &str, segment: &str) -> Result<u64, MaintainError> {
    part.parse::<u64>()
        .map_err(|err| MaintainError::Naming(format!("invalid index `{part}` in `{segment}`: {err}")))
}
