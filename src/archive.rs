//! Clinical metadata encoded in archive file names.
//!
//! Archives are named `<category>_<stage>_<minAge>_<maxAge>.zip`, e.g.
//! `F_MCI_60_79.zip`. Ages are opaque tokens, no numeric validation is done.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArchiveLabel {
    pub category: String,
    pub stage: String,
    pub min_age: String,
    pub max_age: String,
}

impl ArchiveLabel {
    /// Parses the label from an archive path, ignoring its directory and extension.
    pub fn from_archive_path(path: &Path) -> Result<Self, PipelineError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        stem.parse()
    }

    /// Age-range path segment, `minAge_maxAge`.
    pub fn age_range(&self) -> String {
        format!("{}_{}", self.min_age, self.max_age)
    }

    /// `root/category/stage/minAge_maxAge`
    pub fn bucket_path(&self, root: &Path) -> PathBuf {
        root.join(&self.category)
            .join(&self.stage)
            .join(self.age_range())
    }
}

impl FromStr for ArchiveLabel {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split('_').collect();
        let malformed = || PipelineError::MalformedArchiveName {
            name: value.to_string(),
        };

        let [category, stage, min_age, max_age] = parts.as_slice() else {
            return Err(malformed());
        };
        if parts.iter().any(|part| part.is_empty()) {
            return Err(malformed());
        }

        Ok(ArchiveLabel {
            category: category.to_string(),
            stage: stage.to_string(),
            min_age: min_age.to_string(),
            max_age: max_age.to_string(),
        })
    }
}

impl fmt::Display for ArchiveLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.category, self.stage, self.min_age, self.max_age
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parses_four_tokens() {
        let label: ArchiveLabel = "M_AD_50_74".parse().unwrap();
        assert_eq!(label.category, "M");
        assert_eq!(label.stage, "AD");
        assert_eq!(label.age_range(), "50_74");
        assert_eq!(label.to_string(), "M_AD_50_74");
    }

    #[test]
    fn rejects_wrong_token_count() {
        assert_matches!(
            "F_MCI_60".parse::<ArchiveLabel>(),
            Err(PipelineError::MalformedArchiveName { .. })
        );
        assert_matches!(
            "F_MCI_60_79_extra".parse::<ArchiveLabel>(),
            Err(PipelineError::MalformedArchiveName { .. })
        );
    }

    #[test]
    fn rejects_empty_token() {
        assert_matches!(
            "F__60_79".parse::<ArchiveLabel>(),
            Err(PipelineError::MalformedArchiveName { .. })
        );
    }

    #[test]
    fn bucket_from_archive_path() {
        let label = ArchiveLabel::from_archive_path(Path::new("/in/F_MCI_60_79.zip")).unwrap();
        assert_eq!(
            label.bucket_path(Path::new("/root")),
            PathBuf::from("/root/F/MCI/60_79")
        );
    }
}
