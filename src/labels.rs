//! Label reconstruction from the canonical volumetric tree, plus the table
//! exports and one-hot encoding consumed by training.
//!
//! Labels are a pure projection of `category/stage/ageRange/<file>` paths;
//! nothing here writes to either canonical tree.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::LabelVocabulary;
use crate::error::PipelineError;
use crate::fs_util;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelRecord {
    pub file_path: PathBuf,
    pub category: String,
    pub stage: String,
    /// Rendered as `minAge-maxAge`.
    pub age_range: String,
}

impl LabelRecord {
    pub fn value(&self, column: LabelColumn) -> &str {
        match column {
            LabelColumn::Category => &self.category,
            LabelColumn::Stage => &self.stage,
            LabelColumn::AgeRange => &self.age_range,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelColumn {
    Category,
    #[default]
    Stage,
    AgeRange,
}

impl FromStr for LabelColumn {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "category" | "genre" => Ok(LabelColumn::Category),
            "stage" => Ok(LabelColumn::Stage),
            "age_range" | "age" => Ok(LabelColumn::AgeRange),
            other => Err(format!("unknown label column: {other}")),
        }
    }
}

/// Walks `root/category/stage/ageRange` and emits one record per file with
/// `volume_extension` directly inside a bucket.
pub fn collect_label_records(
    root: &Path,
    volume_extension: &str,
) -> Result<Vec<LabelRecord>, PipelineError> {
    let mut records = Vec::new();
    for category in subdirectories(root)? {
        for stage in subdirectories(&root.join(&category))? {
            for age_range in subdirectories(&root.join(&category).join(&stage))? {
                let bucket = root.join(&category).join(&stage).join(&age_range);
                for name in fs_util::list_names(&bucket)? {
                    let file_path = bucket.join(&name);
                    if !file_path.is_file() || !fs_util::has_extension(&file_path, volume_extension) {
                        continue;
                    }
                    records.push(LabelRecord {
                        file_path,
                        category: category.clone(),
                        stage: stage.clone(),
                        age_range: age_range.replace('_', "-"),
                    });
                }
            }
        }
    }
    debug!(root = %root.display(), records = records.len(), "label records collected");
    Ok(records)
}

/// Every file with `volume_extension` anywhere under `root`, skipping hidden
/// staging directories.
pub fn list_volume_files(root: &Path, volume_extension: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && is_hidden(e.file_name())));
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_file() && fs_util::has_extension(entry.path(), volume_extension) {
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(files)
}

fn subdirectories(dir: &Path) -> Result<Vec<String>, PipelineError> {
    Ok(fs_util::list_names(dir)?
        .into_iter()
        .filter(|name| !name.starts_with('.') && dir.join(name).is_dir())
        .collect())
}

fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

pub fn write_records_csv(records: &[LabelRecord], path: &Path) -> Result<(), PipelineError> {
    let file = File::create(path).map_err(|err| PipelineError::io("create", path, err))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush().map_err(|err| PipelineError::io("write", path, err))
}

pub fn write_json<T: Serialize>(value: &T, path: &Path, pretty: bool) -> Result<(), PipelineError> {
    let content = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    fs::write(path, content).map_err(|err| PipelineError::io("write", path, err))
}

/// One-hot encoded view of one label column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OneHotLabels {
    pub column: LabelColumn,
    pub classes: Vec<String>,
    pub files: Vec<PathBuf>,
    pub rows: Vec<Vec<u8>>,
}

/// Encodes `column` of every record. Classes come from the vocabulary when it
/// lists any for that column, otherwise from the sorted distinct values.
/// Values outside the vocabulary encode as an all-zero row.
pub fn encode_one_hot(
    records: &[LabelRecord],
    column: LabelColumn,
    vocabulary: &LabelVocabulary,
) -> OneHotLabels {
    let configured = match column {
        LabelColumn::Category => &vocabulary.categories,
        LabelColumn::Stage => &vocabulary.stages,
        LabelColumn::AgeRange => &vocabulary.age_ranges,
    };
    let classes: Vec<String> = if configured.is_empty() {
        records
            .iter()
            .map(|r| r.value(column).to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        configured
            .iter()
            .map(|class| normalize_class(column, class))
            .collect()
    };

    let rows = records
        .iter()
        .map(|record| {
            let value = record.value(column);
            let mut row = vec![0u8; classes.len()];
            match classes.iter().position(|class| class == value) {
                Some(index) => row[index] = 1,
                None => {
                    let err = PipelineError::UnknownLabel {
                        value: value.to_string(),
                    };
                    warn!(file = %record.file_path.display(), error = %err, "label not encoded");
                }
            }
            row
        })
        .collect();

    OneHotLabels {
        column,
        classes,
        files: records.iter().map(|r| r.file_path.clone()).collect(),
        rows,
    }
}

/// Vocabulary age ranges may be written with either separator.
fn normalize_class(column: LabelColumn, class: &str) -> String {
    match column {
        LabelColumn::AgeRange => class.replace('_', "-"),
        _ => class.to_string(),
    }
}
