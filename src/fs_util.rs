use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::PipelineError;

/// Extracts every entry of `zip_path` below `target_dir`.
///
/// Unreadable archives map to [`PipelineError::CorruptArchive`]; entries whose
/// names would land outside `target_dir` abort the extraction.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<usize, PipelineError> {
    let file = fs::File::open(zip_path).map_err(|err| PipelineError::io("open", zip_path, err))?;
    let corrupt = |err: ZipError| PipelineError::CorruptArchive {
        path: zip_path.to_path_buf(),
        reason: err.to_string(),
    };
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(corrupt)?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(corrupt)?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => return Err(PipelineError::UnsafeArchiveEntry(entry.name().to_string())),
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| PipelineError::io("create", &entry_path, err))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| PipelineError::io("create", parent, err))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| PipelineError::io("create", &entry_path, err))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| PipelineError::CorruptArchive {
            path: zip_path.to_path_buf(),
            reason: format!("{}: {err}", entry_path.display()),
        })?;
        written += 1;
    }
    Ok(written)
}

/// Copies `src` and everything below it into `dst`, merging with existing content.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), PipelineError> {
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| PipelineError::Conversion(err.to_string()))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|err| PipelineError::io("create", &target, err))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)
                .map_err(|err| PipelineError::io("copy", entry.path(), err))?;
        }
    }
    Ok(())
}

/// Case-insensitive extension match, `ext` given without the dot.
pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Files directly inside `dir` carrying `ext`.
pub fn count_files_with_extension(dir: &Path, ext: &str) -> Result<usize, PipelineError> {
    let entries = fs::read_dir(dir).map_err(|err| PipelineError::io("read", dir, err))?;
    let mut count = 0;
    for entry in entries {
        let entry = entry.map_err(|err| PipelineError::io("read", dir, err))?;
        let path = entry.path();
        if path.is_file() && has_extension(&path, ext) {
            count += 1;
        }
    }
    Ok(count)
}

/// Names of the entries directly inside `dir`.
pub fn list_names(dir: &Path) -> Result<BTreeSet<String>, PipelineError> {
    let entries = fs::read_dir(dir).map_err(|err| PipelineError::io("read", dir, err))?;
    entries
        .map(|entry| {
            entry
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .map_err(|err| PipelineError::io("read", dir, err))
        })
        .collect()
}

/// Every directory under `root` (inclusive) holding at least one file with `ext`.
pub fn dirs_with_extension(root: &Path, ext: &str) -> Result<Vec<PathBuf>, PipelineError> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_dir() && count_files_with_extension(entry.path(), ext)? > 0 {
            found.push(entry.path().to_path_buf());
        }
    }
    Ok(found)
}

/// Directory removed on drop, whatever happened while it was in use.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Creates `path` fresh, clearing anything a previous run left behind.
    pub fn create(path: PathBuf) -> Result<Self, PipelineError> {
        if path.exists() {
            fs::remove_dir_all(&path).map_err(|err| PipelineError::io("remove", &path, err))?;
        }
        fs::create_dir_all(&path).map_err(|err| PipelineError::io("create", &path, err))?;
        Ok(ScratchDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(scratch = %self.path.display(), error = %err, "failed to remove scratch directory");
            }
        }
    }
}
