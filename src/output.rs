//! Writing into the destination tree.
//!
//! Every file the pipeline produces is written to a temporary file in the target directory and
//! renamed into place, so a reader of the output tree never observes a half-written file.

use crate::{error::PagewrightError, oracle};
use std::{
    fs,
    io::{ErrorKind, Write},
    path::Path,
};
use tempfile::NamedTempFile;

/// Atomically replace `path` with `contents`, creating parent directories as needed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PagewrightError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.flush()?;
    temp.persist(path)?;
    Ok(())
}

/// Copy `source` to `target` when the target is missing or older (or unconditionally when
/// `force`). Returns whether a copy happened.
pub fn copy_if_stale(source: &Path, target: &Path, force: bool) -> Result<bool, PagewrightError> {
    if !force && !oracle::is_stale(source, target) {
        return Ok(false);
    }
    let contents = fs::read(source)?;
    write_atomic(target, &contents)?;
    tracing::debug!("Copied {:?} -> {:?}", source, target);
    Ok(true)
}

/// Remove a file, treating an already missing file as success.
pub fn remove_if_exists(path: &Path) -> Result<bool, PagewrightError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
