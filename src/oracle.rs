//! Timestamp based staleness checks.
//!
//! A target is stale relative to its source when it does not exist yet, or when the source was
//! modified strictly after the target. Both rendered documents and pre-compiled intermediates
//! use this to skip work whose output is already newer than its input.

use std::{fs, path::Path, time::SystemTime};

/// Compare two modification times. `None` for the target means the target does not exist.
pub fn is_stale_at(source: SystemTime, target: Option<SystemTime>) -> bool {
    match target {
        Some(target) => source > target,
        None => true,
    }
}

/// Returns true when `target` needs to be regenerated from `source`.
///
/// A source whose metadata cannot be read is reported stale so that the caller attempts the work
/// and surfaces the underlying IO error itself.
pub fn is_stale(source: &Path, target: &Path) -> bool {
    let source_mtime = match fs::metadata(source).and_then(|m| m.modified()) {
        Ok(mtime) => mtime,
        Err(e) => {
            tracing::debug!("Cannot read mtime of {:?} ({}), treating as stale", source, e);
            return true;
        }
    };
    let target_mtime = fs::metadata(target).and_then(|m| m.modified()).ok();
    is_stale_at(source_mtime, target_mtime)
}
