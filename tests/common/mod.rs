//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use pagewright::config::{BuildMode, BuildOptions};
use pagewright::shell::CommandTemplate;
use regex::Regex;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A source tree and its destination inside a temporary directory.
#[allow(dead_code)]
pub struct TestSite {
    _dir: TempDir,
    pub source: PathBuf,
    pub dest: PathBuf,
}

#[allow(dead_code)]
impl TestSite {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("site");
        let dest = dir.path().join("public");
        fs::create_dir_all(&source).unwrap();
        TestSite {
            _dir: dir,
            source,
            dest,
        }
    }

    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn output(&self, relative: &str) -> String {
        fs::read_to_string(self.dest.join(relative)).unwrap()
    }

    pub fn output_exists(&self, relative: &str) -> bool {
        self.dest.join(relative).exists()
    }

    /// Options whose external tools are plain unix utilities: scripts and styles pass through
    /// `cat`, so bundle contents are predictable.
    pub fn options(&self, mode: BuildMode) -> BuildOptions {
        let mut options = BuildOptions::new(&self.source, &self.dest).with_mode(mode);
        options.project.commands.script = CommandTemplate::new("cat");
        options.project.commands.style = CommandTemplate::new("cat");
        options.project.commands.less = CommandTemplate::new("cat {input}");
        options.project.commands.coffee = CommandTemplate::new("cat");
        options
    }
}

/// Regular files directly inside `dir` whose name ends with `suffix`.
#[allow(dead_code)]
pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| path.to_string_lossy().ends_with(suffix))
        .collect();
    found.sort();
    found
}

/// Every file under `dir` keyed by relative path, with cache-bust tokens masked in both paths
/// and contents so that two production builds compare equal.
#[allow(dead_code)]
pub fn snapshot(dir: &Path) -> BTreeMap<String, String> {
    let token = Regex::new(r"-[0-9a-f]{10}_min").unwrap();
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = entry.path().strip_prefix(dir).unwrap().to_string_lossy();
            let contents = fs::read_to_string(entry.path()).unwrap();
            (
                token.replace_all(&relative, "-TOKEN").into_owned(),
                token.replace_all(&contents, "-TOKEN").into_owned(),
            )
        })
        .collect()
}
