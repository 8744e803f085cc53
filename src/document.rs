//! Document identities and source tree discovery.

use crate::error::PagewrightError;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt,
    path::{Component, Path, PathBuf},
};
use walkdir::{DirEntry, WalkDir};

/// Identity of a template document: its path relative to the source root, always using `/`
/// separators and never starting with one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl AsRef<str>) -> Self {
        let normalized = id.as_ref().replace('\\', "/");
        DocumentId(normalized.trim_start_matches('/').to_string())
    }

    /// Build an identity from a path that is already relative to the source root.
    pub fn from_relative_path<P: AsRef<Path>>(path: P) -> Self {
        DocumentId::new(os_path_to_string(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identity as a relative filesystem path.
    pub fn to_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Private documents (`_layout.html`) are layouts and partials. They take part in the
    /// dependency graph but are never written to the destination tree.
    pub fn is_private(&self) -> bool {
        self.file_name().starts_with('_')
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        DocumentId::new(id)
    }
}

pub fn os_path_to_string<P: AsRef<Path>>(os_path_ref: P) -> String {
    os_path_ref
        .as_ref()
        .components()
        .filter_map(|c| match c {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
            _ => Some(c.as_os_str().to_string_lossy()),
        })
        .collect::<Vec<Cow<'_, str>>>()
        .join("/")
}

/// True when the path's extension is one of the configured document extensions.
pub fn is_document<P: AsRef<Path>>(path: P, extensions: &[String]) -> bool {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Everything a walk over the source root discovered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeScan {
    /// Template documents, sorted by identity.
    pub documents: Vec<DocumentId>,
    /// Non-document files relative to the source root, sorted.
    pub files: Vec<PathBuf>,
}

/// Walk `root` (following symlinks) and split its files into documents and plain files.
///
/// Hidden entries are skipped, as is any directory listed in `skip` (typically the destination
/// tree when it is nested inside the source tree).
pub fn scan_tree(
    root: &Path,
    extensions: &[String],
    skip: &[PathBuf],
) -> Result<TreeScan, PagewrightError> {
    fn is_hidden(entry: &DirEntry) -> bool {
        entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
    }

    let mut scan = TreeScan::default();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| {
            e.path() == root || (!is_hidden(e) && !skip.iter().any(|s| e.path().starts_with(s)))
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry under {:?}: {}", root, e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root)?.to_path_buf();
        if is_document(&relative, extensions) {
            scan.documents.push(DocumentId::from_relative_path(&relative));
        } else {
            scan.files.push(relative);
        }
    }
    scan.documents.sort();
    scan.files.sort();
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_log::test;

    #[test]
    fn test_document_id_normalization() {
        assert_eq!(DocumentId::new("/a/b.html").as_str(), "a/b.html");
        assert_eq!(DocumentId::new("a\\b.html").as_str(), "a/b.html");
        assert_eq!(
            DocumentId::from_relative_path(Path::new("./nested/page.html")).as_str(),
            "nested/page.html"
        );
        assert_eq!(DocumentId::new("nested/page.html").file_name(), "page.html");
        assert_eq!(
            DocumentId::new("nested/page.html").to_path(),
            PathBuf::from("nested").join("page.html")
        );
    }

    #[test]
    fn test_private_documents() {
        assert!(DocumentId::new("layouts/_base.html").is_private());
        assert!(!DocumentId::new("_layouts/base.html").is_private());
    }

    #[test]
    fn test_scan_tree_splits_documents_and_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("js")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("out")).unwrap();
        std::fs::write(root.join("index.html"), "").unwrap();
        std::fs::write(root.join("_base.HTML"), "").unwrap();
        std::fs::write(root.join("js/app.js"), "").unwrap();
        std::fs::write(root.join(".git/config"), "").unwrap();
        std::fs::write(root.join("out/index.html"), "").unwrap();

        let scan = scan_tree(root, &["html".to_string()], &[root.join("out")]).unwrap();
        assert_eq!(
            scan.documents,
            vec![DocumentId::new("_base.HTML"), DocumentId::new("index.html")]
        );
        assert_eq!(scan.files, vec![PathBuf::from("js").join("app.js")]);
    }
}
