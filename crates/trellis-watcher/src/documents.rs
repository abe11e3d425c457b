//! Editor-owned document text

use std::path::{Path, PathBuf};

use dashmap::DashMap;

/// The editor's view of one file. `version` increases with every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: PathBuf,
    pub text: String,
    pub version: i32,
}

/// Open documents keyed by absolute path. While a document is open its text
/// takes precedence over what is on disk.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: DashMap<PathBuf, Document>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, path: &Path, text: String) -> Document {
        let document = Document { path: path.to_path_buf(), text, version: 1 };
        self.documents.insert(path.to_path_buf(), document.clone());
        document
    }

    /// Replace the text of a document, opening it if the editor skipped
    /// `didOpen`.
    pub fn change(&self, path: &Path, text: String) -> Document {
        let mut entry = self.documents.entry(path.to_path_buf()).or_insert_with(|| Document {
            path: path.to_path_buf(),
            text: String::new(),
            version: 0,
        });
        entry.text = text;
        entry.version += 1;
        entry.clone()
    }

    pub fn close(&self, path: &Path) -> Option<Document> {
        self.documents.remove(path).map(|(_, document)| document)
    }

    pub fn get(&self, path: &Path) -> Option<Document> {
        self.documents.get(path).map(|d| d.clone())
    }

    pub fn text(&self, path: &Path) -> Option<String> {
        self.documents.get(path).map(|d| d.text.clone())
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.documents.contains_key(path)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.documents.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_increase() {
        let store = DocumentStore::new();
        let path = Path::new("/ws/a/BUILD");
        assert_eq!(store.open(path, "a".into()).version, 1);
        assert_eq!(store.change(path, "b".into()).version, 2);
        assert_eq!(store.text(path).as_deref(), Some("b"));
        assert!(store.close(path).is_some());
        assert!(!store.is_open(path));
    }

    #[test]
    fn test_change_without_open() {
        let store = DocumentStore::new();
        let document = store.change(Path::new("/ws/x.go"), "package x".into());
        assert_eq!(document.version, 1);
        assert_eq!(store.len(), 1);
    }
}
