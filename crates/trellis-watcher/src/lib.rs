//! Incremental graph maintenance: open documents, on-disk changes and
//! change notifications

pub mod documents;
pub mod service;
pub mod watcher;


pub use documents::{Document, DocumentStore};
pub use service::{ChangeHook, ChangeScope, ScanSummary, WorkspaceEvent, WorkspaceService};
pub use watcher::{FileWatcher, WatchEvent};
