//! Build file parsing, target extraction and workspace scanning

pub mod extractor;
pub mod parser;
pub mod scanner;


pub use extractor::TargetExtractor;
pub use parser::{LineIndex, ParsedFile, parse};
pub use scanner::{ScanError, ScanReport, WorkspaceScanner};
