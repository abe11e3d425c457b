//! Fixtures for graph tests that do not go through the parser

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;

use crate::label::Label;
use crate::model::*;

/// A target declared in `/ws/<package>/BUILD` with sources and deps as written.
pub fn target(package: &str, name: &str, kind: &str, srcs: &[&str], deps: &[&str]) -> Target {
    let dir = if package.is_empty() {
        PathBuf::from("/ws")
    } else {
        PathBuf::from("/ws").join(package)
    };
    Target {
        label: Label::new(package, name).unwrap(),
        kind: kind.to_string(),
        package: package.to_string(),
        attributes: BTreeMap::new(),
        sources: srcs.iter().map(|s| s.to_string()).collect(),
        source_paths: srcs.iter().map(|s| dir.join(s)).collect(),
        source_globs: Vec::new(),
        dependencies: deps.iter().map(|d| Label::parse_relative(d, package).unwrap()).collect(),
        location: Location {
            path: dir.join("BUILD"),
            range: Range::new(Position::new(0, 0), Position::new(3, 1)),
        },
        declaration_index: 0,
        indexed: true,
    }
}

/// One build file's contribution with `text` standing in for its content.
pub fn contribution(path: &str, package: &str, text: &str, targets: Vec<Target>) -> FileContribution {
    FileContribution {
        file: ConfigFile {
            path: PathBuf::from(path),
            package: package.to_string(),
            text: text.to_string(),
            content_hash: ConfigFile::content_hash(text),
            parsed_at: Utc::now(),
            labels: Vec::new(),
            statements: Vec::new(),
            diagnostics: Vec::new(),
        },
        targets,
    }
}
