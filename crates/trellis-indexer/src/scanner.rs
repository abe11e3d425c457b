//! Workspace scanner: discovers build files and parses them in parallel
//!
//! Discovery uses the `ignore` walker with its gitignore handling turned
//! off (build tools do not honor `.gitignore`); output directories are
//! skipped by name prefix, `.bazelignore` entries and `exclude_globs`.
//! Parsing runs on a rayon pool with no ordering between files; results
//! are applied to the graph in path order so duplicate resolution is
//! deterministic.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rayon::prelude::*;
use thiserror::Error;
use trellis_core::{BuildGraph, CancelToken, Diagnostic, FileContribution, Settings, is_build_file};

use crate::extractor::TargetExtractor;

/// Directory-paths file honored at the workspace root.
pub const IGNORE_FILE: &str = ".bazelignore";

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan cancelled")]
    Cancelled,
    #[error("workspace root does not exist: {0}")]
    MissingRoot(PathBuf),
    #[error("invalid exclude pattern {pattern:?}: {message}")]
    Pattern { pattern: String, message: String },
    #[error("failed to start parser pool: {0}")]
    Pool(String),
}

/// Outcome of a full scan.
#[derive(Debug)]
pub struct ScanReport {
    pub graph: BuildGraph,
    /// Every file-scoped diagnostic, keyed by the file it concerns.
    pub diagnostics: Vec<(PathBuf, Diagnostic)>,
    pub files_scanned: usize,
    pub elapsed: Duration,
}

pub struct WorkspaceScanner {
    root: PathBuf,
    settings: Settings,
    excluded: GlobSet,
    ignored_dirs: Vec<PathBuf>,
}

impl WorkspaceScanner {
    pub fn new(root: impl Into<PathBuf>, settings: Settings) -> Result<Self, ScanError> {
        let root = root.into();
        let mut builder = GlobSetBuilder::new();
        for pattern in &settings.scanner.exclude_globs {
            let glob = Glob::new(pattern).map_err(|e| ScanError::Pattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            builder.add(glob);
        }
        let excluded = builder.build().map_err(|e| ScanError::Pattern {
            pattern: settings.scanner.exclude_globs.join(", "),
            message: e.to_string(),
        })?;
        let ignored_dirs = read_ignore_file(&root);
        Ok(WorkspaceScanner { root, settings, excluded, ignored_dirs })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn extractor(&self) -> TargetExtractor<'_> {
        TargetExtractor::new(&self.root, &self.settings.rules)
    }

    /// True if `path` lies in a directory the scanner never descends into.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return true;
        };
        if self.ignored_dirs.iter().any(|dir| relative.starts_with(dir)) {
            return true;
        }
        let excluded_name = relative.components().any(|c| {
            c.as_os_str().to_str().is_some_and(|name| {
                name == ".git" || self.settings.scanner.exclude_prefixes.iter().any(|p| name.starts_with(p.as_str()))
            })
        });
        excluded_name || self.excluded.is_match(relative)
    }

    /// True if `path` is a build file the scanner would index.
    pub fn is_build_file(&self, path: &Path) -> bool {
        is_build_file(path, &self.settings.scanner.build_file_names) && !self.is_excluded(path)
    }

    /// Every build file beneath the root, sorted.
    pub fn discover(&self, cancel: &CancelToken) -> Result<Vec<PathBuf>, ScanError> {
        if !self.root.is_dir() {
            return Err(ScanError::MissingRoot(self.root.clone()));
        }

        let root = self.root.clone();
        let prefixes = self.settings.scanner.exclude_prefixes.clone();
        let ignored = self.ignored_dirs.clone();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                if !entry.file_type().is_some_and(|ft| ft.is_dir()) || entry.depth() == 0 {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                if name == ".git" || prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                    return false;
                }
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                !ignored.iter().any(|dir| relative.starts_with(dir))
            });

        let mut files = Vec::new();
        for entry in builder.build() {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("Skipping unreadable path during scan: {}", err);
                    continue;
                }
            };
            let path = entry.path();
            if entry.file_type().is_some_and(|ft| ft.is_file()) && self.is_build_file(path) {
                files.push(path.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Parse one file from disk. Read failures become an `Io` diagnostic.
    pub fn index_file(&self, path: &Path) -> FileContribution {
        let extractor = self.extractor();
        match std::fs::read_to_string(path) {
            Ok(text) => extractor.extract(path, &text),
            Err(err) => {
                tracing::warn!("Failed to read {}: {}", path.display(), err);
                extractor.unreadable(path, &err)
            }
        }
    }

    /// Discover, parse and assemble a fresh graph. Blocking; run it on a
    /// blocking thread from async code.
    pub fn scan(&self, cancel: &CancelToken) -> Result<ScanReport, ScanError> {
        let start = Instant::now();
        let files = self.discover(cancel)?;
        tracing::info!("Discovered {} build files under {}", files.len(), self.root.display());

        let parsed = AtomicUsize::new(0);
        let parse_one = |path: &PathBuf| -> Option<FileContribution> {
            if cancel.is_cancelled() {
                return None;
            }
            let contribution = self.index_file(path);
            parsed.fetch_add(1, Ordering::Relaxed);
            Some(contribution)
        };

        let workers = self.settings.scanner.workers;
        let contributions: Vec<Option<FileContribution>> = if workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| ScanError::Pool(e.to_string()))?;
            pool.install(|| files.par_iter().map(parse_one).collect())
        } else {
            files.par_iter().map(parse_one).collect()
        };

        if cancel.is_cancelled() {
            tracing::info!("Scan cancelled after {} files", parsed.load(Ordering::Relaxed));
            return Err(ScanError::Cancelled);
        }

        let mut graph = BuildGraph::new(&self.root);
        for contribution in contributions.into_iter().flatten() {
            graph.apply_file(contribution);
        }

        let mut diagnostics = Vec::new();
        for path in &files {
            for diagnostic in graph.diagnostics_for(path) {
                diagnostics.push((path.clone(), diagnostic));
            }
        }

        let elapsed = start.elapsed();
        tracing::info!(
            "Scanned {} files: {} targets, {} diagnostics in {:?}",
            files.len(),
            graph.target_count(),
            diagnostics.len(),
            elapsed
        );
        Ok(ScanReport { graph, diagnostics, files_scanned: files.len(), elapsed })
    }
}

fn read_ignore_file(root: &Path) -> Vec<PathBuf> {
    let Ok(text) = std::fs::read_to_string(root.join(IGNORE_FILE)) else {
        return Vec::new();
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| PathBuf::from(line.trim_end_matches('/')))
        .collect()
}
