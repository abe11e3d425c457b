//! Workspace root and package detection

use std::path::{Component, Path, PathBuf};

/// Files whose presence marks a workspace root.
pub const WORKSPACE_MARKERS: &[&str] = &["MODULE.bazel", "WORKSPACE.bazel", "WORKSPACE"];

/// Walk upward from `start` to the first directory holding a workspace
/// marker. Falls back to `start` itself.
pub fn find_workspace_root(start: &Path) -> PathBuf {
    let mut current = Some(start);
    while let Some(dir) = current {
        if WORKSPACE_MARKERS.iter().any(|marker| dir.join(marker).is_file()) {
            return dir.to_path_buf();
        }
        current = dir.parent();
    }
    start.to_path_buf()
}

/// True if `path`'s file name is one of the configured build file names.
pub fn is_build_file(path: &Path, build_file_names: &[String]) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| build_file_names.iter().any(|b| b == name))
}

/// Package name of a directory: its path relative to `root`, `/`-separated.
/// Returns `None` for directories outside the workspace.
pub fn package_of(root: &Path, dir: &Path) -> Option<String> {
    let relative = dir.strip_prefix(root).ok()?;
    let segments: Vec<&str> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    Some(segments.join("/"))
}

/// Package declared by a build file: the package of its directory.
pub fn package_for_build_file(root: &Path, build_file: &Path) -> Option<String> {
    package_of(root, build_file.parent()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_finds_marker_upward() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("MODULE.bazel"), "").unwrap();
        let nested = temp.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_workspace_root(&nested), temp.path());
    }

    #[test]
    fn test_falls_back_to_start() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("plain");
        fs::create_dir_all(&dir).unwrap();
        // A marker further up (outside the temp dir) is possible on odd
        // hosts, so only assert the lookup stays on the path to `dir`.
        assert!(dir.starts_with(find_workspace_root(&dir)));
    }

    #[test]
    fn test_package_names() {
        let root = Path::new("/ws");
        assert_eq!(package_of(root, Path::new("/ws")), Some(String::new()));
        assert_eq!(package_of(root, Path::new("/ws/app/server")), Some("app/server".to_string()));
        assert_eq!(package_of(root, Path::new("/elsewhere")), None);
        assert_eq!(
            package_for_build_file(root, Path::new("/ws/lib/BUILD.bazel")),
            Some("lib".to_string())
        );
    }

    #[test]
    fn test_build_file_names() {
        let names = vec!["BUILD".to_string(), "BUILD.bazel".to_string()];
        assert!(is_build_file(Path::new("/ws/a/BUILD"), &names));
        assert!(is_build_file(Path::new("/ws/a/BUILD.bazel"), &names));
        assert!(!is_build_file(Path::new("/ws/a/BUILD.txt"), &names));
    }
}
