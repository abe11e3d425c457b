//! Go: gopls, imports under the workspace module path

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::debug;
use trellis_core::LanguageSettings;

use crate::adapter::ImportRules;
use crate::adapters::strip_any_prefix;
use crate::text::string_literal_at;

pub(crate) fn initialization_options() -> Value {
    json!({
        "build.directoryFilters": ["-bazel-bin", "-bazel-out", "-bazel-testlogs"],
    })
}

/// Maps `"<module>/pkg/path"` imports to `pkg/path`.
pub struct GoImports {
    module_paths: Vec<String>,
}

impl GoImports {
    pub fn new(root: &Path, settings: &LanguageSettings) -> Self {
        let mut module_paths = settings.import_prefixes.clone();
        if let Some(module) = module_from_go_mod(root) {
            debug!("Go module path from go.mod: {}", module);
            module_paths.push(module);
        }
        GoImports { module_paths }
    }

    pub fn module_paths(&self) -> &[String] {
        &self.module_paths
    }
}

fn module_from_go_mod(root: &Path) -> Option<String> {
    let text = std::fs::read_to_string(root.join("go.mod")).ok()?;
    text.lines()
        .find_map(|line| line.trim().strip_prefix("module "))
        .map(|module| module.trim().trim_matches('"').to_string())
}

impl ImportRules for GoImports {
    fn workspace_import(&self, line: &str, character: u32) -> Vec<PathBuf> {
        let Some(literal) = string_literal_at(line, character) else {
            return Vec::new();
        };
        match strip_any_prefix(&literal.text, &self.module_paths) {
            Some(relative) => vec![PathBuf::from(relative)],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_module_path_from_go_mod() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("go.mod"), "module example.com/mono\n\ngo 1.22\n").unwrap();
        let imports = GoImports::new(temp.path(), &LanguageSettings::default());
        assert_eq!(imports.module_paths(), ["example.com/mono"]);

        let line = "\t\"example.com/mono/base/strings\"";
        assert_eq!(imports.workspace_import(line, 10), vec![PathBuf::from("base/strings")]);
        assert!(imports.workspace_import("\t\"fmt\"", 3).is_empty());
    }
}
