//! Python: pylsp, dotted module imports

use std::path::PathBuf;

use trellis_core::LanguageSettings;

use crate::adapter::ImportRules;

/// Maps `import a.b.c` and `from a.b import c` to module files. With
/// prefixes configured, only modules under them are considered.
pub struct PythonImports {
    prefixes: Vec<String>,
}

impl PythonImports {
    pub fn new(settings: &LanguageSettings) -> Self {
        PythonImports { prefixes: settings.import_prefixes.clone() }
    }

    fn in_workspace(&self, module: &str) -> bool {
        self.prefixes.is_empty()
            || self.prefixes.iter().any(|p| module == p || module.starts_with(&format!("{}.", p.trim_end_matches('.'))))
    }
}

fn module_candidates(module: &str) -> [PathBuf; 2] {
    let path = module.replace('.', "/");
    [PathBuf::from(format!("{path}.py")), PathBuf::from(path).join("__init__.py")]
}

impl ImportRules for PythonImports {
    fn workspace_import(&self, line: &str, _character: u32) -> Vec<PathBuf> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let (module, names): (&str, Vec<&str>) = match words.as_slice() {
            ["from", module, "import", rest @ ..] => (
                *module,
                rest.iter()
                    .flat_map(|w| w.split(','))
                    .map(|w| w.trim_matches(|c| c == '(' || c == ')'))
                    .filter(|w| !w.is_empty() && *w != "as")
                    .take(1)
                    .collect(),
            ),
            ["import", module, ..] => (module.trim_end_matches(','), Vec::new()),
            _ => return Vec::new(),
        };
        // Relative imports are the engine's business.
        if module.starts_with('.') || !self.in_workspace(module) {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for name in names {
            candidates.extend(module_candidates(&format!("{module}.{name}")));
        }
        candidates.extend(module_candidates(module));
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_import_prefers_submodule() {
        let imports = PythonImports::new(&LanguageSettings::default());
        let candidates = imports.workspace_import("from lib.text import slugify", 0);
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("lib/text/slugify.py"),
                PathBuf::from("lib/text/slugify/__init__.py"),
                PathBuf::from("lib/text.py"),
                PathBuf::from("lib/text/__init__.py"),
            ]
        );
    }

    #[test]
    fn test_prefix_filter_and_relative_imports() {
        let settings = LanguageSettings { import_prefixes: vec!["mono".into()], ..Default::default() };
        let imports = PythonImports::new(&settings);
        assert_eq!(imports.workspace_import("import mono.base", 0)[0], PathBuf::from("mono/base.py"));
        assert!(imports.workspace_import("import requests", 0).is_empty());
        assert!(imports.workspace_import("from . import sibling", 0).is_empty());
    }
}
