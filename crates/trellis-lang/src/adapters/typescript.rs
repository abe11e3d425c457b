//! TypeScript/JavaScript: typescript-language-server, scoped workspace
//! specifiers

use std::path::PathBuf;

use trellis_core::LanguageSettings;

use crate::adapter::ImportRules;
use crate::adapters::strip_any_prefix;
use crate::text::string_literal_at;

const DEFAULT_PREFIXES: &[&str] = &["@workspace/", "//"];
const EXTENSIONS: &[&str] = &[".ts", ".tsx", ".js", ".jsx", "/index.ts", "/index.tsx", "/index.js"];

/// Maps `@workspace/pkg/mod` (or another configured scope) and `//pkg/mod`
/// specifiers to files under the root. `./` specifiers stay with the engine.
pub struct TypeScriptImports {
    prefixes: Vec<String>,
}

impl TypeScriptImports {
    pub fn new(settings: &LanguageSettings) -> Self {
        let prefixes = if settings.import_prefixes.is_empty() {
            DEFAULT_PREFIXES.iter().map(|p| p.to_string()).collect()
        } else {
            settings.import_prefixes.clone()
        };
        TypeScriptImports { prefixes }
    }
}

impl ImportRules for TypeScriptImports {
    fn workspace_import(&self, line: &str, character: u32) -> Vec<PathBuf> {
        let Some(literal) = string_literal_at(line, character) else {
            return Vec::new();
        };
        let Some(relative) = strip_any_prefix(&literal.text, &self.prefixes) else {
            return Vec::new();
        };
        let relative = relative.trim_end_matches('/');
        if relative.is_empty() {
            return Vec::new();
        }
        let mut candidates = vec![PathBuf::from(relative)];
        candidates.extend(EXTENSIONS.iter().map(|ext| PathBuf::from(format!("{relative}{ext}"))));
        candidates
    }
}
