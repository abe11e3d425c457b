//! Built-in language adapters, selected by language id

pub mod go;
pub mod java;
pub mod python;
pub mod typescript;

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use trellis_core::LanguageSettings;

use crate::adapter::{EngineAdapter, ImportRules, LanguageAdapter};
use crate::supervisor::{EngineCommand, EngineSupervisor};

/// Language id for a source file, from its extension.
pub fn language_for_path(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "go" => Some("go"),
        "py" | "pyi" => Some("python"),
        "ts" | "tsx" | "js" | "jsx" | "mts" | "cts" => Some("typescript"),
        "java" => Some("java"),
        _ => None,
    }
}

/// The adapter for `language_id`, or `None` for an unknown language.
pub fn create_adapter(language_id: &str, root: &Path, settings: &LanguageSettings) -> Option<Arc<dyn LanguageAdapter>> {
    let adapter: Arc<dyn LanguageAdapter> = match language_id {
        "go" => Arc::new(engine_adapter(
            "go",
            root,
            settings,
            ("gopls", &["-mode=stdio"]),
            go::initialization_options(),
            go::GoImports::new(root, settings),
        )),
        "python" => Arc::new(engine_adapter(
            "python",
            root,
            settings,
            ("pylsp", &[]),
            Value::Null,
            python::PythonImports::new(settings),
        )),
        "typescript" => Arc::new(engine_adapter(
            "typescript",
            root,
            settings,
            ("typescript-language-server", &["--stdio"]),
            Value::Null,
            typescript::TypeScriptImports::new(settings),
        )),
        "java" => Arc::new(engine_adapter(
            "java",
            root,
            settings,
            ("jdtls", &[]),
            Value::Null,
            java::JavaImports::new(settings),
        )),
        _ => return None,
    };
    Some(adapter)
}

fn engine_adapter<R: ImportRules>(
    language_id: &'static str,
    root: &Path,
    settings: &LanguageSettings,
    (program, args): (&str, &[&str]),
    initialization_options: Value,
    rules: R,
) -> EngineAdapter<R> {
    let engine = settings.enabled.then(|| {
        EngineSupervisor::new(language_id, EngineCommand::resolve(settings, program, args), root, settings)
            .with_initialization_options(initialization_options)
    });
    EngineAdapter::new(language_id, engine, rules)
}

/// `text` with the first matching prefix removed, if any prefix matches at
/// a path boundary.
pub(crate) fn strip_any_prefix<'a>(text: &'a str, prefixes: &[String]) -> Option<&'a str> {
    prefixes.iter().find_map(|prefix| {
        let rest = text.strip_prefix(prefix.as_str())?;
        if prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/') {
            Some(rest.trim_start_matches('/'))
        } else {
            None
        }
    })
}
