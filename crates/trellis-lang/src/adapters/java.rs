//! Java: jdtls, package imports as source paths

use std::path::PathBuf;

use trellis_core::LanguageSettings;

use crate::adapter::ImportRules;

/// Directories a package path is looked up under, in order.
const SOURCE_ROOTS: &[&str] = &["", "src/main/java", "java", "src"];

/// Maps `import a.b.C;` to `a/b/C.java` under each source root. With
/// prefixes configured, only packages under them are considered.
pub struct JavaImports {
    prefixes: Vec<String>,
}

impl JavaImports {
    pub fn new(settings: &LanguageSettings) -> Self {
        JavaImports { prefixes: settings.import_prefixes.clone() }
    }
}

impl ImportRules for JavaImports {
    fn workspace_import(&self, line: &str, _character: u32) -> Vec<PathBuf> {
        let Some(rest) = line.trim().strip_prefix("import ") else {
            return Vec::new();
        };
        let (is_static, rest) = match rest.trim_start().strip_prefix("static ") {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let name = rest.trim().trim_end_matches(';').trim();
        if name.ends_with(".*") {
            return Vec::new();
        }
        if !self.prefixes.is_empty() && !self.prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            return Vec::new();
        }

        let class = match (is_static, name.rsplit_once('.')) {
            (true, Some((class, _member))) => class,
            _ => name,
        };
        let relative = format!("{}.java", class.replace('.', "/"));
        SOURCE_ROOTS.iter().map(|root| PathBuf::from(root).join(&relative)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_and_static_imports() {
        let imports = JavaImports::new(&LanguageSettings::default());
        let candidates = imports.workspace_import("import com.mono.base.Strings;", 10);
        assert_eq!(candidates[0], PathBuf::from("com/mono/base/Strings.java"));
        assert_eq!(candidates[1], PathBuf::from("src/main/java/com/mono/base/Strings.java"));

        let candidates = imports.workspace_import("import static com.mono.base.Strings.join;", 10);
        assert_eq!(candidates[0], PathBuf::from("com/mono/base/Strings.java"));
        assert!(imports.workspace_import("import java.util.*;", 10).is_empty());
    }
}
