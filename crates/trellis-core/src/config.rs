//! Settings loading from `.trellis.toml`.
//!
//! The file is optional; every field has a default. Values are layered:
//! file first, then CLI flags, then the options sent with `initialize`.
//!
//! ```toml
//! [build_tool]
//! executable = "/usr/local/bin/bazelisk"
//! test_flags = ["--test_output=errors"]
//! cache_ttl_secs = 120
//!
//! [scanner]
//! exclude_globs = ["third_party/**"]
//!
//! [languages.go]
//! import_prefixes = ["github.com/acme/monorepo"]
//!
//! [languages.java]
//! enabled = false
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings file name, looked up at the workspace root.
pub const SETTINGS_FILE: &str = ".trellis.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub build_tool: BuildToolSettings,
    pub scanner: ScannerSettings,
    pub rules: RuleSettings,
    pub languages: BTreeMap<String, LanguageSettings>,
    pub server: ServerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            build_tool: BuildToolSettings::default(),
            scanner: ScannerSettings::default(),
            rules: RuleSettings::default(),
            languages: default_languages(),
            server: ServerSettings::default(),
        }
    }
}

/// How the external build tool is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildToolSettings {
    pub executable: String,
    pub query_flags: Vec<String>,
    pub build_flags: Vec<String>,
    pub test_flags: Vec<String>,
    pub run_flags: Vec<String>,
    pub cache_ttl_secs: u64,
    /// How long a cancelled invocation may take to exit before it is killed.
    pub cancel_grace_ms: u64,
}

impl Default for BuildToolSettings {
    fn default() -> Self {
        BuildToolSettings {
            executable: "bazel".to_string(),
            query_flags: Vec::new(),
            build_flags: Vec::new(),
            test_flags: Vec::new(),
            run_flags: Vec::new(),
            cache_ttl_secs: 300,
            cancel_grace_ms: 3000,
        }
    }
}

impl BuildToolSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Workspace discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    pub build_file_names: Vec<String>,
    /// Directory-name prefixes that are never descended into.
    pub exclude_prefixes: Vec<String>,
    /// Additional glob patterns (relative to the root) to skip.
    pub exclude_globs: Vec<String>,
    /// Parser threads; 0 uses one per core.
    pub workers: usize,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        ScannerSettings {
            build_file_names: vec!["BUILD".to_string(), "BUILD.bazel".to_string()],
            exclude_prefixes: vec!["bazel-".to_string(), ".bazel".to_string()],
            exclude_globs: Vec::new(),
            workers: 0,
        }
    }
}

/// Which rule calls become targets and which attributes carry edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSettings {
    pub kinds: Vec<String>,
    pub source_attributes: Vec<String>,
    pub dependency_attributes: Vec<String>,
}

impl Default for RuleSettings {
    fn default() -> Self {
        let mut kinds: Vec<String> = ["cc", "go", "py", "java", "ts", "sh"]
            .iter()
            .flat_map(|lang| {
                ["library", "binary", "test"]
                    .iter()
                    .map(move |suffix| format!("{lang}_{suffix}"))
            })
            .collect();
        kinds.push("proto_library".to_string());
        kinds.push("filegroup".to_string());

        RuleSettings {
            kinds,
            source_attributes: vec!["srcs".to_string(), "hdrs".to_string(), "data".to_string()],
            dependency_attributes: vec![
                "deps".to_string(),
                "runtime_deps".to_string(),
                "exports".to_string(),
                "embed".to_string(),
            ],
        }
    }
}

impl RuleSettings {
    pub fn is_known_kind(&self, kind: &str) -> bool {
        self.kinds.iter().any(|k| k == kind)
    }

    pub fn is_source_attribute(&self, name: &str) -> bool {
        self.source_attributes.iter().any(|a| a == name)
    }

    pub fn is_dependency_attribute(&self, name: &str) -> bool {
        self.dependency_attributes.iter().any(|a| a == name)
    }
}

/// One language engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageSettings {
    pub enabled: bool,
    /// Engine executable; the adapter's default is used when unset.
    pub engine_path: Option<String>,
    pub args: Vec<String>,
    /// Import namespaces that map into the workspace.
    pub import_prefixes: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for LanguageSettings {
    fn default() -> Self {
        LanguageSettings {
            enabled: true,
            engine_path: None,
            args: Vec::new(),
            import_prefixes: Vec::new(),
            request_timeout_secs: 10,
        }
    }
}

impl LanguageSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_languages() -> BTreeMap<String, LanguageSettings> {
    ["go", "python", "typescript", "java"]
        .iter()
        .map(|id| (id.to_string(), LanguageSettings::default()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings { host: "127.0.0.1".to_string(), port: 7878 }
    }
}

impl Settings {
    /// Load `.trellis.toml` from `root`, or defaults when it does not exist.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Settings::default());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        Settings::from_toml(&text).map_err(|message| ConfigError::Parse { path, message })
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        let mut settings: Settings = toml::from_str(text).map_err(|e| e.to_string())?;
        // A `[languages.go]` table replaces the map; keep the other defaults.
        for (id, defaults) in default_languages() {
            settings.languages.entry(id).or_insert(defaults);
        }
        Ok(settings)
    }

    /// Deep-merge a JSON object (e.g. `initialize` options) over these settings.
    pub fn apply_overrides(&mut self, overrides: &serde_json::Value) -> Result<(), ConfigError> {
        if overrides.is_null() {
            return Ok(());
        }
        let mut current =
            serde_json::to_value(&*self).map_err(|e| ConfigError::Override(e.to_string()))?;
        merge_json(&mut current, overrides);
        *self = serde_json::from_value(current).map_err(|e| ConfigError::Override(e.to_string()))?;
        Ok(())
    }

    /// Settings for a language id; `None` if unknown.
    pub fn language(&self, id: &str) -> Option<&LanguageSettings> {
        self.languages.get(id)
    }
}

fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.build_tool.executable, "bazel");
        assert_eq!(settings.build_tool.cache_ttl(), Duration::from_secs(300));
        assert!(settings.rules.is_known_kind("go_binary"));
        assert!(settings.rules.is_known_kind("cc_test"));
        assert!(!settings.rules.is_known_kind("genrule"));
        assert_eq!(settings.languages.len(), 4);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
[build_tool]
executable = "bazelisk"

[languages.java]
enabled = false
"#,
        )
        .unwrap();

        assert_eq!(settings.build_tool.executable, "bazelisk");
        assert_eq!(settings.build_tool.cancel_grace_ms, 3000);
        assert!(!settings.language("java").unwrap().enabled);
        assert!(settings.language("go").unwrap().enabled);
        assert_eq!(settings.scanner.build_file_names, vec!["BUILD", "BUILD.bazel"]);
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join(SETTINGS_FILE), "[build_tool\n").unwrap();
        let err = Settings::load(temp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp = tempfile::TempDir::new().unwrap();
        assert_eq!(Settings::load(temp.path()).unwrap(), Settings::default());
    }

    #[test]
    fn test_overrides_merge_deeply() {
        let mut settings = Settings::default();
        settings
            .apply_overrides(&json!({
                "build_tool": { "cache_ttl_secs": 5 },
                "languages": { "go": { "engine_path": "/opt/gopls" } }
            }))
            .unwrap();

        assert_eq!(settings.build_tool.cache_ttl_secs, 5);
        assert_eq!(settings.build_tool.executable, "bazel");
        assert_eq!(settings.language("go").unwrap().engine_path.as_deref(), Some("/opt/gopls"));
        assert!(settings.language("python").is_some());
    }
}
