//! Target labels: `[@repo]//package:name`

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LabelError;

/// A fully qualified target label.
///
/// Relative forms (`:name`, bare `name`) only exist in source text; once
/// parsed against a package every label carries its package explicitly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    /// External repository without the leading `@`. `None` for the main repo.
    /// A canonical `@@repo` keeps one `@` here.
    repo: Option<String>,
    package: String,
    name: String,
}

impl Label {
    /// Build a main-repository label from already validated parts.
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Result<Self, LabelError> {
        let package = package.into();
        let name = name.into();
        validate_package(&package)?;
        validate_name(&name)?;
        Ok(Label { repo: None, package, name })
    }

    /// Parse an absolute label (`//pkg:name`, `//pkg`, `@repo//pkg:name`, `@repo`).
    pub fn parse(raw: &str) -> Result<Self, LabelError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(LabelError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(LabelError::Whitespace(raw.to_string()));
        }

        let (repo, rest) = if let Some(stripped) = raw.strip_prefix('@') {
            match stripped.find("//") {
                Some(idx) => (Some(&stripped[..idx]), &stripped[idx..]),
                None => {
                    // `@repo` alone is shorthand for `@repo//:repo`.
                    let repo = stripped;
                    validate_repo(repo)?;
                    let name = repo.trim_start_matches('@').to_string();
                    validate_name(&name)?;
                    return Ok(Label { repo: Some(repo.to_string()), package: String::new(), name });
                }
            }
        } else {
            (None, raw)
        };

        if let Some(repo) = repo {
            validate_repo(repo)?;
        }

        let Some(body) = rest.strip_prefix("//") else {
            return Err(LabelError::Relative(raw.to_string()));
        };

        let (package, name) = match body.split_once(':') {
            Some((package, name)) => (package.to_string(), name.to_string()),
            None => {
                // `//pkg` means `//pkg:<last segment>`.
                let last = body.rsplit('/').next().unwrap_or_default();
                (body.to_string(), last.to_string())
            }
        };

        validate_package(&package)?;
        validate_name(&name)?;
        Ok(Label { repo: repo.map(str::to_string), package, name })
    }

    /// Parse a label as it appears inside `package`'s configuration file.
    /// `:name` and bare `name` resolve against `package`.
    pub fn parse_relative(raw: &str, package: &str) -> Result<Self, LabelError> {
        let raw = raw.trim();
        if raw.starts_with("//") || raw.starts_with('@') {
            return Label::parse(raw);
        }
        let name = match raw.strip_prefix(':') {
            Some(name) => name,
            None if raw.contains(':') => return Err(LabelError::InvalidName(raw.to_string())),
            None => raw,
        };
        if name.chars().any(char::is_whitespace) {
            return Err(LabelError::Whitespace(raw.to_string()));
        }
        validate_name(name)?;
        validate_package(package)?;
        Ok(Label { repo: None, package: package.to_string(), name: name.to_string() })
    }

    /// True when `raw` is written in a label form (absolute, repo-qualified or
    /// `:name`) and parses. Bare names are not label-shaped on their own.
    pub fn is_label_shaped(raw: &str) -> bool {
        let looks_like = raw.starts_with("//") || raw.starts_with('@') || raw.starts_with(':');
        looks_like && Label::parse_relative(raw, "").is_ok()
    }

    pub fn repo(&self) -> Option<&str> {
        self.repo.as_deref()
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for labels in the workspace's own repository.
    pub fn is_main_repo(&self) -> bool {
        self.repo.as_deref().is_none_or(str::is_empty)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(repo) = &self.repo {
            write!(f, "@{repo}")?;
        }
        write!(f, "//{}:{}", self.package, self.name)
    }
}

impl std::str::FromStr for Label {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::parse(s)
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Label::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn validate_repo(repo: &str) -> Result<(), LabelError> {
    let bare = repo.strip_prefix('@').unwrap_or(repo);
    let valid = !bare.is_empty()
        && bare.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '~' | '+'));
    if valid {
        Ok(())
    } else {
        Err(LabelError::InvalidRepository(repo.to_string()))
    }
}

fn validate_package(package: &str) -> Result<(), LabelError> {
    if package.contains(':')
        || package.contains("//")
        || package.starts_with('/')
        || package.ends_with('/')
    {
        return Err(LabelError::InvalidPackage(package.to_string()));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), LabelError> {
    if name.is_empty() || name.contains(':') || name.ends_with('/') || name.starts_with('/') {
        return Err(LabelError::InvalidName(name.to_string()));
    }
    Ok(())
}
