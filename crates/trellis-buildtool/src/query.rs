//! Decoding of streamed JSON query output
//!
//! With `--output=streamed_jsonproto` the tool prints one JSON-encoded
//! `Target` message per line, discriminated by `type`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use trellis_core::{BuildToolError, Label};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub targets: Vec<QueryTarget>,
}

impl QueryResult {
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.label.as_str())
    }

    /// Packages of every main-repository label in the result.
    pub fn packages(&self) -> Vec<String> {
        let mut packages: Vec<String> = self
            .targets
            .iter()
            .filter_map(|t| Label::parse(&t.label).ok())
            .filter(|l| l.is_main_repo())
            .map(|l| l.package().to_string())
            .collect();
        packages.sort();
        packages.dedup();
        packages
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTarget {
    pub label: String,
    /// Rule class for rules, otherwise the target type (`source file`, ...).
    pub kind: String,
    pub location: Option<String>,
    pub attributes: BTreeMap<String, QueryAttribute>,
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryAttribute {
    String(String),
    Int(i64),
    Bool(bool),
    StringList(Vec<String>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTarget {
    #[serde(rename = "type")]
    discriminator: String,
    rule: Option<WireRule>,
    source_file: Option<WireNamed>,
    generated_file: Option<WireNamed>,
    package_group: Option<WireNamed>,
    environment_group: Option<WireNamed>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRule {
    name: String,
    rule_class: String,
    location: Option<String>,
    #[serde(default)]
    attribute: Vec<WireAttribute>,
    #[serde(default)]
    rule_input: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNamed {
    name: String,
    location: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAttribute {
    name: String,
    string_value: Option<String>,
    int_value: Option<serde_json::Value>,
    boolean_value: Option<bool>,
    string_list_value: Option<Vec<String>>,
}

impl WireAttribute {
    fn value(self) -> Option<QueryAttribute> {
        if let Some(list) = self.string_list_value {
            return Some(QueryAttribute::StringList(list));
        }
        if let Some(text) = self.string_value {
            return Some(QueryAttribute::String(text));
        }
        if let Some(flag) = self.boolean_value {
            return Some(QueryAttribute::Bool(flag));
        }
        // Proto JSON prints 64-bit integers as strings.
        let int = self.int_value?;
        int.as_i64().or_else(|| int.as_str().and_then(|s| s.parse().ok())).map(QueryAttribute::Int)
    }
}

/// Decode a whole query output. Any undecodable line fails the query.
pub fn decode_query_output(stdout: &str) -> Result<QueryResult, BuildToolError> {
    let mut targets = Vec::new();
    for (number, line) in stdout.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let wire: WireTarget = serde_json::from_str(line)
            .map_err(|e| BuildToolError::Decode(format!("line {}: {}", number + 1, e)))?;
        targets.push(decode_target(wire).map_err(|e| BuildToolError::Decode(format!("line {}: {}", number + 1, e)))?);
    }
    Ok(QueryResult { targets })
}

fn decode_target(wire: WireTarget) -> Result<QueryTarget, String> {
    let missing = |field: &str| format!("{} target without a {} message", wire.discriminator, field);
    let named = |named: Option<WireNamed>, field: &str, kind: &str| -> Result<QueryTarget, String> {
        let named = named.ok_or_else(|| missing(field))?;
        Ok(QueryTarget {
            label: named.name,
            kind: kind.to_string(),
            location: named.location,
            attributes: BTreeMap::new(),
            inputs: Vec::new(),
        })
    };

    match wire.discriminator.as_str() {
        "RULE" => {
            let rule = wire.rule.ok_or_else(|| missing("rule"))?;
            let attributes = rule
                .attribute
                .into_iter()
                .filter_map(|attr| {
                    let name = attr.name.clone();
                    attr.value().map(|value| (name, value))
                })
                .collect();
            Ok(QueryTarget {
                label: rule.name,
                kind: rule.rule_class,
                location: rule.location,
                attributes,
                inputs: rule.rule_input,
            })
        }
        "SOURCE_FILE" => named(wire.source_file, "sourceFile", "source file"),
        "GENERATED_FILE" => named(wire.generated_file, "generatedFile", "generated file"),
        "PACKAGE_GROUP" => named(wire.package_group, "packageGroup", "package group"),
        "ENVIRONMENT_GROUP" => named(wire.environment_group, "environmentGroup", "environment group"),
        other => Err(format!("unknown target type {other:?}")),
    }
}
