//! TW-002: Remote-state reference parsing.
//!
//! A reference has the form `source.outputs.path`, where `path` is one or
//! more dot-separated segments naming an output of `source` (and optionally
//! attributes nested inside it).

use super::error::WorkerError;
use serde::{Deserialize, Serialize};
use std::fmt;

const OUTPUTS: &str = "outputs";

/// A dependency on another definition's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteReference {
    /// Name of the definition that produces the output.
    pub source: String,
    /// Dotted path below `outputs`.
    pub output_path: String,
}

impl RemoteReference {
    /// Parse `source.outputs.path`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let mut parts = raw.splitn(3, '.');
        let source = parts.next().unwrap_or_default();
        let outputs = parts.next();
        let path = parts.next();

        if source.is_empty() {
            return Err("missing source definition".to_string());
        }
        if !is_identifier(source) {
            return Err(format!("'{}' is not a valid definition name", source));
        }
        match outputs {
            Some(OUTPUTS) => {}
            Some(other) => return Err(format!("expected 'outputs' after source, got '{}'", other)),
            None => return Err("expected 'source.outputs.path'".to_string()),
        }
        let path = path.unwrap_or_default();
        if path.is_empty() || path.split('.').any(|seg| seg.is_empty()) {
            return Err("output path must not be empty".to_string());
        }
        if let Some(bad) = path.split('.').find(|seg| !is_identifier(seg)) {
            return Err(format!("'{}' is not a valid output segment", bad));
        }

        Ok(Self {
            source: source.to_string(),
            output_path: path.to_string(),
        })
    }

    /// The top-level output name (first path segment).
    pub fn output_name(&self) -> &str {
        self.output_path
            .split('.')
            .next()
            .unwrap_or(&self.output_path)
    }

    /// Segments below the top-level output, for walking nested values.
    pub fn nested_segments(&self) -> impl Iterator<Item = &str> {
        self.output_path.split('.').skip(1)
    }

    /// Expression resolved by terraform at runtime.
    pub fn data_expression(&self) -> String {
        format!(
            "data.terraform_remote_state.{}.outputs.{}",
            self.source, self.output_path
        )
    }
}

impl fmt::Display for RemoteReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.source, OUTPUTS, self.output_path)
    }
}

impl TryFrom<String> for RemoteReference {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).map_err(|e| format!("invalid remote reference '{}': {}", value, e))
    }
}

impl From<RemoteReference> for String {
    fn from(r: RemoteReference) -> Self {
        r.to_string()
    }
}

/// Parse a reference declared by `definition`, attaching context on failure.
pub fn parse_reference(definition: &str, raw: &str) -> Result<RemoteReference, WorkerError> {
    RemoteReference::parse(raw).map_err(|reason| WorkerError::InvalidReference {
        definition: definition.to_string(),
        reference: raw.to_string(),
        reason,
    })
}

/// Terraform identifiers: letters, digits, `_` and `-`, not starting with a digit.
/// Letters, digits, `_` and `-`, not starting with a digit or `-`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
