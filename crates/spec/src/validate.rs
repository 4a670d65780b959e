//! Versioned JSON Schema validation of raw spec documents.

use std::fmt;
use std::str::FromStr;

use jsonschema::{error::ValidationErrorKind, Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::SpecError;

/// Version of the spec document schema. New versions are added next to the
/// existing ones so older documents keep validating against their own schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchemaVersion {
    #[default]
    V0,
}

impl SchemaVersion {
    pub const LATEST: SchemaVersion = SchemaVersion::V0;

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V0 => "v0",
        }
    }

    fn document(&self) -> &'static str {
        match self {
            SchemaVersion::V0 => include_str!("../schemas/v0.json"),
        }
    }
}

impl FromStr for SchemaVersion {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v0" => Ok(SchemaVersion::V0),
            other => Err(SpecError::UnknownSchemaVersion(other.to_string())),
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One schema violation inside one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Position of the document in the decoded stream.
    pub document: usize,
    /// JSON pointer into the document; empty for the document root.
    pub path: String,
    pub error: String,
    pub hint: Option<String>,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        write!(f, "document #{} at {}: {}", self.document, path, self.error)?;
        if let Some(h) = &self.hint {
            write!(f, " ({})", h)?;
        }
        Ok(())
    }
}

/// Every violation found across a batch of documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn extend(&mut self, issues: impl IntoIterator<Item = ValidationIssue>) {
        self.issues.extend(issues);
    }

    /// Indices of documents with at least one issue, ascending and deduplicated.
    pub fn documents(&self) -> Vec<usize> {
        let mut docs: Vec<usize> = self.issues.iter().map(|i| i.document).collect();
        docs.sort_unstable();
        docs.dedup();
        docs
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.issues.len();
        writeln!(f, "{} validation error{} occurred:", n, if n == 1 { "" } else { "s" })?;
        for issue in &self.issues {
            writeln!(f, "\t* {}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Compiled schema for one [`SchemaVersion`].
pub struct Validator {
    version: SchemaVersion,
    compiled: JSONSchema,
}

impl Validator {
    pub fn new(version: SchemaVersion) -> Result<Self, SpecError> {
        let schema: Json = serde_json::from_str(version.document())
            .map_err(|e| SpecError::Schema(format!("parsing {} schema: {}", version, e)))?;
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|e| SpecError::Schema(format!("compiling {} schema: {}", version, e)))?;
        Ok(Self { version, compiled })
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// All violations of `doc`; empty when the document is valid.
    pub fn validate(&self, document: usize, doc: &Json) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if let Err(errors) = self.compiled.validate(doc) {
            for err in errors {
                let hint = match &err.kind {
                    ValidationErrorKind::Required { .. } => Some("missing required field"),
                    ValidationErrorKind::FalseSchema => Some("field not allowed for this operation"),
                    ValidationErrorKind::AdditionalProperties { .. } => Some("unknown field"),
                    ValidationErrorKind::Enum { .. } => Some("value not in allowed set"),
                    ValidationErrorKind::Type { .. } => Some("mismatched type"),
                    _ => None,
                };
                issues.push(ValidationIssue {
                    document,
                    path: err.instance_path.to_string(),
                    error: err.to_string(),
                    hint: hint.map(str::to_string),
                });
            }
        }
        issues
    }
}

/// Validate a single document against `version`, reporting every violation.
pub fn validate_spec(doc: &Json, version: SchemaVersion) -> Result<(), SpecError> {
    let validator = Validator::new(version)?;
    let issues = validator.validate(0, doc);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(SpecError::Invalid(ValidationErrors { issues }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v0() -> Validator {
        Validator::new(SchemaVersion::V0).expect("v0 schema compiles")
    }

    #[test]
    fn accepts_every_operation_shape() {
        let docs = vec![
            json!({"operation": "Create", "object": {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}}),
            json!({"operation": "CreateOrUpdate", "object": {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}}),
            json!({"operation": "Delete", "apiVersion": "v1", "kind": "Pod", "namespace": "ns", "name": "p"}),
            json!({"operation": "DeleteInBackground", "kind": "Pod", "name": "p"}),
            json!({"operation": "DeleteNonCascading", "kind": "Pod", "name": "p"}),
            json!({"operation": "JQPatch", "kind": "Pod", "name": "p", "jqFilter": ".metadata.labels.a = \"b\""}),
            json!({"operation": "MergePatch", "kind": "Pod", "name": "p", "mergePatch": {"metadata": {"labels": {"a": "b"}}}}),
            json!({"operation": "JSONPatch", "kind": "Pod", "name": "p", "subresource": "status",
                   "jsonPatch": [{"op": "replace", "path": "/status/phase", "value": "Running"}]}),
        ];
        let v = v0();
        for (i, d) in docs.iter().enumerate() {
            assert!(v.validate(i, d).is_empty(), "doc {} rejected: {:?}", i, v.validate(i, d));
        }
    }

    #[test]
    fn collects_all_violations_of_a_document() {
        let doc = json!({
            "operation": "MergePatch",
            "kind": 7,
            "jqFilter": ".x",
            "bogus": true
        });
        let issues = v0().validate(2, &doc);
        assert!(issues.len() >= 4, "issues: {:#?}", issues);
        assert!(issues.iter().all(|i| i.document == 2));
        assert!(issues.iter().any(|i| i.path == "/kind" && i.hint.as_deref() == Some("mismatched type")));
        assert!(issues.iter().any(|i| i.path == "/jqFilter" && i.hint.as_deref() == Some("field not allowed for this operation")));
        assert!(issues.iter().any(|i| i.hint.as_deref() == Some("unknown field")));
        assert!(issues.iter().any(|i| i.error.contains("mergePatch")));
    }

    #[test]
    fn rejects_unknown_operation_and_missing_payload() {
        let v = v0();
        let unknown = v.validate(0, &json!({"operation": "Explode", "kind": "Pod", "name": "p"}));
        assert!(unknown.iter().any(|i| i.path == "/operation"));

        let no_object = v.validate(0, &json!({"operation": "Create"}));
        assert!(no_object.iter().any(|i| i.error.contains("object")), "{:?}", no_object);
    }

    #[test]
    fn delete_refuses_payloads() {
        let issues = v0().validate(0, &json!({
            "operation": "Delete", "kind": "Pod", "name": "p", "mergePatch": {}
        }));
        assert!(issues.iter().any(|i| i.path == "/mergePatch"));
    }

    #[test]
    fn schema_version_parses_known_names_only() {
        assert_eq!("v0".parse::<SchemaVersion>().unwrap(), SchemaVersion::V0);
        assert!(matches!("v9".parse::<SchemaVersion>(), Err(SpecError::UnknownSchemaVersion(_))));
        assert_eq!(SchemaVersion::LATEST.to_string(), "v0");
    }

    #[test]
    fn validate_spec_wraps_issues() {
        let err = validate_spec(&json!({"kind": "Pod"}), SchemaVersion::V0).unwrap_err();
        match err {
            SpecError::Invalid(errs) => assert!(!errs.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
