//! Patchwork core types: operation specs, the error taxonomy and batch outcomes.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Payload-free discriminant of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    CreateOrUpdate,
    Delete,
    DeleteInBackground,
    DeleteNonCascading,
    #[serde(rename = "JQPatch")]
    JqPatch,
    MergePatch,
    #[serde(rename = "JSONPatch")]
    JsonPatch,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::Create,
        OperationKind::CreateOrUpdate,
        OperationKind::Delete,
        OperationKind::DeleteInBackground,
        OperationKind::DeleteNonCascading,
        OperationKind::JqPatch,
        OperationKind::MergePatch,
        OperationKind::JsonPatch,
    ];

    /// Wire name, as written in the `operation` field of a spec.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "Create",
            OperationKind::CreateOrUpdate => "CreateOrUpdate",
            OperationKind::Delete => "Delete",
            OperationKind::DeleteInBackground => "DeleteInBackground",
            OperationKind::DeleteNonCascading => "DeleteNonCascading",
            OperationKind::JqPatch => "JQPatch",
            OperationKind::MergePatch => "MergePatch",
            OperationKind::JsonPatch => "JSONPatch",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The requested mutation together with its payload. The `operation` field of a
/// serialized spec selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum Operation {
    Create {
        object: Json,
    },
    CreateOrUpdate {
        object: Json,
    },
    Delete,
    DeleteInBackground,
    DeleteNonCascading,
    #[serde(rename = "JQPatch")]
    JqPatch {
        #[serde(rename = "jqFilter")]
        jq_filter: String,
    },
    MergePatch {
        #[serde(rename = "mergePatch")]
        merge_patch: Json,
    },
    #[serde(rename = "JSONPatch")]
    JsonPatch {
        #[serde(rename = "jsonPatch")]
        json_patch: Json,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Create { .. } => OperationKind::Create,
            Operation::CreateOrUpdate { .. } => OperationKind::CreateOrUpdate,
            Operation::Delete => OperationKind::Delete,
            Operation::DeleteInBackground => OperationKind::DeleteInBackground,
            Operation::DeleteNonCascading => OperationKind::DeleteNonCascading,
            Operation::JqPatch { .. } => OperationKind::JqPatch,
            Operation::MergePatch { .. } => OperationKind::MergePatch,
            Operation::JsonPatch { .. } => OperationKind::JsonPatch,
        }
    }
}

/// One requested mutation of a single object.
///
/// For `Create` and `CreateOrUpdate` the addressing fields are taken from the
/// embedded object; for every other operation they address the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    #[serde(flatten)]
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Empty means the main resource.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subresource: String,
}

impl OperationSpec {
    /// Spec addressing `apiVersion/kind` `namespace/name` with the given operation.
    pub fn new(operation: Operation, api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            operation,
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            subresource: String::new(),
        }
    }

    pub fn with_subresource(mut self, subresource: &str) -> Self {
        self.subresource = subresource.to_string();
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    pub fn subresource(&self) -> Option<&str> {
        if self.subresource.is_empty() { None } else { Some(self.subresource.as_str()) }
    }
}

/// Cascade policy applied to dependents of a deleted object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationPolicy {
    /// Dependents are removed before the owner disappears.
    Foreground,
    Background,
    /// Dependents are left in place.
    Orphan,
}

impl fmt::Display for PropagationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropagationPolicy::Foreground => "Foreground",
            PropagationPolicy::Background => "Background",
            PropagationPolicy::Orphan => "Orphan",
        };
        f.write_str(s)
    }
}

/// Errors raised by a single operation.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The stored object changed between read and write.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("remote: {0}")]
    Remote(String),
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },
    #[error("failed to apply jqFilter:\n{filter}\nto object:\n{object}\nerror: {message}")]
    Filter { filter: String, object: String, message: String },
    #[error("filter function failed: {0}")]
    Transform(String),
    #[error("marshal: {0}")]
    Marshal(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PatchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PatchError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, PatchError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PatchError::Conflict(_))
    }
}

pub type PatchResult<T> = Result<T, PatchError>;

/// Failure of the spec at `index` within a batch.
#[derive(Debug)]
pub struct SpecFailure {
    pub index: usize,
    pub kind: OperationKind,
    pub error: PatchError,
}

/// Ordered collection of per-spec failures. Empty means the batch succeeded.
#[derive(Debug, Default)]
pub struct BatchError {
    failures: Vec<SpecFailure>,
}

impl BatchError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, kind: OperationKind, error: PatchError) {
        self.failures.push(SpecFailure { index, kind, error });
    }

    /// Move all failures of `other` after the ones already recorded.
    pub fn append(&mut self, mut other: BatchError) {
        self.failures.append(&mut other.failures);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[SpecFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<SpecFailure> {
        self.failures
    }

    /// `Ok(())` when nothing failed, `Err(self)` otherwise.
    pub fn into_result(self) -> Result<(), BatchError> {
        if self.failures.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.failures.len();
        writeln!(f, "{} error{} occurred:", n, if n == 1 { "" } else { "s" })?;
        for fail in &self.failures {
            writeln!(f, "\t* spec #{} ({}): {}", fail.index, fail.kind, fail.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

pub mod prelude {
    pub use super::{BatchError, Operation, OperationKind, OperationSpec, PatchError, PatchResult, PropagationPolicy, SpecFailure};
}
