//! Patchwork spec parsing: decode JSON/YAML operation streams and validate each
//! document against a versioned schema.

#![forbid(unsafe_code)]

use patchwork_core::OperationSpec;
use tracing::debug;

pub mod decode;
pub mod validate;

pub use decode::{decode_documents, decode_documents_with};
pub use validate::{validate_spec, SchemaVersion, ValidationErrors, ValidationIssue, Validator};

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("cannot decode specs as JSON ({json}) or as YAML ({yaml})")]
    Decode { json: String, yaml: String },
    #[error("yaml: {0}")]
    Yaml(String),
    #[error("spec payload too large ({size} bytes > {max})")]
    TooLarge { size: usize, max: usize },
    #[error("spec document #{document} too complex (>{max} nodes)")]
    TooComplex { document: usize, max: usize },
    #[error("unknown schema version: {0}")]
    UnknownSchemaVersion(String),
    #[error("schema: {0}")]
    Schema(String),
    #[error("{0}")]
    Invalid(ValidationErrors),
}

/// Outcome of [`parse_specs`]: the specs that passed validation, in stream
/// order, plus every issue found in the ones that did not.
#[derive(Debug, Default)]
pub struct Parsed {
    pub specs: Vec<OperationSpec>,
    pub errors: ValidationErrors,
}

impl Parsed {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&self) -> Option<&ValidationErrors> {
        if self.errors.is_empty() { None } else { Some(&self.errors) }
    }

    /// The specs, or the validation errors if any document was invalid.
    pub fn into_valid(self) -> Result<Vec<OperationSpec>, ValidationErrors> {
        if self.errors.is_empty() { Ok(self.specs) } else { Err(self.errors) }
    }
}

/// Decode `bytes` and validate every document against the `v0` schema.
pub fn parse_specs(bytes: &[u8]) -> Result<Parsed, SpecError> {
    parse_specs_with(bytes, SchemaVersion::V0)
}

pub fn parse_specs_with(bytes: &[u8], version: SchemaVersion) -> Result<Parsed, SpecError> {
    let docs = decode_documents(bytes)?;
    let validator = Validator::new(version)?;
    let mut parsed = Parsed::default();
    for (index, doc) in docs.into_iter().enumerate() {
        let issues = validator.validate(index, &doc);
        if !issues.is_empty() {
            parsed.errors.extend(issues);
            continue;
        }
        match serde_json::from_value::<OperationSpec>(doc) {
            Ok(spec) => parsed.specs.push(spec),
            Err(e) => parsed.errors.extend([ValidationIssue {
                document: index,
                path: String::new(),
                error: e.to_string(),
                hint: None,
            }]),
        }
    }
    debug!(valid = parsed.specs.len(), issues = parsed.errors.len(), schema = %version, "specs parsed");
    Ok(parsed)
}
