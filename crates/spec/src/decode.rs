//! Spec stream decoding: a JSON document stream first, a YAML multi-document
//! stream as fallback.

use serde::Deserialize;
use serde_json::Value as Json;

use crate::SpecError;

const DEFAULT_MAX_SPEC_BYTES: usize = 1 << 20;
const DEFAULT_MAX_SPEC_NODES: usize = 100_000;

fn env_limit(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(default)
}

/// Payload cap, `PATCHWORK_MAX_SPEC_BYTES` (1 MiB by default).
pub(crate) fn max_spec_bytes() -> usize {
    env_limit("PATCHWORK_MAX_SPEC_BYTES", DEFAULT_MAX_SPEC_BYTES)
}

/// Per-document value budget, `PATCHWORK_MAX_SPEC_NODES`.
pub(crate) fn max_spec_nodes() -> usize {
    env_limit("PATCHWORK_MAX_SPEC_NODES", DEFAULT_MAX_SPEC_NODES)
}

/// Count the values in `doc`, giving up as soon as the count passes `limit`.
fn count_nodes(doc: &Json, limit: usize) -> usize {
    let mut seen = 0usize;
    let mut pending = vec![doc];
    while let Some(node) = pending.pop() {
        seen += 1;
        if seen > limit {
            break;
        }
        match node {
            Json::Object(fields) => pending.extend(fields.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    seen
}

/// Split `bytes` into raw spec documents, preserving their order, with the
/// limits taken from the environment.
///
/// Empty or whitespace-only input yields no documents.
pub fn decode_documents(bytes: &[u8]) -> Result<Vec<Json>, SpecError> {
    decode_documents_with(bytes, max_spec_bytes(), max_spec_nodes())
}

/// [`decode_documents`] with explicit limits. The size cap is checked before
/// any decoding; a document holding more than `max_nodes` values is rejected.
pub fn decode_documents_with(bytes: &[u8], max_bytes: usize, max_nodes: usize) -> Result<Vec<Json>, SpecError> {
    if bytes.len() > max_bytes {
        return Err(SpecError::TooLarge { size: bytes.len(), max: max_bytes });
    }
    let docs = match decode_json_stream(bytes) {
        Ok(docs) => docs,
        Err(json_err) => {
            tracing::debug!(error = %json_err, "spec payload is not a JSON stream; trying YAML");
            decode_yaml_stream(bytes).map_err(|yaml_err| SpecError::Decode {
                json: json_err.to_string(),
                yaml: yaml_err.to_string(),
            })?
        }
    };
    if let Some(index) = docs.iter().position(|d| count_nodes(d, max_nodes) > max_nodes) {
        return Err(SpecError::TooComplex { document: index, max: max_nodes });
    }
    Ok(docs)
}

fn decode_json_stream(bytes: &[u8]) -> Result<Vec<Json>, serde_json::Error> {
    serde_json::Deserializer::from_slice(bytes)
        .into_iter::<Json>()
        .collect()
}

fn decode_yaml_stream(bytes: &[u8]) -> Result<Vec<Json>, SpecError> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_slice(bytes) {
        let val = serde_yaml::Value::deserialize(doc).map_err(|e| SpecError::Yaml(e.to_string()))?;
        // A bare `---` separator or trailing comment produces an empty document.
        if val.is_null() { continue; }
        let json = serde_json::to_value(val).map_err(|e| SpecError::Yaml(format!("converting YAML to JSON: {}", e)))?;
        out.push(json);
    }
    Ok(out)
}
