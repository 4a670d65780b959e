//! Patchwork engine: executes operation specs against an [`ObjectStore`].
//!
//! Every executor addresses its target through the store seam. Read-modify-write
//! executors retry on optimistic-concurrency conflicts and skip the write when
//! the transform leaves the object unchanged.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::core::DynamicObject;
use metrics::counter;
use patchwork_core::{PatchError, PatchResult, PropagationPolicy};
use patchwork_kubehub::{ObjectPatch, ObjectStore, ResourceHandle};
use serde_json::Value as Json;
use tracing::{debug, info};

pub mod batch;
pub mod jq;
pub mod retry;
pub mod wait;

pub use jq::{FilterError, FilterEvaluator, JqCommand};
pub use retry::{retry_on, retry_on_conflict, Backoff};
pub use wait::{poll_until, WaitConfig};

/// Tunables shared by all executors.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PatcherConfig {
    pub backoff: Backoff,
    pub delete_wait: WaitConfig,
}

impl PatcherConfig {
    /// Defaults, with deletion waits and conflict retry steps read from the
    /// `PATCHWORK_*` environment.
    pub fn from_env() -> Self {
        let steps = std::env::var("PATCHWORK_CONFLICT_RETRY_STEPS").ok();
        Self { backoff: backoff_with_steps(steps.as_deref()), delete_wait: WaitConfig::from_env() }
    }
}

/// Default backoff with its step count taken from `raw` when that parses.
/// At least one attempt is always made.
fn backoff_with_steps(raw: Option<&str>) -> Backoff {
    let mut backoff = Backoff::default();
    if let Some(steps) = raw.and_then(|s| s.trim().parse::<u32>().ok()) {
        backoff.steps = steps.max(1);
    }
    backoff
}

/// Executes operations against a store.
#[derive(Clone)]
pub struct ObjectPatcher {
    store: Arc<dyn ObjectStore>,
    evaluator: Arc<dyn FilterEvaluator>,
    config: PatcherConfig,
}

impl ObjectPatcher {
    pub fn new(store: Arc<dyn ObjectStore>, evaluator: Arc<dyn FilterEvaluator>) -> Self {
        Self { store, evaluator, config: PatcherConfig::default() }
    }

    pub fn with_config(mut self, config: PatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PatcherConfig {
        &self.config
    }

    /// Create `object` (or its `subresource`). Fails with `AlreadyExists` if
    /// the object is already present.
    pub async fn create_object(&self, object: &Json, subresource: Option<&str>) -> PatchResult<()> {
        let (res, obj) = self.prepare(object).await?;
        let ns = obj.metadata.namespace.clone().unwrap_or_default();
        self.store.create(&res, &ns, &obj, subresource).await?;
        Ok(())
    }

    /// Create `object`, or replace the stored one if it already exists.
    pub async fn create_or_update_object(&self, object: &Json, subresource: Option<&str>) -> PatchResult<()> {
        let (res, obj) = self.prepare(object).await?;
        let ns = obj.metadata.namespace.clone().unwrap_or_default();
        let err = match self.store.create(&res, &ns, &obj, subresource).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        if !err.is_already_exists() {
            return Err(err);
        }
        let name = obj.metadata.name.clone().unwrap_or_default();
        debug!(kind = %res.api_resource.kind, ns = %ns, name = %name, "object exists, updating");
        let store = self.store.as_ref();
        let (res, ns, name, obj) = (&res, ns.as_str(), name.as_str(), &obj);
        retry_on_conflict(&self.config.backoff, || async move {
            let existing = store.get(res, ns, name, None).await?;
            let mut desired = obj.clone();
            desired.metadata.resource_version = existing.metadata.resource_version;
            store.update(res, ns, &desired, subresource).await?;
            Ok(())
        })
        .await
    }

    /// Delete and wait until the object is gone from the store.
    pub async fn delete_object(&self, api_version: &str, kind: &str, namespace: &str, name: &str, subresource: Option<&str>) -> PatchResult<()> {
        self.delete_with(api_version, kind, namespace, name, subresource, PropagationPolicy::Foreground).await
    }

    pub async fn delete_object_in_background(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
    ) -> PatchResult<()> {
        self.delete_with(api_version, kind, namespace, name, subresource, PropagationPolicy::Background).await
    }

    /// Delete without removing dependents.
    pub async fn delete_object_non_cascading(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
    ) -> PatchResult<()> {
        self.delete_with(api_version, kind, namespace, name, subresource, PropagationPolicy::Orphan).await
    }

    async fn delete_with(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
        policy: PropagationPolicy,
    ) -> PatchResult<()> {
        let res = self.store.resolve(api_version, kind).await?;
        match self.store.delete(&res, namespace, name, policy, subresource).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(kind, ns = namespace, name, "already absent");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if policy != PropagationPolicy::Foreground {
            return Ok(());
        }

        let what = format!("deletion of {kind} {namespace}/{name}");
        let store = self.store.as_ref();
        let res = &res;
        let waited = poll_until(&self.config.delete_wait, &what, || async move {
            match store.get(res, namespace, name, None).await {
                Ok(_) => Ok(false),
                Err(e) if e.is_not_found() => Ok(true),
                Err(e) => Err(e),
            }
        })
        .await;
        if let Err(PatchError::Timeout { .. }) = &waited {
            counter!("patch_delete_wait_timeouts_total", 1u64);
        }
        waited
    }

    /// Read the object, apply `transform`, and write it back unless unchanged.
    /// Transform errors end the operation without retrying.
    pub async fn filter_object<F, E>(
        &self,
        transform: F,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
    ) -> PatchResult<()>
    where
        F: Fn(&DynamicObject) -> Result<DynamicObject, E> + Send + Sync,
        E: std::fmt::Display,
    {
        let res = self.store.resolve(api_version, kind).await?;
        let store = self.store.as_ref();
        let (res, transform) = (&res, &transform);
        retry_on_conflict(&self.config.backoff, || async move {
            let current = store.get(res, namespace, name, None).await?;
            let filtered = transform(&current).map_err(|e| PatchError::Transform(e.to_string()))?;
            write_if_changed(store, res, namespace, &current, &filtered, subresource).await
        })
        .await
    }

    /// Like [`filter_object`](Self::filter_object) with a jq expression as the transform.
    pub async fn jq_patch_object(
        &self,
        jq_filter: &str,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
    ) -> PatchResult<()> {
        let res = self.store.resolve(api_version, kind).await?;
        let store = self.store.as_ref();
        let res = &res;
        retry_on_conflict(&self.config.backoff, || async move {
            let current = store.get(res, namespace, name, None).await?;
            let filtered = self.apply_jq(jq_filter, &current).await?;
            write_if_changed(store, res, namespace, &current, &filtered, subresource).await
        })
        .await
    }

    async fn apply_jq(&self, jq_filter: &str, obj: &DynamicObject) -> PatchResult<DynamicObject> {
        let failed = |message: String| PatchError::Filter {
            filter: jq_filter.to_string(),
            object: serde_json::to_string_pretty(obj).unwrap_or_default(),
            message,
        };
        let input = serde_json::to_vec(obj)?;
        let output = self.evaluator.evaluate(jq_filter, &input).await.map_err(|e| failed(e.to_string()))?;
        serde_json::from_slice::<DynamicObject>(&output)
            .map_err(|e| failed(format!("filter result is not an object ({e}): {}", String::from_utf8_lossy(&output).trim())))
    }

    /// Apply an RFC 7386 merge patch given as serialized JSON.
    pub async fn merge_patch_object(
        &self,
        merge_patch: &[u8],
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
    ) -> PatchResult<()> {
        let patch: Json = serde_json::from_slice(merge_patch)?;
        if !patch.is_object() {
            return Err(PatchError::InvalidInput("merge patch must be a JSON object".into()));
        }
        self.patch_with(ObjectPatch::Merge(patch), api_version, kind, namespace, name, subresource).await
    }

    /// Apply an RFC 6902 patch given as a serialized operation list.
    pub async fn json_patch_object(
        &self,
        json_patch: &[u8],
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
    ) -> PatchResult<()> {
        let patch: json_patch::Patch = serde_json::from_slice(json_patch)?;
        self.patch_with(ObjectPatch::Json(patch), api_version, kind, namespace, name, subresource).await
    }

    async fn patch_with(
        &self,
        patch: ObjectPatch,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
    ) -> PatchResult<()> {
        let res = self.store.resolve(api_version, kind).await?;
        self.store.patch(&res, namespace, name, &patch, subresource).await?;
        Ok(())
    }

    async fn prepare(&self, object: &Json) -> PatchResult<(ResourceHandle, DynamicObject)> {
        if !object.is_object() {
            return Err(PatchError::InvalidInput(format!("object must be a JSON object, got {}", json_type(object))));
        }
        let obj: DynamicObject = serde_json::from_value(object.clone())?;
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| PatchError::InvalidInput("object has no apiVersion/kind".into()))?;
        if types.kind.is_empty() {
            return Err(PatchError::InvalidInput("object has an empty kind".into()));
        }
        let res = self.store.resolve(&types.api_version, &types.kind).await?;
        Ok((res, obj))
    }
}

async fn write_if_changed(
    store: &dyn ObjectStore,
    res: &ResourceHandle,
    namespace: &str,
    current: &DynamicObject,
    filtered: &DynamicObject,
    subresource: Option<&str>,
) -> PatchResult<()> {
    if serde_json::to_value(current)? == serde_json::to_value(filtered)? {
        info!(kind = %res.api_resource.kind, ns = namespace, name = current.metadata.name.as_deref().unwrap_or(""), "unchanged, skipping update");
        return Ok(());
    }
    store.update(res, namespace, filtered, subresource).await?;
    Ok(())
}

fn json_type(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_type_names() {
        assert_eq!(json_type(&Json::Null), "null");
        assert_eq!(json_type(&serde_json::json!([1])), "array");
        assert_eq!(json_type(&serde_json::json!({})), "object");
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let cfg = PatcherConfig::default();
        assert_eq!(cfg.backoff.steps, 4);
        assert_eq!(cfg.delete_wait.interval, std::time::Duration::from_secs(1));
        assert_eq!(cfg.delete_wait.timeout, std::time::Duration::from_secs(20));
    }

    #[test]
    fn retry_steps_override_is_clamped() {
        assert_eq!(backoff_with_steps(Some("7")).steps, 7);
        assert_eq!(backoff_with_steps(Some("0")).steps, 1);
        assert_eq!(backoff_with_steps(Some("many")).steps, 4);
        assert_eq!(backoff_with_steps(None), Backoff::default());
    }
}
