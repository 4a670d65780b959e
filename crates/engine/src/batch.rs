//! Sequential batch dispatch with per-spec error collection.

use std::time::Instant;

use metrics::{counter, histogram};
use patchwork_core::{BatchError, Operation, OperationSpec, PatchResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ObjectPatcher;

impl ObjectPatcher {
    /// Run every spec in order. A failing spec never stops the ones after it;
    /// all failures come back together, tagged with their batch index.
    pub async fn execute_batch(&self, specs: &[OperationSpec]) -> Result<(), BatchError> {
        let batch = Uuid::new_v4();
        let t0 = Instant::now();
        info!(%batch, specs = specs.len(), "batch started");

        let mut errors = BatchError::new();
        for (index, spec) in specs.iter().enumerate() {
            let op = spec.kind();
            counter!("patch_ops_total", 1u64, "op" => op.as_str());
            debug!(%batch, index, %op, kind = %spec.kind, ns = %spec.namespace, name = %spec.name, "dispatching");
            if let Err(e) = self.execute(spec).await {
                counter!("patch_op_errors_total", 1u64, "op" => op.as_str());
                warn!(%batch, index, %op, error = %e, "operation failed");
                errors.push(index, op, e);
            }
        }

        let ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("patch_batch_latency_ms", ms);
        info!(%batch, specs = specs.len(), failed = errors.len(), took_ms = ms as u64, "batch finished");
        errors.into_result()
    }

    /// Route one spec to its executor. Patch payloads are serialized here so a
    /// payload that cannot be marshaled fails only its own spec.
    pub async fn execute(&self, spec: &OperationSpec) -> PatchResult<()> {
        let (av, kind, ns, name, sub) = (spec.api_version.as_str(), spec.kind.as_str(), spec.namespace.as_str(), spec.name.as_str(), spec.subresource());
        match &spec.operation {
            Operation::Create { object } => self.create_object(object, sub).await,
            Operation::CreateOrUpdate { object } => self.create_or_update_object(object, sub).await,
            Operation::Delete => self.delete_object(av, kind, ns, name, sub).await,
            Operation::DeleteInBackground => self.delete_object_in_background(av, kind, ns, name, sub).await,
            Operation::DeleteNonCascading => self.delete_object_non_cascading(av, kind, ns, name, sub).await,
            Operation::JqPatch { jq_filter } => self.jq_patch_object(jq_filter, av, kind, ns, name, sub).await,
            Operation::MergePatch { merge_patch } => {
                let bytes = serde_json::to_vec(merge_patch)?;
                self.merge_patch_object(&bytes, av, kind, ns, name, sub).await
            }
            Operation::JsonPatch { json_patch } => {
                let bytes = serde_json::to_vec(json_patch)?;
                self.json_patch_object(&bytes, av, kind, ns, name, sub).await
            }
        }
    }
}
