//! Patchwork kubehub: the object store seam and its kube-rs implementation.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client, Resource,
};
use patchwork_core::{PatchError, PatchResult, PropagationPolicy};
use serde_json::Value as Json;
use tokio::sync::OnceCell;
use tracing::debug;

/// Addressable collection for one (apiVersion, kind).
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

impl ResourceHandle {
    pub fn new(api_resource: ApiResource, namespaced: bool) -> Self {
        Self { api_resource, namespaced }
    }

    pub fn gvk_key(&self) -> String {
        let ar = &self.api_resource;
        if ar.group.is_empty() {
            format!("{}/{}", ar.version, ar.kind)
        } else {
            format!("{}/{}/{}", ar.group, ar.version, ar.kind)
        }
    }
}

/// Patch bodies understood natively by the store.
#[derive(Debug, Clone)]
pub enum ObjectPatch {
    /// RFC 7386 merge patch.
    Merge(Json),
    /// RFC 6902 ordered edit list.
    Json(json_patch::Patch),
}

/// Remote store of objects addressed by (handle, namespace, name, subresource).
///
/// An empty `namespace` means the client's default namespace for namespaced
/// kinds and is ignored for cluster-scoped ones.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Resolve (apiVersion, kind) to a handle. An empty `api_version` picks the
    /// preferred version of the first group serving `kind`.
    async fn resolve(&self, api_version: &str, kind: &str) -> PatchResult<ResourceHandle>;

    async fn create(&self, res: &ResourceHandle, namespace: &str, obj: &DynamicObject, subresource: Option<&str>) -> PatchResult<DynamicObject>;

    async fn get(&self, res: &ResourceHandle, namespace: &str, name: &str, subresource: Option<&str>) -> PatchResult<DynamicObject>;

    /// Replace the object; a stale `metadata.resourceVersion` yields [`PatchError::Conflict`].
    async fn update(&self, res: &ResourceHandle, namespace: &str, obj: &DynamicObject, subresource: Option<&str>) -> PatchResult<DynamicObject>;

    async fn patch(&self, res: &ResourceHandle, namespace: &str, name: &str, patch: &ObjectPatch, subresource: Option<&str>) -> PatchResult<DynamicObject>;

    async fn delete(&self, res: &ResourceHandle, namespace: &str, name: &str, policy: PropagationPolicy, subresource: Option<&str>) -> PatchResult<()>;
}

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared kube client built from the default kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client, kube::Error> {
    CLIENT
        .get_or_try_init(|| async { Client::try_default().await })
        .await
        .cloned()
}

/// Split `apps/v1` into `("apps", "v1")` and `v1` into `("", "v1")`.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Map a kube error onto the patch error taxonomy. `what` names the target.
pub fn classify_kube_error(err: kube::Error, what: &str) -> PatchError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => PatchError::NotFound(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            PatchError::AlreadyExists(format!("{}: {}", what, ae.message))
        }
        kube::Error::Api(ae) if ae.code == 409 => PatchError::Conflict(format!("{}: {}", what, ae.message)),
        other => PatchError::Remote(format!("{}: {}", what, other)),
    }
}

fn delete_params(policy: PropagationPolicy) -> DeleteParams {
    match policy {
        PropagationPolicy::Foreground => DeleteParams::foreground(),
        PropagationPolicy::Background => DeleteParams::background(),
        PropagationPolicy::Orphan => DeleteParams::orphan(),
    }
}

/// [`ObjectStore`] backed by a live API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> PatchResult<Self> {
        let client = get_kube_client()
            .await
            .map_err(|e| PatchError::Remote(format!("building kube client: {}", e)))?;
        Ok(Self::new(client))
    }

    fn namespace_for<'a>(&'a self, res: &ResourceHandle, namespace: &'a str) -> Option<&'a str> {
        if !res.namespaced {
            None
        } else if namespace.is_empty() {
            Some(self.client.default_namespace())
        } else {
            Some(namespace)
        }
    }

    fn api(&self, res: &ResourceHandle, namespace: &str) -> Api<DynamicObject> {
        match self.namespace_for(res, namespace) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &res.api_resource),
            None => Api::all_with(self.client.clone(), &res.api_resource),
        }
    }
}

fn target(res: &ResourceHandle, namespace: &str, name: &str, subresource: Option<&str>) -> String {
    let mut s = res.gvk_key();
    if !namespace.is_empty() {
        s.push(' ');
        s.push_str(namespace);
        s.push('/');
    } else {
        s.push(' ');
    }
    s.push_str(name);
    if let Some(sub) = subresource {
        s.push_str(" [");
        s.push_str(sub);
        s.push(']');
    }
    s
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn resolve(&self, api_version: &str, kind: &str) -> PatchResult<ResourceHandle> {
        let (group, version) = split_api_version(api_version);
        let discovery = if api_version.is_empty() {
            Discovery::new(self.client.clone())
        } else {
            Discovery::new(self.client.clone()).filter(&[group.as_str()])
        };
        let discovery = discovery
            .run()
            .await
            .map_err(|e| PatchError::Remote(format!("discovery for {} {}: {}", api_version, kind, e)))?;
        for api_group in discovery.groups() {
            let candidates = if api_version.is_empty() {
                api_group.recommended_resources()
            } else {
                api_group.versioned_resources(&version)
            };
            for (ar, caps) in candidates {
                if ar.kind == kind && (api_version.is_empty() || ar.group == group) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(api_version, kind, plural = %ar.plural, namespaced, "resource resolved");
                    return Ok(ResourceHandle::new(ar, namespaced));
                }
            }
        }
        Err(PatchError::NotFound(format!("no served resource for {group}/{version}/{kind}")))
    }

    async fn create(&self, res: &ResourceHandle, namespace: &str, obj: &DynamicObject, subresource: Option<&str>) -> PatchResult<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let what = target(res, namespace, &name, subresource);
        debug!(object = %what, "create");
        let api = self.api(res, namespace);
        let pp = PostParams::default();
        let out = match subresource {
            Some(sub) => api.create_subresource::<DynamicObject>(sub, &name, &pp, serde_json::to_vec(obj)?).await,
            None => api.create(&pp, obj).await,
        };
        out.map_err(|e| classify_kube_error(e, &what))
    }

    async fn get(&self, res: &ResourceHandle, namespace: &str, name: &str, subresource: Option<&str>) -> PatchResult<DynamicObject> {
        let what = target(res, namespace, name, subresource);
        let api = self.api(res, namespace);
        let out = match subresource {
            Some(sub) => api.get_subresource(sub, name).await,
            None => api.get(name).await,
        };
        out.map_err(|e| classify_kube_error(e, &what))
    }

    async fn update(&self, res: &ResourceHandle, namespace: &str, obj: &DynamicObject, subresource: Option<&str>) -> PatchResult<DynamicObject> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let what = target(res, namespace, &name, subresource);
        debug!(object = %what, rv = ?obj.metadata.resource_version, "update");
        let api = self.api(res, namespace);
        let pp = PostParams::default();
        let out = match subresource {
            Some(sub) => api.replace_subresource(sub, &name, &pp, serde_json::to_vec(obj)?).await,
            None => api.replace(&name, &pp, obj).await,
        };
        out.map_err(|e| classify_kube_error(e, &what))
    }

    async fn patch(&self, res: &ResourceHandle, namespace: &str, name: &str, patch: &ObjectPatch, subresource: Option<&str>) -> PatchResult<DynamicObject> {
        let what = target(res, namespace, name, subresource);
        debug!(object = %what, "patch");
        let api = self.api(res, namespace);
        let pp = PatchParams::default();
        let body: Patch<Json> = match patch {
            ObjectPatch::Merge(v) => Patch::Merge(v.clone()),
            ObjectPatch::Json(p) => Patch::Json(p.clone()),
        };
        let out = match subresource {
            Some(sub) => api.patch_subresource(sub, name, &pp, &body).await,
            None => api.patch(name, &pp, &body).await,
        };
        out.map_err(|e| classify_kube_error(e, &what))
    }

    async fn delete(&self, res: &ResourceHandle, namespace: &str, name: &str, policy: PropagationPolicy, subresource: Option<&str>) -> PatchResult<()> {
        let what = target(res, namespace, name, subresource);
        debug!(object = %what, %policy, "delete");
        let dp = delete_params(policy);
        match subresource {
            None => {
                self.api(res, namespace)
                    .delete(name, &dp)
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_kube_error(e, &what))
            }
            Some(sub) => {
                // Api has no subresource delete; address `<name>/<sub>` directly.
                let url = DynamicObject::url_path(&res.api_resource, self.namespace_for(res, namespace));
                let req = kube::core::Request::new(url)
                    .delete(&format!("{}/{}", name, sub), &dp)
                    .map_err(|e| PatchError::Remote(format!("{}: building request: {}", what, e)))?;
                self.client
                    .request::<Json>(req)
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_kube_error(e, &what))
            }
        }
    }
}
