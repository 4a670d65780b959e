#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use patchwork_core::{PatchError, PatchResult, PropagationPolicy};
use patchwork_engine::{FilterError, FilterEvaluator};
use patchwork_kubehub::{split_api_version, ObjectPatch, ObjectStore, ResourceHandle};
use serde_json::{json, Value};
use tokio::time::Instant;

type Key = (String, String, String);

/// How long a foreground-deleted object stays visible.
#[derive(Debug, Clone, Copy)]
pub enum Linger {
    Immediate,
    For(Duration),
    Forever,
}

struct State {
    objects: HashMap<Key, Value>,
    next_rv: u64,
    interfere: usize,
    linger: Linger,
    deleting: HashMap<Key, Option<Instant>>,
    failing: HashSet<String>,
    last_subresource: Option<String>,
}

/// In-memory [`ObjectStore`] with resourceVersion checks and call counters.
/// Every call yields once first so concurrent callers interleave.
pub struct FakeStore {
    state: Mutex<State>,
    pub creates: AtomicUsize,
    pub gets: AtomicUsize,
    pub updates: AtomicUsize,
    pub patches: AtomicUsize,
    pub deletes: AtomicUsize,
}

pub fn handle(api_version: &str, kind: &str) -> ResourceHandle {
    let (group, version) = split_api_version(api_version);
    let gvk = GroupVersionKind::gvk(&group, &version, kind);
    ResourceHandle::new(ApiResource::from_gvk(&gvk), true)
}

fn ns_or_default(ns: &str) -> String {
    if ns.is_empty() { "default".to_string() } else { ns.to_string() }
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                objects: HashMap::new(),
                next_rv: 100,
                interfere: 0,
                linger: Linger::Immediate,
                deleting: HashMap::new(),
                failing: HashSet::new(),
                last_subresource: None,
            }),
            creates: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            patches: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// The next `n` reads are followed by a write from someone else.
    pub fn interfere(&self, n: usize) {
        self.state.lock().unwrap().interfere = n;
    }

    pub fn linger(&self, linger: Linger) {
        self.state.lock().unwrap().linger = linger;
    }

    /// Every call naming `name` fails with a remote error.
    pub fn fail_on(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    /// Store `object` directly and return its resourceVersion.
    pub fn seed(&self, object: Value) -> u64 {
        let mut st = self.state.lock().unwrap();
        let key = key_of(&object);
        let rv = bump(&mut st);
        let mut object = object;
        object["metadata"]["resourceVersion"] = json!(rv.to_string());
        st.objects.insert(key, object);
        rv
    }

    pub fn object(&self, api_version: &str, kind: &str, ns: &str, name: &str) -> Option<Value> {
        let key = (handle(api_version, kind).gvk_key(), ns_or_default(ns), name.to_string());
        self.state.lock().unwrap().objects.get(&key).cloned()
    }

    pub fn last_subresource(&self) -> Option<String> {
        self.state.lock().unwrap().last_subresource.clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn check_failing(&self, name: &str) -> PatchResult<()> {
        if self.state.lock().unwrap().failing.contains(name) {
            return Err(PatchError::Remote(format!("injected failure for {name}")));
        }
        Ok(())
    }
}

fn key_of(object: &Value) -> Key {
    let api_version = object["apiVersion"].as_str().unwrap_or_default();
    let kind = object["kind"].as_str().unwrap_or_default();
    let ns = object["metadata"]["namespace"].as_str().unwrap_or_default();
    let name = object["metadata"]["name"].as_str().unwrap_or_default();
    (handle(api_version, kind).gvk_key(), ns_or_default(ns), name.to_string())
}

fn bump(st: &mut State) -> u64 {
    st.next_rv += 1;
    st.next_rv
}

pub fn rv_of(object: &Value) -> u64 {
    object["metadata"]["resourceVersion"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn to_dynamic(v: &Value) -> PatchResult<DynamicObject> {
    Ok(serde_json::from_value(v.clone())?)
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn resolve(&self, api_version: &str, kind: &str) -> PatchResult<ResourceHandle> {
        if kind == "Missing" {
            return Err(PatchError::NotFound(format!("kind {api_version}/{kind} is not served")));
        }
        Ok(handle(api_version, kind))
    }

    async fn create(&self, res: &ResourceHandle, namespace: &str, obj: &DynamicObject, subresource: Option<&str>) -> PatchResult<DynamicObject> {
        tokio::task::yield_now().await;
        self.creates.fetch_add(1, Ordering::SeqCst);
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.check_failing(&name)?;
        let mut st = self.state.lock().unwrap();
        st.last_subresource = subresource.map(str::to_string);
        let key = (res.gvk_key(), ns_or_default(namespace), name.clone());
        if st.objects.contains_key(&key) {
            return Err(PatchError::AlreadyExists(name));
        }
        let mut value = serde_json::to_value(obj)?;
        let rv = bump(&mut st);
        value["metadata"]["resourceVersion"] = json!(rv.to_string());
        st.objects.insert(key, value.clone());
        to_dynamic(&value)
    }

    async fn get(&self, res: &ResourceHandle, namespace: &str, name: &str, _subresource: Option<&str>) -> PatchResult<DynamicObject> {
        tokio::task::yield_now().await;
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_failing(name)?;
        let mut st = self.state.lock().unwrap();
        let key = (res.gvk_key(), ns_or_default(namespace), name.to_string());
        let expired = matches!(st.deleting.get(&key), Some(Some(deadline)) if Instant::now() >= *deadline);
        if expired {
            st.deleting.remove(&key);
            st.objects.remove(&key);
        }
        let current = st.objects.get(&key).cloned().ok_or_else(|| PatchError::NotFound(name.to_string()))?;
        if st.interfere > 0 {
            st.interfere -= 1;
            let rv = bump(&mut st);
            if let Some(stored) = st.objects.get_mut(&key) {
                stored["metadata"]["resourceVersion"] = json!(rv.to_string());
            }
        }
        to_dynamic(&current)
    }

    async fn update(&self, res: &ResourceHandle, namespace: &str, obj: &DynamicObject, subresource: Option<&str>) -> PatchResult<DynamicObject> {
        tokio::task::yield_now().await;
        self.updates.fetch_add(1, Ordering::SeqCst);
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.check_failing(&name)?;
        let mut st = self.state.lock().unwrap();
        st.last_subresource = subresource.map(str::to_string);
        let key = (res.gvk_key(), ns_or_default(namespace), name.clone());
        let stored_rv = st.objects.get(&key).map(rv_of).ok_or_else(|| PatchError::NotFound(name.clone()))?;
        let sent_rv = obj.metadata.resource_version.as_deref().and_then(|s| s.parse::<u64>().ok());
        if sent_rv != Some(stored_rv) {
            return Err(PatchError::Conflict(format!("{name}: resourceVersion {sent_rv:?} is stale, stored {stored_rv}")));
        }
        let mut value = serde_json::to_value(obj)?;
        let rv = bump(&mut st);
        value["metadata"]["resourceVersion"] = json!(rv.to_string());
        st.objects.insert(key, value.clone());
        to_dynamic(&value)
    }

    async fn patch(&self, res: &ResourceHandle, namespace: &str, name: &str, patch: &ObjectPatch, subresource: Option<&str>) -> PatchResult<DynamicObject> {
        tokio::task::yield_now().await;
        self.patches.fetch_add(1, Ordering::SeqCst);
        self.check_failing(name)?;
        let mut st = self.state.lock().unwrap();
        st.last_subresource = subresource.map(str::to_string);
        let key = (res.gvk_key(), ns_or_default(namespace), name.to_string());
        let mut doc = st.objects.get(&key).cloned().ok_or_else(|| PatchError::NotFound(name.to_string()))?;
        match patch {
            ObjectPatch::Merge(p) => json_patch::merge(&mut doc, p),
            ObjectPatch::Json(p) => json_patch::patch(&mut doc, &p.0).map_err(|e| PatchError::Remote(e.to_string()))?,
        }
        let rv = bump(&mut st);
        doc["metadata"]["resourceVersion"] = json!(rv.to_string());
        st.objects.insert(key, doc.clone());
        to_dynamic(&doc)
    }

    async fn delete(&self, res: &ResourceHandle, namespace: &str, name: &str, policy: PropagationPolicy, _subresource: Option<&str>) -> PatchResult<()> {
        tokio::task::yield_now().await;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_failing(name)?;
        let mut st = self.state.lock().unwrap();
        let key = (res.gvk_key(), ns_or_default(namespace), name.to_string());
        if !st.objects.contains_key(&key) {
            return Err(PatchError::NotFound(name.to_string()));
        }
        if st.deleting.contains_key(&key) {
            return Ok(());
        }
        match (policy, st.linger) {
            (PropagationPolicy::Foreground, Linger::For(d)) => {
                st.deleting.insert(key, Some(Instant::now() + d));
            }
            (PropagationPolicy::Foreground, Linger::Forever) => {
                st.deleting.insert(key, None);
            }
            _ => {
                st.objects.remove(&key);
            }
        }
        Ok(())
    }
}

pub const SET_LABEL: &str = r#".metadata.labels.patched = "true""#;
pub const TO_NUMBER: &str = "42";

/// Evaluator understanding a handful of fixed jq programs.
pub struct FakeJq;

#[async_trait]
impl FilterEvaluator for FakeJq {
    async fn evaluate(&self, filter: &str, input: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut doc: Value = serde_json::from_slice(input).map_err(|e| FilterError::Other(e.to_string()))?;
        match filter {
            "." => {}
            SET_LABEL => doc["metadata"]["labels"]["patched"] = json!("true"),
            TO_NUMBER => doc = json!(42),
            _ => {
                return Err(FilterError::Failed {
                    status: "exit status: 3".into(),
                    stderr: format!("jq: error: syntax error, unexpected INVALID_CHARACTER in {filter}"),
                })
            }
        }
        Ok(serde_json::to_vec(&doc).unwrap())
    }
}

pub fn config_map(ns: &str, name: &str, value: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": ns },
        "data": { "k": value },
    })
}
