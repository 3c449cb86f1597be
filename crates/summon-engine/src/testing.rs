//! In-memory cluster for tests
//!
//! Models what the engine relies on from the API server: resource versions
//! with optimistic concurrency, a status subresource that plain updates
//! cannot touch, finalizer-blocked deletion and 404/409 errors. Writes made
//! through the [`ClusterClient`] interface are logged so tests can assert on
//! write amplification; the direct helpers (`insert`, `set_status`,
//! `modify`) stand in for other actors and are not logged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ApiResource, DynamicObject, ErrorResponse};
use kube::Resource;

use summon_common::{Error, Result};

use crate::client::{api_resource, from_dynamic, to_dynamic, ClusterClient};
use crate::context::ChildObject;

/// Kind of write
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Create
    Create,
    /// Full replace
    Replace,
    /// Status subresource replace
    ReplaceStatus,
    /// Delete
    Delete,
}

/// One logged write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    /// What was done
    pub verb: Verb,
    /// Object kind
    pub kind: String,
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

type StoreKey = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    next_rv: u64,
    next_uid: u64,
    no_status_kinds: HashSet<String>,
    injected_conflicts: HashMap<Verb, u32>,
    writes: Vec<WriteRecord>,
}

impl State {
    fn bump(&mut self, obj: &mut DynamicObject) {
        self.next_rv += 1;
        obj.metadata.resource_version = Some(self.next_rv.to_string());
    }

    fn stamp_new(&mut self, obj: &mut DynamicObject) {
        self.next_uid += 1;
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}", self.next_uid));
        }
        if obj.metadata.creation_timestamp.is_none() {
            obj.metadata.creation_timestamp = Some(Time(Utc::now()));
        }
        self.bump(obj);
    }

    fn take_injected(&mut self, verb: Verb) -> bool {
        match self.injected_conflicts.get_mut(&verb) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn log(&mut self, verb: Verb, ar: &ApiResource, namespace: &str, name: &str) {
        self.writes.push(WriteRecord {
            verb,
            kind: ar.kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
}

/// In-memory [`ClusterClient`]
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

fn key(ar: &ApiResource, namespace: &str, name: &str) -> StoreKey {
    (
        format!("{}/{}", ar.group, ar.kind),
        namespace.to_string(),
        name.to_string(),
    )
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube {
        source: kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message,
            reason: reason.to_string(),
            code,
        }),
    }
}

fn conflict(name: &str) -> Error {
    api_error(
        409,
        "Conflict",
        format!(
            "Operation cannot be fulfilled on \"{}\": {}",
            name,
            summon_common::error::OBJECT_MODIFIED_MESSAGE
        ),
    )
}

fn not_found(ar: &ApiResource, name: &str) -> Error {
    api_error(404, "NotFound", format!("{} \"{}\" not found", ar.plural, name))
}

fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term.trim()),
        })
}

fn ident(obj: &DynamicObject) -> (String, String) {
    (
        obj.metadata.namespace.clone().unwrap_or_default(),
        obj.metadata.name.clone().unwrap_or_default(),
    )
}

impl MemoryCluster {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Treat `kind` as having no status subresource: status writes 404
    /// and full updates carry status
    pub fn without_status_subresource(&self, kind: &str) {
        self.state().no_status_kinds.insert(kind.to_string());
    }

    /// Fail the next `times` writes of `verb` with a 409
    pub fn inject_conflicts(&self, verb: Verb, times: u32) {
        self.state().injected_conflicts.insert(verb, times);
    }

    /// Store an object as another actor would, status included
    pub fn insert<K: ChildObject>(&self, obj: &K) -> K {
        let ar = api_resource::<K>();
        let mut dynamic = match to_dynamic(obj) {
            Ok(d) => d,
            Err(e) => panic!("cannot convert {}: {e}", K::kind(&())),
        };
        let mut state = self.state();
        state.stamp_new(&mut dynamic);
        let (ns, name) = ident(&dynamic);
        state.objects.insert(key(&ar, &ns, &name), dynamic.clone());
        drop(state);
        from_dynamic(dynamic).unwrap_or_else(|e| panic!("cannot convert back: {e}"))
    }

    /// Typed read
    pub fn fetch<K: ChildObject>(&self, namespace: &str, name: &str) -> Option<K> {
        let ar = api_resource::<K>();
        let obj = self.state().objects.get(&key(&ar, namespace, name)).cloned()?;
        from_dynamic(obj).ok()
    }

    /// Typed list in one namespace
    pub fn list_of<K: ChildObject>(&self, namespace: &str) -> Vec<K> {
        let ar = api_resource::<K>();
        let kind = format!("{}/{}", ar.group, ar.kind);
        self.state()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter_map(|(_, obj)| from_dynamic(obj.clone()).ok())
            .collect()
    }

    /// Overwrite an object's status as its own controller would
    pub fn set_status<K: ChildObject>(&self, namespace: &str, name: &str, status: serde_json::Value) {
        let ar = api_resource::<K>();
        let mut state = self.state();
        let mut obj = match state.objects.get(&key(&ar, namespace, name)) {
            Some(obj) => obj.clone(),
            None => panic!("{} {namespace}/{name} does not exist", ar.kind),
        };
        if let Some(map) = obj.data.as_object_mut() {
            map.insert("status".to_string(), status);
        }
        state.bump(&mut obj);
        state.objects.insert(key(&ar, namespace, name), obj);
    }

    /// Edit an object as an external actor would
    pub fn modify<K: ChildObject>(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        let mut typed: K = match self.fetch(namespace, name) {
            Some(t) => t,
            None => panic!("{} {namespace}/{name} does not exist", K::kind(&())),
        };
        f(&mut typed);
        let ar = api_resource::<K>();
        let mut dynamic = match to_dynamic(&typed) {
            Ok(d) => d,
            Err(e) => panic!("cannot convert: {e}"),
        };
        let mut state = self.state();
        state.bump(&mut dynamic);
        state.objects.insert(key(&ar, namespace, name), dynamic);
    }

    /// Remove an object outright, ignoring finalizers
    pub fn remove<K: ChildObject>(&self, namespace: &str, name: &str) {
        let ar = api_resource::<K>();
        self.state().objects.remove(&key(&ar, namespace, name));
    }

    /// Every logged write
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state().writes.clone()
    }

    /// Number of logged writes
    pub fn write_count(&self) -> usize {
        self.state().writes.len()
    }

    /// Logged writes touching `kind`
    pub fn writes_for(&self, kind: &str) -> Vec<WriteRecord> {
        self.state()
            .writes
            .iter()
            .filter(|w| w.kind == kind)
            .cloned()
            .collect()
    }

    /// Forget the write log
    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.state().objects.get(&key(ar, namespace, name)).cloned())
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let kind = format!("{}/{}", ar.group, ar.kind);
        Ok(self
            .state()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (namespace.is_empty() || ns == namespace))
            .map(|(_, obj)| obj.clone())
            .filter(|obj| matches_selector(obj, label_selector))
            .collect())
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let (ns, name) = ident(obj);
        let mut state = self.state();
        if state.take_injected(Verb::Create) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", ar.plural, name),
            ));
        }
        let k = key(ar, &ns, &name);
        if state.objects.contains_key(&k) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", ar.plural, name),
            ));
        }
        let mut stored = obj.clone();
        if !state.no_status_kinds.contains(&ar.kind) {
            if let Some(map) = stored.data.as_object_mut() {
                map.remove("status");
            }
        }
        stored.metadata.uid = None;
        stored.metadata.resource_version = None;
        state.stamp_new(&mut stored);
        state.objects.insert(k, stored.clone());
        state.log(Verb::Create, ar, &ns, &name);
        Ok(stored)
    }

    async fn replace(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let (ns, name) = ident(obj);
        let mut state = self.state();
        let k = key(ar, &ns, &name);
        let Some(current) = state.objects.get(&k).cloned() else {
            return Err(not_found(ar, &name));
        };
        if state.take_injected(Verb::Replace) {
            return Err(conflict(&name));
        }
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != current.metadata.resource_version
        {
            return Err(conflict(&name));
        }
        let mut stored = obj.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        stored.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        if !state.no_status_kinds.contains(&ar.kind) {
            if let Some(map) = stored.data.as_object_mut() {
                match current.data.get("status") {
                    Some(status) => map.insert("status".to_string(), status.clone()),
                    None => map.remove("status"),
                };
            }
        }
        state.bump(&mut stored);
        state.log(Verb::Replace, ar, &ns, &name);

        let finalized = stored.metadata.deletion_timestamp.is_some()
            && stored
                .metadata
                .finalizers
                .as_ref()
                .map(Vec::is_empty)
                .unwrap_or(true);
        if finalized {
            state.objects.remove(&k);
        } else {
            state.objects.insert(k, stored.clone());
        }
        Ok(stored)
    }

    async fn replace_status(
        &self,
        ar: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let (ns, name) = ident(obj);
        let mut state = self.state();
        let k = key(ar, &ns, &name);
        if state.no_status_kinds.contains(&ar.kind) {
            return Err(not_found(ar, &name));
        }
        let Some(mut stored) = state.objects.get(&k).cloned() else {
            return Err(not_found(ar, &name));
        };
        if state.take_injected(Verb::ReplaceStatus) {
            return Err(conflict(&name));
        }
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != stored.metadata.resource_version
        {
            return Err(conflict(&name));
        }
        if let Some(map) = stored.data.as_object_mut() {
            match obj.data.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }
        state.bump(&mut stored);
        state.objects.insert(k, stored.clone());
        state.log(Verb::ReplaceStatus, ar, &ns, &name);
        Ok(stored)
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        let k = key(ar, namespace, name);
        let Some(mut current) = state.objects.get(&k).cloned() else {
            return Ok(());
        };
        state.log(Verb::Delete, ar, namespace, name);
        let has_finalizers = current
            .metadata
            .finalizers
            .as_ref()
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if has_finalizers {
            if current.metadata.deletion_timestamp.is_none() {
                current.metadata.deletion_timestamp = Some(Time(Utc::now()));
                state.bump(&mut current);
                state.objects.insert(k, current);
            }
        } else {
            state.objects.remove(&k);
        }
        Ok(())
    }
}

/// Typed view of a resource kind's coordinates, for tests that build
/// untyped objects
pub fn resource_of<K: Resource<DynamicType = ()>>() -> ApiResource {
    api_resource::<K>()
}
