/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! In-memory stand-ins for the API server used by the controller tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ObjectReference};
use kube::{api::ObjectMeta, runtime::events::EventType};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::crds::{
    AppliedResource, NamespaceClass, NamespaceClassBinding, NamespaceClassBindingSpec,
    NamespaceClassBindingStatus, NamespaceClassSpec,
};
use crate::index::BindingLookup;
use crate::manifest::Manifest;
use crate::store::{BindingStore, ResourceStore};
use crate::{Config, Context, Error, NamespacedName, Result};

// Top-level fields that are not user data and never conflict.
const RESERVED_FIELDS: [&str; 4] = ["apiVersion", "kind", "metadata", "status"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeOp {
    Get,
    Apply,
    ForceApply,
    Delete,
    GetClass,
    GetBinding,
    CreateBinding,
    ReplaceBinding,
    DeleteBinding,
    PatchStatus,
}

#[derive(Clone, Debug)]
pub struct FakeObject {
    pub manifest: Manifest,
    pub field_managers: BTreeMap<String, String>,
    pub immutable: BTreeSet<String>,
    pub resource_version: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub regarding: String,
    pub warning: bool,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
struct FakeState {
    classes: BTreeMap<String, NamespaceClass>,
    bindings: BTreeMap<(String, String), NamespaceClassBinding>,
    objects: BTreeMap<(String, AppliedResource), FakeObject>,
    // deletes of these are accepted but the object lingers, like a finalizer
    lingering: BTreeSet<(String, AppliedResource)>,
    // removed by someone else just before the next read of them
    vanishing: BTreeSet<(String, AppliedResource)>,
    failures: Vec<(FakeOp, Error)>,
    events: Vec<RecordedEvent>,
    writes: usize,
    status_writes: usize,
    next_version: u64,
}

impl FakeState {
    fn take_failure(&mut self, op: FakeOp) -> Result<()> {
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(i) => Err(self.failures.remove(i).1),
            None => Ok(()),
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    // Removes every object whose owner references point at `uid`.
    fn cascade(&mut self, uid: &str) {
        self.objects.retain(|_, obj| {
            !obj.manifest
                .owner_references()
                .iter()
                .any(|r| r.uid == uid)
        });
    }
}

/// Fake API server implementing both store traits.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<FakeState>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_class(&self, class: NamespaceClass) {
        let mut state = self.state.lock().unwrap();
        state.classes.insert(class.metadata.name.clone().unwrap(), class);
    }

    pub fn remove_class(&self, name: &str) {
        self.state.lock().unwrap().classes.remove(name);
    }

    pub fn insert_binding(&self, mut binding: NamespaceClassBinding) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        binding.metadata.resource_version = Some(version.to_string());
        let key = (
            binding.metadata.namespace.clone().unwrap(),
            binding.metadata.name.clone().unwrap(),
        );
        state.bindings.insert(key, binding);
    }

    pub fn binding(&self, namespace: &str, name: &str) -> Option<NamespaceClassBinding> {
        let state = self.state.lock().unwrap();
        state
            .bindings
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Seeds an object as if `manager` had applied it.
    pub fn insert_object(&self, namespace: &str, manifest: Value, manager: &str, immutable: &[&str]) {
        let mut manifest = Manifest::from_value(&manifest).unwrap().unwrap();
        manifest.set_namespace(namespace);
        let key = manifest.key().unwrap();
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let field_managers = data_fields(&manifest)
            .into_iter()
            .map(|f| (f, manager.to_string()))
            .collect();
        state.objects.insert(
            (namespace.to_string(), key),
            FakeObject {
                manifest,
                field_managers,
                immutable: immutable.iter().map(|f| f.to_string()).collect(),
                resource_version: version,
            },
        );
    }

    pub fn object(&self, namespace: &str, key: &AppliedResource) -> Option<FakeObject> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&(namespace.to_string(), key.clone()))
            .cloned()
    }

    pub fn object_keys(&self, namespace: &str) -> Vec<AppliedResource> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn linger_on_delete(&self, namespace: &str, key: &AppliedResource) {
        let mut state = self.state.lock().unwrap();
        state.lingering.insert((namespace.to_string(), key.clone()));
    }

    /// Marks `field` of a stored object as immutable.
    pub fn mark_immutable(&self, namespace: &str, key: &AppliedResource, field: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(obj) = state.objects.get_mut(&(namespace.to_string(), key.clone())) {
            obj.immutable.insert(field.to_string());
        }
    }

    /// Deletes the object behind the caller's back right before its next read.
    pub fn vanish_before_next_get(&self, namespace: &str, key: &AppliedResource) {
        let mut state = self.state.lock().unwrap();
        state.vanishing.insert((namespace.to_string(), key.clone()));
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: FakeOp, error: Error) {
        self.state.lock().unwrap().failures.push((op, error));
    }

    /// Object writes (creates, changing applies, deletes) so far.
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn get(&self, namespace: &str, key: &AppliedResource) -> Result<Option<Manifest>> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(FakeOp::Get)?;
        let object_key = (namespace.to_string(), key.clone());
        if state.vanishing.remove(&object_key) {
            state.objects.remove(&object_key);
        }
        Ok(state
            .objects
            .get(&(namespace.to_string(), key.clone()))
            .map(|o| o.manifest.clone()))
    }

    async fn apply(&self, manifest: &Manifest, field_manager: &str, force: bool) -> Result<Manifest> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(if force { FakeOp::ForceApply } else { FakeOp::Apply })?;

        let key = manifest
            .key()
            .ok_or_else(|| Error::InvalidManifest("missing identity".to_string()))?;
        let namespace = manifest
            .namespace()
            .ok_or_else(|| Error::InvalidManifest("missing namespace".to_string()))?
            .to_string();
        let object_key = (namespace, key.clone());

        let Some(existing) = state.objects.get(&object_key).cloned() else {
            let version = state.bump();
            state.writes += 1;
            let field_managers = data_fields(manifest)
                .into_iter()
                .map(|f| (f, field_manager.to_string()))
                .collect();
            state.objects.insert(
                object_key,
                FakeObject {
                    manifest: manifest.clone(),
                    field_managers,
                    immutable: BTreeSet::new(),
                    resource_version: version,
                },
            );
            return Ok(manifest.clone());
        };

        for field in data_fields(manifest) {
            let desired = manifest.field(&field);
            let current = existing.manifest.field(&field);
            if current.is_none() || current == desired {
                continue;
            }
            if existing.immutable.contains(&field) {
                return Err(Error::ImmutableField(format!(
                    "{} {}: {field}: field is immutable",
                    key.kind, key.name
                )));
            }
            let owner = existing.field_managers.get(&field);
            if !force && owner.is_some_and(|m| m != field_manager) {
                return Err(Error::Conflict(format!(
                    "Apply failed with 1 conflict: conflict with \"{}\": .{field}",
                    owner.cloned().unwrap_or_default()
                )));
            }
        }

        let mut merged = existing.clone();
        for field in data_fields(manifest) {
            if let Some(value) = manifest.field(&field) {
                merged.manifest.set_field(&field, value.clone());
            }
            merged.field_managers.insert(field, field_manager.to_string());
        }
        let mut metadata = existing
            .manifest
            .field("metadata")
            .cloned()
            .unwrap_or_else(|| json!({}));
        if let (Some(target), Some(Value::Object(incoming))) =
            (metadata.as_object_mut(), manifest.field("metadata"))
        {
            for (k, v) in incoming {
                target.insert(k.clone(), v.clone());
            }
        }
        merged.manifest.set_field("metadata", metadata);

        if merged.manifest != existing.manifest || merged.field_managers != existing.field_managers {
            if merged.manifest != existing.manifest {
                state.writes += 1;
                merged.resource_version = state.bump();
            }
            state.objects.insert(object_key, merged.clone());
        }
        Ok(merged.manifest)
    }

    async fn delete(&self, namespace: &str, key: &AppliedResource) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(FakeOp::Delete)?;
        let object_key = (namespace.to_string(), key.clone());
        if !state.objects.contains_key(&object_key) {
            return Err(Error::NotFound(format!("{key} not found")));
        }
        state.writes += 1;
        if !state.lingering.contains(&object_key) {
            state.objects.remove(&object_key);
        }
        Ok(())
    }
}

#[async_trait]
impl BindingStore for FakeStore {
    async fn get_class(&self, name: &str) -> Result<Option<NamespaceClass>> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(FakeOp::GetClass)?;
        Ok(state.classes.get(name).cloned())
    }

    async fn get_binding(&self, namespace: &str, name: &str) -> Result<Option<NamespaceClassBinding>> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(FakeOp::GetBinding)?;
        Ok(state
            .bindings
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_binding(&self, binding: &NamespaceClassBinding) -> Result<NamespaceClassBinding> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(FakeOp::CreateBinding)?;
        let namespace = binding.metadata.namespace.clone().unwrap_or_default();
        let name = binding.metadata.name.clone().unwrap_or_default();
        let key = (namespace.clone(), name.clone());
        if state.bindings.contains_key(&key) {
            return Err(Error::Conflict(format!("namespaceclassbindings \"{name}\" already exists")));
        }
        let mut created = binding.clone();
        created.metadata.uid = Some(format!("uid-{namespace}-{name}"));
        created.metadata.generation = Some(1);
        created.metadata.resource_version = Some(state.bump().to_string());
        state.bindings.insert(key, created.clone());
        Ok(created)
    }

    async fn replace_binding(&self, binding: &NamespaceClassBinding) -> Result<NamespaceClassBinding> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(FakeOp::ReplaceBinding)?;
        let key = (
            binding.metadata.namespace.clone().unwrap_or_default(),
            binding.metadata.name.clone().unwrap_or_default(),
        );
        let current = state
            .bindings
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("binding {} not found", key.1)))?;
        if binding.metadata.resource_version != current.metadata.resource_version {
            return Err(Error::Conflict("the object has been modified".to_string()));
        }
        let mut replaced = current.clone();
        if replaced.spec != binding.spec {
            replaced.spec = binding.spec.clone();
            replaced.metadata.generation = Some(current.metadata.generation.unwrap_or(1) + 1);
        }
        replaced.metadata.resource_version = Some(state.bump().to_string());
        state.bindings.insert(key, replaced.clone());
        Ok(replaced)
    }

    async fn delete_binding(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(FakeOp::DeleteBinding)?;
        let removed = state
            .bindings
            .remove(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("binding {name} not found")))?;
        if let Some(uid) = removed.metadata.uid.as_deref() {
            state.cascade(uid);
        }
        Ok(())
    }

    async fn patch_binding_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &NamespaceClassBindingStatus,
    ) -> Result<NamespaceClassBinding> {
        let mut state = self.state.lock().unwrap();
        state.take_failure(FakeOp::PatchStatus)?;
        let version = state.bump().to_string();
        let binding = state
            .bindings
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("binding {name} not found")))?;
        if resource_version.is_some() && resource_version != binding.metadata.resource_version.as_deref() {
            return Err(Error::Conflict("the object has been modified".to_string()));
        }
        binding.status = Some(status.clone());
        binding.metadata.resource_version = Some(version);
        let updated = binding.clone();
        state.status_writes += 1;
        Ok(updated)
    }

    async fn record_event(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        self.state.lock().unwrap().events.push(RecordedEvent {
            regarding: regarding.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

fn data_fields(manifest: &Manifest) -> Vec<String> {
    match manifest.as_value() {
        Value::Object(fields) => fields
            .keys()
            .filter(|k| !RESERVED_FIELDS.contains(&k.as_str()))
            .cloned()
            .collect(),
        _ => vec![],
    }
}

/// Binding lookup backed by a fixed table.
#[derive(Default)]
pub struct FixedLookup(pub BTreeMap<String, Vec<NamespacedName>>);

impl BindingLookup for FixedLookup {
    fn bindings_referencing(&self, class_name: &str) -> Vec<NamespacedName> {
        self.0.get(class_name).cloned().unwrap_or_default()
    }
}

pub fn test_config() -> Config {
    Config {
        deletion_timeout_secs: 1,
        deletion_poll_interval_ms: 10,
        ..Config::default()
    }
}

pub fn test_context(store: &Arc<FakeStore>) -> Arc<Context> {
    Arc::new(Context {
        resources: store.clone(),
        bindings: store.clone(),
        config: test_config(),
        shutdown: CancellationToken::new(),
    })
}

pub fn binding(namespace: &str, class_name: &str) -> NamespaceClassBinding {
    let mut binding = NamespaceClassBinding::new(
        namespace,
        NamespaceClassBindingSpec {
            class_name: class_name.to_string(),
        },
    );
    binding.metadata.namespace = Some(namespace.to_string());
    binding.metadata.uid = Some(format!("uid-{namespace}"));
    binding.metadata.generation = Some(1);
    binding
}

pub fn binding_with_status(
    namespace: &str,
    class_name: &str,
    status: NamespaceClassBindingStatus,
) -> NamespaceClassBinding {
    let mut binding = binding(namespace, class_name);
    binding.status = Some(status);
    binding
}

pub fn class(name: &str, generation: i64, resources: Vec<Value>) -> NamespaceClass {
    let mut class = NamespaceClass::new(name, NamespaceClassSpec { resources });
    class.metadata.generation = Some(generation);
    class
}

pub fn config_map(name: &str, data: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name},
        "data": data,
    })
}

pub fn cm_key(name: &str) -> AppliedResource {
    AppliedResource::new("v1", "ConfigMap", name)
}

pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("ns-uid-{name}")),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}
