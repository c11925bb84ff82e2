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

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    core::GroupVersionKind,
    discovery::{self, ApiResource},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use crate::crds::{AppliedResource, NamespaceClass, NamespaceClassBinding, NamespaceClassBindingStatus};
use crate::manifest::Manifest;
use crate::store::{BindingStore, ResourceStore};
use crate::{Error, Result};

/// Store implementation backed by the Kubernetes API server.
pub struct KubeStore {
    client: Client,
    reporter: Reporter,
    field_manager: String,
    // apiVersion + kind -> discovered resource
    api_resources: RwLock<HashMap<(String, String), ApiResource>>,
}

impl KubeStore {
    pub fn new(client: Client, controller_name: &str, field_manager: &str) -> Self {
        KubeStore {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
            field_manager: field_manager.to_string(),
            api_resources: RwLock::new(HashMap::new()),
        }
    }

    // Resolves the plural resource name for apiVersion/kind through discovery,
    // caching the answer since it only changes when CRDs are reinstalled.
    async fn api_resource(&self, api_version: &str, kind: &str) -> Result<ApiResource> {
        let cache_key = (api_version.to_string(), kind.to_string());
        if let Some(ar) = self.api_resources.read().await.get(&cache_key) {
            return Ok(ar.clone());
        }

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (ar, _caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| match e {
                kube::Error::Discovery(_) => {
                    Error::Rejected(format!("unknown resource type {kind} in {api_version}"))
                }
                other => Error::from_kube(other),
            })?;
        debug!(api_version, kind, plural = %ar.plural, "discovered api resource");

        self.api_resources
            .write()
            .await
            .insert(cache_key, ar.clone());
        Ok(ar)
    }

    async fn dynamic_api(&self, namespace: &str, api_version: &str, kind: &str) -> Result<Api<DynamicObject>> {
        let ar = self.api_resource(api_version, kind).await?;
        Ok(Api::namespaced_with(self.client.clone(), namespace, &ar))
    }

    fn bindings_api(&self, namespace: &str) -> Api<NamespaceClassBinding> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, namespace: &str, key: &AppliedResource) -> Result<Option<Manifest>> {
        let api = self.dynamic_api(namespace, &key.api_version, &key.kind).await?;
        let obj = api.get_opt(&key.name).await.map_err(Error::from_kube)?;
        obj.as_ref().map(to_manifest).transpose()
    }

    async fn apply(&self, manifest: &Manifest, field_manager: &str, force: bool) -> Result<Manifest> {
        let key = manifest
            .key()
            .ok_or_else(|| Error::InvalidManifest("manifest has no apiVersion, kind or name".to_string()))?;
        let namespace = manifest
            .namespace()
            .ok_or_else(|| Error::InvalidManifest(format!("{key} has no namespace")))?;

        let api = self.dynamic_api(namespace, &key.api_version, &key.kind).await?;
        let mut params = PatchParams::apply(field_manager);
        if force {
            params = params.force();
        }
        let applied = api
            .patch(&key.name, &params, &Patch::Apply(manifest.as_value()))
            .await
            .map_err(Error::from_kube)?;
        to_manifest(&applied)
    }

    async fn delete(&self, namespace: &str, key: &AppliedResource) -> Result<()> {
        let api = self.dynamic_api(namespace, &key.api_version, &key.kind).await?;
        api.delete(&key.name, &DeleteParams::background())
            .await
            .map_err(Error::from_kube)?;
        Ok(())
    }
}

#[async_trait]
impl BindingStore for KubeStore {
    async fn get_class(&self, name: &str) -> Result<Option<NamespaceClass>> {
        Api::<NamespaceClass>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(Error::from_kube)
    }

    async fn get_binding(&self, namespace: &str, name: &str) -> Result<Option<NamespaceClassBinding>> {
        self.bindings_api(namespace)
            .get_opt(name)
            .await
            .map_err(Error::from_kube)
    }

    async fn create_binding(&self, binding: &NamespaceClassBinding) -> Result<NamespaceClassBinding> {
        let namespace = binding
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::InvalidConfigError("binding has no namespace".to_string()))?;
        self.bindings_api(namespace)
            .create(&self.post_params(), binding)
            .await
            .map_err(Error::from_kube)
    }

    async fn replace_binding(&self, binding: &NamespaceClassBinding) -> Result<NamespaceClassBinding> {
        let namespace = binding
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::InvalidConfigError("binding has no namespace".to_string()))?;
        let name = binding
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::InvalidConfigError("binding has no name".to_string()))?;
        self.bindings_api(namespace)
            .replace(name, &self.post_params(), binding)
            .await
            .map_err(Error::from_kube)
    }

    async fn delete_binding(&self, namespace: &str, name: &str) -> Result<()> {
        self.bindings_api(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(Error::from_kube)?;
        Ok(())
    }

    async fn patch_binding_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &NamespaceClassBindingStatus,
    ) -> Result<NamespaceClassBinding> {
        // Every field is written explicitly so that emptied lists are cleared by
        // the merge patch rather than left behind.
        let mut patch = json!({
            "status": {
                "observedClassName": status.observed_class_name,
                "observedClassGeneration": status.observed_class_generation,
                "appliedResources": status.applied_resources,
                "conditions": status.conditions,
            }
        });
        if let Some(rv) = resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.bindings_api(namespace)
            .patch_status(name, &params, &Patch::Merge(&patch))
            .await
            .map_err(Error::from_kube)
    }

    async fn record_event(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(error) = recorder.publish(event).await {
            warn!(reason, "failed to publish event: {error}");
        }
    }
}

fn to_manifest<T: Serialize>(obj: &T) -> Result<Manifest> {
    let value = serde_json::to_value(obj).map_err(Error::SerializationError)?;
    serde_json::from_value(value).map_err(Error::SerializationError)
}
