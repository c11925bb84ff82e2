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

//! The reconcilers only talk to the cluster through these traits. Errors are
//! already classified (see [`crate::Error::from_kube`]) by the time they come
//! back, so callers can match on `NotFound`, `Conflict` and friends.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;

use crate::crds::{AppliedResource, NamespaceClass, NamespaceClassBinding, NamespaceClassBindingStatus};
use crate::manifest::Manifest;
use crate::Result;

/// Untyped access to the objects a binding materializes.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &AppliedResource) -> Result<Option<Manifest>>;

    /// Server-side apply of `manifest` as `field_manager`. With `force` unset a
    /// field owned by another manager yields `Error::Conflict`.
    async fn apply(&self, manifest: &Manifest, field_manager: &str, force: bool) -> Result<Manifest>;

    /// Deletes the object; `Error::NotFound` if it does not exist.
    async fn delete(&self, namespace: &str, key: &AppliedResource) -> Result<()>;

    /// Deletes the object, treating an absent object as already deleted.
    /// Returns whether anything was deleted.
    async fn delete_if_exists(&self, namespace: &str, key: &AppliedResource) -> Result<bool> {
        match self.delete(namespace, key).await {
            Ok(()) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }
}

/// Typed access to NamespaceClasses and NamespaceClassBindings.
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn get_class(&self, name: &str) -> Result<Option<NamespaceClass>>;

    async fn get_binding(&self, namespace: &str, name: &str) -> Result<Option<NamespaceClassBinding>>;

    async fn create_binding(&self, binding: &NamespaceClassBinding) -> Result<NamespaceClassBinding>;

    /// Replaces the binding, guarded by its resourceVersion.
    async fn replace_binding(&self, binding: &NamespaceClassBinding) -> Result<NamespaceClassBinding>;

    async fn delete_binding(&self, namespace: &str, name: &str) -> Result<()>;

    /// Writes the full status. When `resource_version` is given the write
    /// fails with `Error::Conflict` if the binding changed since it was read.
    async fn patch_binding_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &NamespaceClassBindingStatus,
    ) -> Result<NamespaceClassBinding>;

    /// Publishes a Kubernetes event about `regarding`. Failures are logged,
    /// never returned: events are informational.
    async fn record_event(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    );
}
