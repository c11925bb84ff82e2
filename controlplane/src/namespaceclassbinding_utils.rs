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

use std::collections::HashSet;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::*;

use crate::apply_utils::upsert;
use crate::consts::STATUS_UPDATE_ATTEMPTS;
use crate::crds::{AppliedResource, NamespaceClass, NamespaceClassBinding, NamespaceClassBindingStatus};
use crate::manifest::Manifest;
use crate::{Context, Error, Result};

/// A single resource that could not be pruned or applied.
#[derive(Debug)]
pub struct ResourceFailure {
    pub resource: String,
    pub error: Error,
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

// The binding has already materialized another class: everything it applied
// must go before the new class is laid down.
pub fn is_class_switch(binding: &NamespaceClassBinding, class: &NamespaceClass) -> bool {
    binding.status.as_ref().is_some_and(|status| {
        !status.observed_class_name.is_empty()
            && !status.applied_resources.is_empty()
            && status.observed_class_name != class.name_any()
    })
}

/// False when the binding already reflects this exact class generation.
pub fn needs_update(binding: &NamespaceClassBinding, class: &NamespaceClass) -> bool {
    let Some(status) = binding.status.as_ref() else {
        return true;
    };
    status.observed_class_name != class.name_any()
        || status.observed_class_generation != class.metadata.generation.unwrap_or_default()
}

/// Keys of every well-formed entry in the class. Malformed entries are left
/// for the apply step to report.
pub fn desired_keys(class: &NamespaceClass) -> HashSet<AppliedResource> {
    class
        .spec
        .resources
        .iter()
        .filter_map(|value| Manifest::from_value(value).ok().flatten())
        .filter_map(|manifest| manifest.key())
        .collect()
}

/// Previously applied resources that have to be deleted before applying.
pub fn stale_resources(
    binding: &NamespaceClassBinding,
    desired: &HashSet<AppliedResource>,
    switch: bool,
) -> Vec<AppliedResource> {
    binding
        .applied_resources()
        .iter()
        .filter(|key| switch || !desired.contains(*key))
        .cloned()
        .collect()
}

pub async fn prune_resources(
    ctx: &Context,
    namespace: &str,
    stale: &[AppliedResource],
) -> std::result::Result<(), ResourceFailure> {
    for key in stale {
        match ctx.resources.delete_if_exists(namespace, key).await {
            Ok(true) => info!(namespace, %key, "pruned resource"),
            Ok(false) => debug!(namespace, %key, "resource already gone"),
            Err(error) => {
                return Err(ResourceFailure {
                    resource: key.to_string(),
                    error,
                })
            }
        }
    }
    Ok(())
}

// Applies the class entries in order and returns the keys applied, each key
// once at the position it first appeared. Stops at the first failure.
pub async fn apply_resources(
    ctx: &Context,
    binding: &NamespaceClassBinding,
    class: &NamespaceClass,
) -> std::result::Result<Vec<AppliedResource>, ResourceFailure> {
    let namespace = binding.metadata.namespace.as_deref().unwrap_or_default();
    let owner = owner_reference(binding).map_err(|error| ResourceFailure {
        resource: format!("{}/{}", namespace, binding.name_any()),
        error,
    })?;

    let mut applied: Vec<AppliedResource> = Vec::new();
    for (i, value) in class.spec.resources.iter().enumerate() {
        let failure = |error| ResourceFailure {
            resource: format!("resources[{i}]"),
            error,
        };
        let Some(mut manifest) = Manifest::from_value(value).map_err(failure)? else {
            debug!(class = %class.name_any(), index = i, "skipping resource without identity");
            continue;
        };
        let Some(key) = manifest.key() else {
            continue;
        };

        manifest.set_namespace(namespace);
        manifest
            .set_controller_owner(owner.clone())
            .map_err(|error| ResourceFailure {
                resource: key.to_string(),
                error,
            })?;

        upsert(ctx, &manifest, &owner)
            .await
            .map_err(|error| ResourceFailure {
                resource: key.to_string(),
                error,
            })?;
        debug!(namespace, %key, "applied resource");

        if !applied.contains(&key) {
            applied.push(key);
        }
    }
    Ok(applied)
}

pub fn owner_reference(binding: &NamespaceClassBinding) -> Result<OwnerReference> {
    binding.controller_owner_ref(&()).ok_or_else(|| {
        Error::InvalidConfigError(format!("binding {} has no uid", binding.name_any()))
    })
}

// Read-modify-write of the binding status. The mutation runs against a fresh
// read on every attempt and nothing is written when it leaves the status
// unchanged. Returns the latest binding, or None once the binding is gone.
pub async fn update_status<F>(
    ctx: &Context,
    namespace: &str,
    name: &str,
    mut mutate: F,
) -> Result<Option<NamespaceClassBinding>>
where
    F: FnMut(&mut NamespaceClassBindingStatus),
{
    for attempt in 1..=STATUS_UPDATE_ATTEMPTS {
        let Some(current) = ctx.bindings.get_binding(namespace, name).await? else {
            return Ok(None);
        };
        let before = current.status_or_default();
        let mut status = before.clone();
        mutate(&mut status);
        if status == before {
            return Ok(Some(current));
        }

        match ctx
            .bindings
            .patch_binding_status(namespace, name, current.metadata.resource_version.as_deref(), &status)
            .await
        {
            Ok(updated) => return Ok(Some(updated)),
            Err(e) if e.is_field_conflict() => {
                debug!(namespace, name, attempt, "status update conflicted, retrying");
            }
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(format!(
        "status of binding {namespace}/{name} kept changing after {STATUS_UPDATE_ATTEMPTS} attempts"
    )))
}
