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

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crds::AppliedResource;
use crate::{Error, Result};

/// An arbitrary Kubernetes object as written in a NamespaceClass. Only the
/// identity fields and a handful of metadata fields are interpreted; the rest
/// is passed to the API server untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Map<String, Value>);

impl Manifest {
    /// Parses one entry of a NamespaceClass resource list.
    ///
    /// Returns `Ok(None)` for entries without apiVersion, kind or
    /// metadata.name; those are skipped rather than treated as errors. An
    /// entry that is not an object at all cannot be a manifest and is an
    /// error.
    pub fn from_value(value: &Value) -> Result<Option<Self>> {
        match value {
            Value::Object(fields) => {
                let manifest = Manifest(fields.clone());
                if manifest.key().is_none() {
                    return Ok(None);
                }
                Ok(Some(manifest))
            }
            Value::Null => Ok(None),
            other => Err(Error::InvalidManifest(format!(
                "expected an object, found {}",
                type_name(other)
            ))),
        }
    }

    pub fn api_version(&self) -> Option<&str> {
        non_empty(self.0.get("apiVersion"))
    }

    pub fn kind(&self) -> Option<&str> {
        non_empty(self.0.get("kind"))
    }

    pub fn name(&self) -> Option<&str> {
        non_empty(self.metadata().and_then(|m| m.get("name")))
    }

    pub fn namespace(&self) -> Option<&str> {
        non_empty(self.metadata().and_then(|m| m.get("namespace")))
    }

    /// The (apiVersion, kind, name) identity, if all three are present.
    pub fn key(&self) -> Option<AppliedResource> {
        Some(AppliedResource::new(
            self.api_version()?,
            self.kind()?,
            self.name()?,
        ))
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set_field(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".to_string(), Value::String(namespace.to_string()));
    }

    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.metadata()
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|refs| serde_json::from_value(refs.clone()).ok())
            .unwrap_or_default()
    }

    /// Makes `owner` the controller of this object, replacing any other
    /// controller reference and keeping non-controller owners.
    pub fn set_controller_owner(&mut self, owner: OwnerReference) -> Result<()> {
        let mut refs: Vec<OwnerReference> = self
            .owner_references()
            .into_iter()
            .filter(|r| r.controller != Some(true) && r.uid != owner.uid)
            .collect();
        refs.push(owner);
        let refs = serde_json::to_value(refs).map_err(Error::SerializationError)?;
        self.metadata_mut().insert("ownerReferences".to_string(), refs);
        Ok(())
    }

    /// True if `owner` is recorded as this object's controller.
    pub fn is_controlled_by(&self, owner: &OwnerReference) -> bool {
        self.owner_references().iter().any(|r| {
            r.controller == Some(true)
                && r.api_version == owner.api_version
                && r.kind == owner.kind
                && r.name == owner.name
                && r.uid == owner.uid
        })
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    fn metadata(&self) -> Option<&Map<String, Value>> {
        self.0.get("metadata").and_then(Value::as_object)
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let metadata = self
            .0
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        match metadata {
            Value::Object(fields) => fields,
            _ => unreachable!("metadata was just replaced with an object"),
        }
    }
}

fn non_empty(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
