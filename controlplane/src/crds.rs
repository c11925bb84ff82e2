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

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::CustomResource;
use schemars::{
    gen::SchemaGenerator,
    schema::{ArrayValidation, InstanceType, Schema, SchemaObject},
    JsonSchema,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// NamespaceClass is a cluster-scoped template: an ordered list of manifests
/// materialized into every namespace labeled with its name.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "akuity.io",
    version = "v1alpha1",
    kind = "NamespaceClass",
    plural = "namespaceclasses",
    shortname = "nsc",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceClassSpec {
    /// Manifests to create in each bound namespace. Each entry needs at least
    /// apiVersion, kind and metadata.name; everything else is passed through.
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_resources")]
    pub resources: Vec<Value>,
}

/// NamespaceClassBinding records which NamespaceClass a namespace uses and
/// what was materialized from it. There is at most one per namespace and it
/// is named after the namespace.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "akuity.io",
    version = "v1alpha1",
    kind = "NamespaceClassBinding",
    plural = "namespaceclassbindings",
    shortname = "ncb",
    namespaced,
    status = "NamespaceClassBindingStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.className"}"#,
    printcolumn = r#"{"name":"Observed","type":"integer","jsonPath":".status.observedClassGeneration"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceClassBindingSpec {
    pub class_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceClassBindingStatus {
    /// Name of the NamespaceClass that was last applied.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub observed_class_name: String,
    /// Generation of the NamespaceClass that was last applied.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub observed_class_generation: i64,
    /// Resources created in the namespace by the last successful reconcile.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_resources: Vec<AppliedResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<metav1::Condition>,
}

/// Identity of a resource applied to a namespace. Two manifests with the same
/// apiVersion, kind and name address the same object.
#[derive(
    Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct AppliedResource {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl AppliedResource {
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        AppliedResource {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for AppliedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.kind, self.name, self.api_version)
    }
}

impl NamespaceClassBinding {
    pub fn status_or_default(&self) -> NamespaceClassBindingStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn applied_resources(&self) -> &[AppliedResource] {
        self.status
            .as_ref()
            .map(|s| s.applied_resources.as_slice())
            .unwrap_or_default()
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

// Resource entries are arbitrary objects; keep every field the user wrote.
fn preserve_unknown_resources(_: &mut SchemaGenerator) -> Schema {
    let mut item = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    item.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        Value::Bool(true),
    );
    let list = SchemaObject {
        instance_type: Some(InstanceType::Array.into()),
        array: Some(Box::new(ArrayValidation {
            items: Some(Schema::Object(item).into()),
            ..Default::default()
        })),
        ..Default::default()
    };
    Schema::Object(list)
}
