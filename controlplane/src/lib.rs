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

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use config::Config;
pub use kube_store::KubeStore;
pub use namespace_controller::controller as namespace_controller;
pub use namespaceclassbinding_controller::controller as namespaceclassbinding_controller;

pub mod config;
pub mod consts;
pub mod crds;
pub mod index;
pub mod manifest;
pub mod store;

mod apply_utils;
mod kube_store;
mod namespace_controller;
mod namespaceclassbinding_controller;
mod namespaceclassbinding_utils;
mod traits;
mod utils;

#[cfg(test)]
mod test_utils;

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Dynamic access to the resources materialized into namespaces
    pub resources: Arc<dyn store::ResourceStore>,
    /// Typed access to classes and bindings
    pub bindings: Arc<dyn store::BindingStore>,
    pub config: Config,
    /// Cancelled when the process is shutting down
    pub shutdown: CancellationToken,
}

impl Context {
    pub fn new(store: KubeStore, config: Config, shutdown: CancellationToken) -> Self {
        let store = Arc::new(store);
        Context {
            resources: store.clone(),
            bindings: store,
            config,
            shutdown,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("immutable field: {0}")]
    ImmutableField(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("cannot recreate {0}: not controlled by this binding")]
    NotControllerOwned(String),
    #[error("timed out waiting for {0} to be deleted")]
    DeletionTimeout(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("invalid configuration: `{0}`")]
    InvalidConfigError(String),
    #[error("error querying NamespaceClass CRDs: `{0}`; are the CRDs installed?")]
    CRDNotFoundError(#[source] kube::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[source] serde_json::Error),
}

impl Error {
    /// Sorts an API error into the taxonomy the reconcilers act on.
    pub fn from_kube(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => {
                let message = response.message.to_lowercase();
                if response.code == 404 {
                    Error::NotFound(response.message)
                } else if message.contains("immutable") || message.contains("cannot be modified") {
                    Error::ImmutableField(response.message)
                } else if response.code == 409 {
                    Error::Conflict(response.message)
                } else if matches!(response.code, 400 | 403 | 422) {
                    Error::Rejected(response.message)
                } else {
                    Error::KubeError(kube::Error::Api(response))
                }
            }
            other => Error::KubeError(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Another field manager holds a field we tried to set.
    pub fn is_field_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_immutable_field(&self) -> bool {
        matches!(self, Error::ImmutableField(_))
    }

    /// The pass was abandoned because the process is shutting down. A bounded
    /// wait running out is an ordinary failure and is not included.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}
