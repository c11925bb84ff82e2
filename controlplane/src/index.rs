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

//! Index from NamespaceClass name to the bindings that reference it, so a
//! class change only enqueues the bindings that use it.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, PoisonError, RwLock},
};

use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    ResourceExt,
};
use tracing::*;

use crate::crds::NamespaceClassBinding;
use crate::NamespacedName;

/// Looks up the bindings whose `spec.className` equals a class name.
pub trait BindingLookup: Send + Sync {
    fn bindings_referencing(&self, class_name: &str) -> Vec<NamespacedName>;
}

#[derive(Default)]
struct IndexState {
    by_class: HashMap<String, BTreeSet<NamespacedName>>,
    // reverse map so a binding moving to another class leaves its old entry
    class_of: HashMap<NamespacedName, String>,
}

/// Binding index kept current from a binding watch.
#[derive(Clone, Default)]
pub struct BindingIndex {
    state: Arc<RwLock<IndexState>>,
}

impl BindingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, binding: &NamespaceClassBinding) {
        let Some(key) = binding_key(binding) else {
            return;
        };
        let class_name = binding.spec.class_name.clone();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = state.class_of.get(&key).cloned() {
            if previous == class_name {
                return;
            }
            remove_entry(&mut state.by_class, &previous, &key);
        }
        state
            .by_class
            .entry(class_name.clone())
            .or_default()
            .insert(key.clone());
        state.class_of.insert(key, class_name);
    }

    pub fn remove(&self, binding: &NamespaceClassBinding) {
        let Some(key) = binding_key(binding) else {
            return;
        };
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = state.class_of.remove(&key) {
            remove_entry(&mut state.by_class, &previous, &key);
        }
    }

    /// Replaces the whole index, used when the watch relists.
    pub fn rebuild(&self, bindings: &[NamespaceClassBinding]) {
        let fresh = BindingIndex::new();
        for binding in bindings {
            fresh.upsert(binding);
        }
        let fresh = std::mem::take(&mut *fresh.state.write().unwrap_or_else(PoisonError::into_inner));
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    pub fn apply_event(&self, event: &watcher::Event<NamespaceClassBinding>) {
        match event {
            watcher::Event::Applied(binding) => self.upsert(binding),
            watcher::Event::Deleted(binding) => self.remove(binding),
            watcher::Event::Restarted(bindings) => self.rebuild(bindings),
        }
    }

    /// Follows the binding watch, keeping the index current. Watch errors are
    /// retried with backoff, so this only returns if the stream ends.
    pub async fn maintain(self, api: Api<NamespaceClassBinding>) {
        watcher(api, watcher::Config::default())
            .default_backoff()
            .for_each(|event| {
                match event {
                    Ok(event) => self.apply_event(&event),
                    Err(error) => warn!("binding index watch failed: {error}"),
                }
                futures::future::ready(())
            })
            .await;
        info!("binding index watch ended");
    }
}

impl BindingLookup for BindingIndex {
    fn bindings_referencing(&self, class_name: &str) -> Vec<NamespacedName> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .by_class
            .get(class_name)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn binding_key(binding: &NamespaceClassBinding) -> Option<NamespacedName> {
    Some(NamespacedName {
        name: binding.name_any(),
        namespace: binding.namespace()?,
    })
}

fn remove_entry(
    by_class: &mut HashMap<String, BTreeSet<NamespacedName>>,
    class_name: &str,
    key: &NamespacedName,
) {
    if let Some(keys) = by_class.get_mut(class_name) {
        keys.remove(key);
        if keys.is_empty() {
            by_class.remove(class_name);
        }
    }
}
