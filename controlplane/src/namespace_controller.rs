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

use futures::StreamExt;
use std::{ops::Sub, sync::Arc, time::Instant};

use crate::*;
use consts::*;
use crds::{NamespaceClassBinding, NamespaceClassBindingSpec};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, ListParams},
    runtime::{controller, controller::Action, events::EventType, watcher, Controller},
    Client, Resource, ResourceExt,
};

use tracing::*;

/// What has to happen to a namespace's binding given its class label.
#[derive(Debug, PartialEq, Eq)]
pub enum BindingChange {
    None,
    Create { class: String },
    Update { from: String, to: String },
    Delete { class: String },
}

pub fn plan_binding_change(desired: Option<&str>, existing: Option<&NamespaceClassBinding>) -> BindingChange {
    let desired = desired.filter(|class| !class.is_empty());
    match (desired, existing) {
        (None, None) => BindingChange::None,
        (None, Some(binding)) => BindingChange::Delete {
            class: binding.spec.class_name.clone(),
        },
        (Some(class), None) => BindingChange::Create {
            class: class.to_string(),
        },
        (Some(class), Some(binding)) if binding.spec.class_name == class => BindingChange::None,
        (Some(class), Some(binding)) => BindingChange::Update {
            from: binding.spec.class_name.clone(),
            to: class.to_string(),
        },
    }
}

pub async fn reconcile(namespace: Arc<Namespace>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();

    let change = tokio::select! {
        biased;
        _ = ctx.shutdown.cancelled() => return Err(Error::Cancelled),
        change = reconcile_namespace(&namespace, &ctx) => change?,
    };

    if change != BindingChange::None {
        let duration = Instant::now().sub(start);
        info!(
            namespace = %namespace.name_any(),
            ?change,
            "finished reconciling in {:?} ms",
            duration.as_millis()
        );
    }
    Ok(Action::await_change())
}

async fn reconcile_namespace(namespace: &Namespace, ctx: &Context) -> Result<BindingChange> {
    let name = namespace
        .metadata
        .name
        .clone()
        .ok_or(Error::InvalidConfigError("invalid name".to_string()))?;

    // cascading deletion through owner references takes care of the binding
    if namespace.metadata.deletion_timestamp.is_some() {
        return Ok(BindingChange::None);
    }

    let desired = namespace
        .labels()
        .get(&ctx.config.class_label)
        .map(String::as_str);
    // the binding is named after its namespace
    let existing = ctx.bindings.get_binding(&name, &name).await?;

    let change = plan_binding_change(desired, existing.as_ref());
    match &change {
        BindingChange::None => {}
        BindingChange::Create { class } => {
            info!(namespace = %name, class = %class, "creating NamespaceClassBinding");
            let binding = new_binding(namespace, &name, class)?;
            ctx.bindings.create_binding(&binding).await?;
            ctx.bindings
                .record_event(
                    &namespace.object_ref(&()),
                    EventType::Normal,
                    EVENT_BINDING_CREATED,
                    format!("Created NamespaceClassBinding for class {class}"),
                )
                .await;
        }
        BindingChange::Update { from, to } => {
            info!(namespace = %name, old_class = %from, new_class = %to, "updating NamespaceClassBinding");
            if let Some(mut binding) = existing {
                binding.spec.class_name = to.clone();
                ctx.bindings.replace_binding(&binding).await?;
            }
            ctx.bindings
                .record_event(
                    &namespace.object_ref(&()),
                    EventType::Normal,
                    EVENT_BINDING_UPDATED,
                    format!("Updated NamespaceClassBinding to class {to}"),
                )
                .await;
        }
        BindingChange::Delete { class } => {
            info!(namespace = %name, class = %class, "removing NamespaceClassBinding as label was removed");
            match ctx.bindings.delete_binding(&name, &name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            ctx.bindings
                .record_event(
                    &namespace.object_ref(&()),
                    EventType::Normal,
                    EVENT_BINDING_REMOVED,
                    format!("Removed NamespaceClassBinding for class {class}"),
                )
                .await;
        }
    }
    Ok(change)
}

fn new_binding(namespace: &Namespace, name: &str, class: &str) -> Result<NamespaceClassBinding> {
    let owner = namespace
        .controller_owner_ref(&())
        .ok_or_else(|| Error::InvalidConfigError(format!("namespace {name} has no uid")))?;
    let mut binding = NamespaceClassBinding::new(
        name,
        NamespaceClassBindingSpec {
            class_name: class.to_string(),
        },
    );
    binding.metadata.namespace = Some(name.to_string());
    binding.metadata.owner_references = Some(vec![owner]);
    Ok(binding)
}

pub async fn controller(client: Client, ctx: Context) -> Result<()> {
    Api::<NamespaceClassBinding>::all(client.clone())
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let namespaces = Api::<Namespace>::all(client);
    let workers = ctx.config.namespace_workers;
    let shutdown = ctx.shutdown.clone();

    Controller::new(namespaces, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(workers))
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(namespace: Arc<Namespace>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_cancellation() {
        return Action::await_change();
    }
    warn!(namespace = %namespace.name_any(), "reconcile failed: {:?}", error);
    Action::requeue(ctx.config.error_requeue())
}
