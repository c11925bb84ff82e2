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
use std::{
    ops::Sub,
    sync::Arc,
    time::Instant,
};

use crate::*;
use consts::*;
use crds::{NamespaceClass, NamespaceClassBinding};
use index::{BindingIndex, BindingLookup};
use kube::{
    api::{Api, ListParams},
    runtime::{controller, controller::Action, events::EventType, reflector::ObjectRef, watcher, Controller},
    Client, Resource, ResourceExt,
};
use namespaceclassbinding_utils::*;
use utils::set_condition;

use tracing::*;

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    UpToDate,
    CleanedUp,
    Applied(usize),
}

pub async fn reconcile(binding: Arc<NamespaceClassBinding>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();

    let outcome = tokio::select! {
        biased;
        _ = ctx.shutdown.cancelled() => return Err(Error::Cancelled),
        outcome = reconcile_binding(&binding, &ctx) => outcome?,
    };

    let duration = Instant::now().sub(start);
    info!(
        namespace = %binding.namespace().unwrap_or_default(),
        class = %binding.spec.class_name,
        ?outcome,
        "finished reconciling in {:?} ms",
        duration.as_millis()
    );
    Ok(Action::await_change())
}

async fn reconcile_binding(binding: &NamespaceClassBinding, ctx: &Context) -> Result<Outcome> {
    let namespace = binding
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::InvalidConfigError("binding has no namespace".to_string()))?;
    let name = binding.name_any();
    let class_name = binding.spec.class_name.as_str();

    if binding.metadata.deletion_timestamp.is_some() {
        debug!(namespace, "binding is being deleted, skipping");
        return Ok(Outcome::UpToDate);
    }

    let Some(class) = ctx.bindings.get_class(class_name).await? else {
        return handle_class_not_found(binding, ctx, namespace, &name).await;
    };
    let class_generation = class.metadata.generation.unwrap_or_default();

    if !needs_update(binding, &class) {
        debug!(namespace, class = class_name, generation = class_generation, "binding is up to date");
        return Ok(Outcome::UpToDate);
    }

    let switch = is_class_switch(binding, &class);
    if switch {
        info!(
            namespace,
            from = %binding.status_or_default().observed_class_name,
            to = class_name,
            "class switched, removing previously applied resources"
        );
    }

    let stale = stale_resources(binding, &desired_keys(&class), switch);
    if let Err(failure) = prune_resources(ctx, namespace, &stale).await {
        let message = format!("Failed to prune resources: {failure}");
        return Err(fail_pass(binding, ctx, REASON_PRUNE_FAILED, message, failure.error).await);
    }

    let applied = match apply_resources(ctx, binding, &class).await {
        Ok(applied) => applied,
        Err(failure) => {
            let message = format!("Failed to apply resources: {failure}");
            return Err(fail_pass(binding, ctx, REASON_APPLY_FAILED, message, failure.error).await);
        }
    };

    let count = applied.len();
    let message = format!("Successfully applied {count} resources from class {class_name}");
    update_status(ctx, namespace, &name, |status| {
        status.observed_class_name = class_name.to_string();
        status.observed_class_generation = class_generation;
        status.applied_resources = applied.clone();
        set_condition(
            status,
            CONDITION_TYPE_READY,
            true,
            REASON_RECONCILE_SUCCESS,
            message.clone(),
            binding.metadata.generation,
        );
    })
    .await?;

    ctx.bindings
        .record_event(&binding.object_ref(&()), EventType::Normal, EVENT_RECONCILE_SUCCEEDED, message)
        .await;
    Ok(Outcome::Applied(count))
}

// The referenced class is gone: mark the binding, remove what it applied and
// then remove the binding itself.
async fn handle_class_not_found(
    binding: &NamespaceClassBinding,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Outcome> {
    let class_name = &binding.spec.class_name;
    info!(namespace, class = %class_name, "class not found, cleaning up binding");

    let message = format!("NamespaceClass {class_name} not found");
    let latest = update_status(ctx, namespace, name, |status| {
        set_condition(
            status,
            CONDITION_TYPE_READY,
            false,
            REASON_CLASS_NOT_FOUND,
            message.clone(),
            binding.metadata.generation,
        );
    })
    .await?;
    let applied = latest
        .map(|b| b.applied_resources().to_vec())
        .unwrap_or_else(|| binding.applied_resources().to_vec());

    for key in &applied {
        if ctx.resources.delete_if_exists(namespace, key).await? {
            debug!(namespace, %key, "deleted resource of missing class");
        }
    }

    match ctx.bindings.delete_binding(namespace, name).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    ctx.bindings
        .record_event(
            &binding.object_ref(&()),
            EventType::Normal,
            EVENT_CLEANED_UP,
            format!(
                "Removed {} resources and the binding after NamespaceClass {class_name} was deleted",
                applied.len()
            ),
        )
        .await;
    Ok(Outcome::CleanedUp)
}

// Records a failed pass on the binding and hands back the error to return.
// The rest of the status is left alone so the next pass starts from the same
// applied set.
async fn fail_pass(
    binding: &NamespaceClassBinding,
    ctx: &Context,
    reason: &str,
    message: String,
    error: Error,
) -> Error {
    if error.is_cancellation() {
        return error;
    }
    let namespace = binding.metadata.namespace.as_deref().unwrap_or_default();
    let name = binding.name_any();
    warn!(namespace, reason, "{message}");

    ctx.bindings
        .record_event(&binding.object_ref(&()), EventType::Warning, reason, message.clone())
        .await;

    let result = update_status(ctx, namespace, &name, |status| {
        set_condition(
            status,
            CONDITION_TYPE_READY,
            false,
            reason,
            message.clone(),
            binding.metadata.generation,
        );
    })
    .await;
    if let Err(status_error) = result {
        warn!(namespace, "failed to record {reason} on binding status: {status_error}");
    }
    error
}

fn bindings_for_class(lookup: &dyn BindingLookup, class_name: &str) -> Vec<ObjectRef<NamespaceClassBinding>> {
    lookup
        .bindings_referencing(class_name)
        .into_iter()
        .map(|key| ObjectRef::new(&key.name).within(&key.namespace))
        .collect()
}

pub async fn controller(client: Client, ctx: Context) -> Result<()> {
    let bindings = Api::<NamespaceClassBinding>::all(client.clone());
    bindings
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;
    let classes = Api::<NamespaceClass>::all(client);
    classes
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    let index = BindingIndex::new();
    let lookup = index.clone();
    let workers = ctx.config.binding_workers;
    let shutdown = ctx.shutdown.clone();

    let run = Controller::new(bindings.clone(), watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(workers))
        .watches(classes, watcher::Config::default(), move |class: NamespaceClass| {
            bindings_for_class(&lookup, &class.name_any())
        })
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    tokio::select! {
        _ = run => {}
        _ = index.maintain(bindings) => {}
    }

    Ok(())
}

fn error_policy(binding: Arc<NamespaceClassBinding>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_cancellation() {
        return Action::await_change();
    }
    warn!(
        namespace = %binding.namespace().unwrap_or_default(),
        "reconcile failed: {:?}", error
    );
    Action::requeue(ctx.config.error_requeue())
}
