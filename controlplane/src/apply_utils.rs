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

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::crds::AppliedResource;
use crate::manifest::Manifest;
use crate::store::ResourceStore;
use crate::{Context, Error, Result};

// Applies a managed resource, escalating through three tiers:
//
//   1. server-side apply without forcing field ownership;
//   2. on a field manager conflict, the same apply with forced ownership;
//   3. on an immutable field error, delete and recreate the object, but only
//      when the live object is controlled by `owner`.
//
// Every other error is returned unchanged from the tier that produced it.
pub async fn upsert(ctx: &Context, manifest: &Manifest, owner: &OwnerReference) -> Result<Manifest> {
    let field_manager = ctx.config.field_manager.as_str();

    let mut result = ctx.resources.apply(manifest, field_manager, false).await;

    if matches!(&result, Err(e) if e.is_field_conflict()) {
        debug!(
            resource = ?manifest.key(),
            "field manager conflict; applying with forced ownership"
        );
        result = ctx.resources.apply(manifest, field_manager, true).await;
    }

    if matches!(&result, Err(e) if e.is_immutable_field()) {
        result = recreate(ctx, manifest, owner).await;
    }

    result
}

// Deletes and recreates an object whose immutable fields differ from the
// manifest. Refuses to touch objects that this binding does not control.
async fn recreate(ctx: &Context, manifest: &Manifest, owner: &OwnerReference) -> Result<Manifest> {
    let key = manifest
        .key()
        .ok_or_else(|| Error::InvalidManifest("manifest has no apiVersion, kind or name".to_string()))?;
    let namespace = manifest
        .namespace()
        .ok_or_else(|| Error::InvalidManifest(format!("{key} has no namespace")))?;

    if !is_controlled_by(ctx.resources.as_ref(), namespace, &key, owner).await? {
        warn!(%key, namespace, "refusing to recreate resource not controlled by this binding");
        return Err(Error::NotControllerOwned(key.to_string()));
    }

    info!(%key, namespace, "recreating resource due to immutable field changes");
    ctx.resources.delete_if_exists(namespace, &key).await?;
    wait_for_deletion(
        ctx.resources.as_ref(),
        namespace,
        &key,
        ctx.config.deletion_timeout(),
        ctx.config.deletion_poll_interval(),
        &ctx.shutdown,
    )
    .await?;

    ctx.resources
        .apply(manifest, &ctx.config.field_manager, false)
        .await
}

/// Reads the live object back and checks that `owner` is its controller.
/// An object that no longer exists cannot be confirmed.
pub async fn is_controlled_by(
    store: &dyn ResourceStore,
    namespace: &str,
    key: &AppliedResource,
    owner: &OwnerReference,
) -> Result<bool> {
    Ok(store
        .get(namespace, key)
        .await?
        .is_some_and(|live| live.is_controlled_by(owner)))
}

/// Polls until the object is gone, giving up after `timeout`. Cancellation
/// ends the wait at once with `Error::Cancelled`.
pub async fn wait_for_deletion(
    store: &dyn ResourceStore,
    namespace: &str,
    key: &AppliedResource,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if store.get(namespace, key).await?.is_none() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::DeletionTimeout(key.to_string()));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep(poll_interval) => {}
        }
    }
}
