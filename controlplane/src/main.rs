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

use anyhow::Context as _;
use clap::Parser;
use controlplane::*;

use controlplane::consts::{BINDING_CONTROLLER_NAME, NAMESPACE_CONTROLLER_NAME};
use kube::Client;
use tokio::try_join;
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.validate()?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).context("invalid log level")?)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    run(config).await;
    Ok(())
}

pub async fn run(config: Config) {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            error!("failed to create kube Client: {error}");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let namespace_ctx = Context::new(
        KubeStore::new(client.clone(), NAMESPACE_CONTROLLER_NAME, &config.field_manager),
        config.clone(),
        shutdown.clone(),
    );
    let binding_ctx = Context::new(
        KubeStore::new(client.clone(), BINDING_CONTROLLER_NAME, &config.field_manager),
        config,
        shutdown,
    );

    info!("starting namespace and binding controllers");
    if let Err(error) = try_join!(
        namespace_controller(client.clone(), namespace_ctx),
        namespaceclassbinding_controller(client, binding_ctx),
    ) {
        error!("failed to start controllers: {error:?}");
        std::process::exit(1);
    }
    info!("controllers stopped");
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("failed to install SIGTERM handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, stopping controllers");
    shutdown.cancel();
}
