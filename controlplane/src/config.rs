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

use clap::Parser;

use crate::consts::{BINDING_FIELD_MANAGER, NAMESPACECLASS_LABEL};
use crate::{Error, Result};

/// Runtime configuration for both controllers.
#[derive(Debug, Clone, Parser)]
#[command(name = "controller", about = "Materializes NamespaceClass resources into namespaces")]
pub struct Config {
    /// Namespace label whose value names the NamespaceClass to bind
    #[arg(long, env = "NAMESPACECLASS_LABEL", default_value = NAMESPACECLASS_LABEL)]
    pub class_label: String,

    /// Field manager used when applying managed resources
    #[arg(long, env = "NAMESPACECLASS_FIELD_MANAGER", default_value = BINDING_FIELD_MANAGER)]
    pub field_manager: String,

    /// Concurrent reconciles for the namespace controller
    #[arg(long, env = "NAMESPACECLASS_NAMESPACE_WORKERS", default_value_t = 2)]
    pub namespace_workers: u16,

    /// Concurrent reconciles for the binding controller
    #[arg(long, env = "NAMESPACECLASS_BINDING_WORKERS", default_value_t = 4)]
    pub binding_workers: u16,

    /// Upper bound on waiting for a resource to disappear before recreating it
    #[arg(long, env = "NAMESPACECLASS_DELETION_TIMEOUT_SECS", default_value_t = 30)]
    pub deletion_timeout_secs: u64,

    #[arg(long, env = "NAMESPACECLASS_DELETION_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub deletion_poll_interval_ms: u64,

    /// Delay before a failed reconcile is retried
    #[arg(long, env = "NAMESPACECLASS_ERROR_REQUEUE_SECS", default_value_t = 5)]
    pub error_requeue_secs: u64,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            class_label: NAMESPACECLASS_LABEL.to_string(),
            field_manager: BINDING_FIELD_MANAGER.to_string(),
            namespace_workers: 2,
            binding_workers: 4,
            deletion_timeout_secs: 30,
            deletion_poll_interval_ms: 1000,
            error_requeue_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.class_label.trim().is_empty() {
            return Err(Error::InvalidConfigError("class label must not be empty".to_string()));
        }
        if self.field_manager.trim().is_empty() {
            return Err(Error::InvalidConfigError("field manager must not be empty".to_string()));
        }
        if self.namespace_workers == 0 || self.binding_workers == 0 {
            return Err(Error::InvalidConfigError(
                "worker counts must be at least 1".to_string(),
            ));
        }
        if self.deletion_poll_interval_ms == 0 {
            return Err(Error::InvalidConfigError(
                "deletion poll interval must be positive".to_string(),
            ));
        }
        if self.deletion_poll_interval() > self.deletion_timeout() {
            return Err(Error::InvalidConfigError(format!(
                "deletion poll interval {}ms exceeds deletion timeout {}s",
                self.deletion_poll_interval_ms, self.deletion_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.deletion_timeout_secs)
    }

    pub fn deletion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.deletion_poll_interval_ms)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}
