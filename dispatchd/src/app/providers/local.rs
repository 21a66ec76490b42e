// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use tokio::sync::OnceCell;

use super::{ProviderDeps, ProviderSettings, RuntimeSettings};
use crate::app::errors::{AppError, AppResult};
use crate::app::instance::{Instance, InstanceBackend};
use crate::app::types::{Address, InstanceSummary};

const LOCAL_HOST: &str = "localhost";

/// The orchestrator host as a single, always available instance.
pub struct LocalProvider {
    settings: ProviderSettings,
    instance: Arc<Instance>,
    ready: OnceCell<()>,
}

impl LocalProvider {
    pub fn new(settings: ProviderSettings, runtime: RuntimeSettings, deps: ProviderDeps) -> Self {
        let instance = Arc::new(Instance::new(
            settings.name.clone(),
            Address::Hostname(LOCAL_HOST.to_string()),
            settings.name.clone(),
            InstanceBackend::Local,
            settings.layout.clone(),
            settings.vars.clone(),
            runtime.heartbeat_threshold,
            deps.executor,
        ));
        Self {
            settings,
            instance,
            ready: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Runs the machine readiness check on first use; a failed check is retried
    /// on the next acquisition.
    pub async fn acquire_instance(&self) -> AppResult<Arc<Instance>> {
        self.ready
            .get_or_try_init(|| async {
                let outcome = self.instance.check_setup().await;
                if outcome.success {
                    tracing::info!(provider = %self.settings.name, "local host ready");
                    Ok(())
                } else {
                    Err(AppError::configuration(outcome.message)
                        .with_context(format!("provider {}", self.settings.name)))
                }
            })
            .await?;
        Ok(self.instance.clone())
    }

    pub fn instance(&self, name: &str) -> Option<Arc<Instance>> {
        (self.instance.name() == name).then(|| self.instance.clone())
    }

    pub fn list_instances(&self) -> Vec<InstanceSummary> {
        let status = if !self.ready.initialized() {
            "unchecked"
        } else if self.instance.is_unreachable() {
            "unreachable"
        } else {
            "ready"
        };
        vec![InstanceSummary {
            name: self.instance.name().to_string(),
            address: self.instance.address().to_string(),
            provider: self.settings.name.clone(),
            status: status.to_string(),
        }]
    }
}
