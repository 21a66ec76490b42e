// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Instance owners, one per configured backend.

use std::sync::Arc;
use std::time::Duration;

use crate::app::errors::{AppError, AppResult};
use crate::app::executor::RemoteExecutor;
use crate::app::instance::Instance;
use crate::app::ports::{ClockPort, ComputeApiPort, NetworkProbePort};
use crate::app::services::params::param_list;
use crate::app::services::paths::StorageLayout;
use crate::app::types::{BackendKind, CloudImage, CloudInstance, InstanceSummary, Params};

pub mod gcp;
pub mod local;

pub use gcp::GcpProvider;
pub use local::LocalProvider;

/// Bounded polling for asynchronous cloud operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub deadline: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            deadline: Duration::from_secs(600),
        }
    }
}

impl PollPolicy {
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_interval)
    }
}

/// Immutable provider description resolved from configuration.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub kind: BackendKind,
    /// Defaults already layered `all < backend type < provider name`.
    pub defaults: Params,
    pub layout: StorageLayout,
    /// Extra vars passed to every role run on this provider's instances.
    pub vars: Params,
    pub project: Option<String>,
    pub zones: Vec<String>,
    pub firewall_rule_name: String,
    pub required_ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub heartbeat_threshold: u32,
    pub heartbeat_port: u16,
    pub poll: PollPolicy,
}

/// Shared collaborators handed to every provider.
#[derive(Clone)]
pub struct ProviderDeps {
    pub executor: Arc<RemoteExecutor>,
    pub network: Arc<dyn NetworkProbePort>,
    pub clock: Arc<dyn ClockPort>,
}

pub enum Provider {
    Local(LocalProvider),
    Gcp(GcpProvider),
}

impl Provider {
    pub fn build(
        settings: ProviderSettings,
        runtime: RuntimeSettings,
        deps: ProviderDeps,
        compute: Option<Arc<dyn ComputeApiPort>>,
    ) -> AppResult<Self> {
        match settings.kind {
            BackendKind::Local => Ok(Provider::Local(LocalProvider::new(settings, runtime, deps))),
            BackendKind::Gcp => {
                let compute = compute.ok_or_else(|| {
                    AppError::configuration(format!(
                        "provider {} needs a compute API client",
                        settings.name
                    ))
                })?;
                Ok(Provider::Gcp(GcpProvider::new(settings, runtime, deps, compute)?))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.settings().name
    }

    pub fn kind(&self) -> BackendKind {
        self.settings().kind
    }

    pub fn settings(&self) -> &ProviderSettings {
        match self {
            Provider::Local(p) => p.settings(),
            Provider::Gcp(p) => p.settings(),
        }
    }

    /// Dependencies installed on fresh instances during `dispatching_installs`.
    pub fn dependencies(&self) -> Vec<String> {
        param_list(&self.settings().defaults, "install")
    }

    pub async fn ensure_network_access(&self) -> AppResult<()> {
        match self {
            Provider::Local(_) => Ok(()),
            Provider::Gcp(p) => p.ensure_network_access().await,
        }
    }

    /// Binds an instance for `job_uid`, creating it when the backend requires it.
    pub async fn acquire_instance(
        &self,
        job_uid: &str,
        overrides: &Params,
    ) -> AppResult<Arc<Instance>> {
        match self {
            Provider::Local(p) => p.acquire_instance().await,
            Provider::Gcp(p) => p.acquire_instance(job_uid, overrides).await,
        }
    }

    pub async fn instance(&self, name: &str) -> Option<Arc<Instance>> {
        match self {
            Provider::Local(p) => p.instance(name),
            Provider::Gcp(p) => p.instance(name).await,
        }
    }

    /// Drops the instance from the pool; cloud instances are also deleted.
    pub async fn release_instance(&self, name: &str) {
        match self {
            Provider::Local(_) => {}
            Provider::Gcp(p) => p.release_instance(name).await,
        }
    }

    pub async fn list_instances(&self) -> Vec<InstanceSummary> {
        match self {
            Provider::Local(p) => p.list_instances(),
            Provider::Gcp(p) => p
                .list_instances()
                .await
                .into_iter()
                .map(|inst| cloud_summary(self.name(), inst))
                .collect(),
        }
    }

    /// Cloud instances created by this orchestrator identity.
    pub async fn list_jobs(&self) -> AppResult<Vec<CloudInstance>> {
        match self {
            Provider::Local(_) => Ok(Vec::new()),
            Provider::Gcp(p) => p.list_jobs().await,
        }
    }

    pub async fn list_images(&self) -> AppResult<Vec<CloudImage>> {
        match self {
            Provider::Local(p) => Err(AppError::configuration(format!(
                "provider {} has no image catalogue",
                p.settings().name
            ))),
            Provider::Gcp(p) => p.list_images().await,
        }
    }

    pub async fn check_connection(&self) -> bool {
        match self {
            Provider::Local(_) => true,
            Provider::Gcp(p) => p.check_connection().await,
        }
    }
}

fn cloud_summary(provider: &str, inst: CloudInstance) -> InstanceSummary {
    InstanceSummary {
        address: inst
            .external_ip
            .or(inst.internal_ip)
            .unwrap_or_default(),
        name: inst.name,
        provider: provider.to_string(),
        status: inst.status.to_ascii_lowercase(),
    }
}
