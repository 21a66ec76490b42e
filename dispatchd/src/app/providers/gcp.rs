// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Value, json};
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::{PollPolicy, ProviderDeps, ProviderSettings, RuntimeSettings};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::instance::{Instance, InstanceBackend};
use crate::app::ports::ComputeApiPort;
use crate::app::services::params::{merge_params, param_bool, param_list, param_str, param_text};
use crate::app::services::random::generate_instance_name;
use crate::app::types::{
    Address, CloudImage, CloudInstance, CreatedInstance, FirewallAllow, FirewallRule, Params,
    ZoneOperation,
};

pub const IDENTIFIER_LABEL: &str = "dispatch-identifier";
pub const CREATION_TIME_LABEL: &str = "job-creation-time";
const DEFAULT_NAME_PREFIX: &str = "dispatch-";
const DEFAULT_DISK_SIZE_GB: &str = "10";
const DEFAULT_DISK_TYPE: &str = "pd-standard";
const STARTUP_SCRIPT_KEY: &str = "startup-script";

/// Wraps every user startup script; the marker file tells operators boot finished.
const BOOTSTRAP_PREAMBLE: &str = "#!/bin/bash\n\
exec > >(tee -a /var/log/dispatch-startup.log) 2>&1\n\
echo \"dispatch bootstrap: start $(date -u +%Y-%m-%dT%H:%M:%SZ)\"\n\
mkdir -p /var/lib/dispatch\n";
const BOOTSTRAP_EPILOGUE: &str = "\necho \"dispatch bootstrap: done $(date -u +%Y-%m-%dT%H:%M:%SZ)\"\n\
touch /var/lib/dispatch/ready\n";

/// Validated insert request for one cloud instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRequest {
    pub name: String,
    pub zone: String,
    pub body: Value,
}

pub struct GcpProvider {
    settings: ProviderSettings,
    project: String,
    runtime: RuntimeSettings,
    deps: ProviderDeps,
    compute: Arc<dyn ComputeApiPort>,
    firewall_checked: Mutex<bool>,
    pool: RwLock<HashMap<String, Arc<Instance>>>,
}

impl GcpProvider {
    pub fn new(
        settings: ProviderSettings,
        runtime: RuntimeSettings,
        deps: ProviderDeps,
        compute: Arc<dyn ComputeApiPort>,
    ) -> AppResult<Self> {
        let project = settings
            .project
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                AppError::configuration(format!("provider {} has no project", settings.name))
            })?;
        if settings.zones.is_empty() {
            return Err(AppError::configuration(format!(
                "provider {} has no zones",
                settings.name
            )));
        }
        Ok(Self {
            settings,
            project,
            runtime,
            deps,
            compute,
            firewall_checked: Mutex::new(false),
            pool: RwLock::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    /// Creates the firewall rule once if it is absent. Concurrent callers serialize
    /// on the check so the rule is never inserted twice.
    #[tracing::instrument(skip(self), fields(provider = %self.settings.name))]
    pub async fn ensure_network_access(&self) -> AppResult<()> {
        let mut checked = self.firewall_checked.lock().await;
        if *checked {
            return Ok(());
        }
        let rule_name = &self.settings.firewall_rule_name;
        let existing = self.compute.list_firewalls(&self.project).await?;
        if existing.iter().any(|rule| &rule.name == rule_name) {
            tracing::debug!(rule = %rule_name, "firewall rule present");
        } else {
            tracing::info!(rule = %rule_name, "creating firewall rule");
            let ports: Vec<String> = self
                .settings
                .required_ports
                .iter()
                .map(u16::to_string)
                .collect();
            let rule = FirewallRule {
                name: rule_name.clone(),
                description: "Allows the dispatch orchestrator to reach its instances".to_string(),
                allowed: ["tcp", "udp"]
                    .into_iter()
                    .map(|protocol| FirewallAllow {
                        protocol: protocol.to_string(),
                        ports: ports.clone(),
                    })
                    .collect(),
                target_tags: vec![rule_name.clone()],
            };
            self.compute.insert_firewall(&self.project, &rule).await?;
        }
        *checked = true;
        Ok(())
    }

    /// Resolves all parameters and builds the insert body without touching the API.
    pub async fn build_instance_request(&self, overrides: &Params) -> AppResult<InstanceRequest> {
        let all = merge_params(&self.settings.defaults, overrides);
        let context = format!("provider {}", self.settings.name);
        let missing = |field: &str| {
            AppError::configuration(format!("missing required parameter '{field}'"))
                .with_context(context.clone())
        };

        let zone = param_str(&all, "zone")
            .map(str::to_string)
            .or_else(|| self.settings.zones.first().cloned())
            .ok_or_else(|| missing("zone"))?;
        let source_image = param_str(&all, "source-image").ok_or_else(|| missing("source-image"))?;
        let instance_type =
            param_str(&all, "instance-type").ok_or_else(|| missing("instance-type"))?;
        let identifier =
            param_str(&all, IDENTIFIER_LABEL).ok_or_else(|| missing(IDENTIFIER_LABEL))?;

        let name = generate_instance_name(
            param_str(&all, "name-prefix").unwrap_or(DEFAULT_NAME_PREFIX),
        );
        let zone_path = format!("projects/{}/zones/{zone}", self.project);
        let disk_size =
            param_text(&all, "disk-size").unwrap_or_else(|| DEFAULT_DISK_SIZE_GB.to_string());
        let disk_type = param_str(&all, "disk-type").unwrap_or(DEFAULT_DISK_TYPE);

        let mut labels = string_map(all.get("labels"));
        labels.insert(
            CREATION_TIME_LABEL.to_string(),
            creation_time_label(self.deps.clock.now_utc()),
        );
        labels.insert(IDENTIFIER_LABEL.to_string(), identifier.to_string());

        let metadata = string_map(all.get("metadata"));
        let mut metadata_items: Vec<Value> = metadata
            .iter()
            .map(|(key, value)| json!({"key": key, "value": value}))
            .collect();
        let user_script = match param_str(&all, "startup-script-file") {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AppError::configuration(format!("could not read startup script {path}: {e}"))
                        .with_context(context.clone())
                })?;
                substitute_metadata(&raw, &metadata)
            }
            None => String::new(),
        };
        metadata_items.push(json!({
            "key": STARTUP_SCRIPT_KEY,
            "value": format!("{BOOTSTRAP_PREAMBLE}{user_script}{BOOTSTRAP_EPILOGUE}"),
        }));

        let mut tags = vec![self.settings.firewall_rule_name.clone()];
        tags.extend(param_list(&all, "tags"));

        let mut body = json!({
            "name": name,
            "machineType": format!("zones/{zone}/machineTypes/{instance_type}"),
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": source_image,
                    "diskSizeGb": disk_size,
                    "diskType": format!(
                        "https://www.googleapis.com/compute/v1/{zone_path}/diskTypes/{disk_type}"
                    ),
                },
            }],
            "networkInterfaces": [{
                "network": "global/networks/default",
                "accessConfigs": [{"type": "ONE_TO_ONE_NAT", "name": "External NAT"}],
            }],
            "tags": {"items": tags},
            "labels": labels,
            "metadata": {"items": metadata_items},
        });

        if let Some(email) = param_str(&all, "service-account") {
            body["serviceAccounts"] = json!([{
                "email": email,
                "scopes": [
                    "https://www.googleapis.com/auth/devstorage.read_write",
                    "https://www.googleapis.com/auth/logging.write",
                ],
            }]);
        }
        if let Some(preemptible) = param_bool(&all, "preemptible") {
            body["scheduling"] = json!({"preemptible": preemptible});
        }
        if let Some(gpus) = all.get("gpus").and_then(Value::as_object) {
            let accelerator = gpus
                .get("acceleratorType")
                .and_then(Value::as_str)
                .ok_or_else(|| missing("gpus.acceleratorType"))?;
            let count = gpus.get("acceleratorCount").cloned().unwrap_or(json!(1));
            body["guestAccelerators"] = json!([{
                "acceleratorType": format!("{zone_path}/acceleratorTypes/{accelerator}"),
                "acceleratorCount": count,
            }]);
            body["scheduling"]["onHostMaintenance"] = json!("TERMINATE");
        }

        Ok(InstanceRequest { name, zone, body })
    }

    /// Submits an instance creation. All parameters are validated before the first
    /// API call.
    #[tracing::instrument(skip_all, fields(provider = %self.settings.name))]
    pub async fn create_instance(&self, overrides: &Params) -> AppResult<CreatedInstance> {
        let request = self.build_instance_request(overrides).await?;
        self.ensure_network_access().await?;
        let operation_name = self
            .compute
            .insert_instance(&self.project, &request.zone, &request.body)
            .await?;
        tracing::info!(instance = %request.name, zone = %request.zone, operation = %operation_name, "instance creation submitted");
        Ok(CreatedInstance {
            machine_name: request.name,
            machine_project: self.project.clone(),
            machine_zone: request.zone,
            operation_name,
        })
    }

    /// Polls a zone operation with capped exponential backoff until it is done.
    /// Exceeding the policy deadline yields a retryable timeout, distinct from an
    /// operation that finished with an error payload.
    pub async fn wait_for_operation(&self, zone: &str, operation: &str) -> AppResult<ZoneOperation> {
        let poll: PollPolicy = self.runtime.poll;
        let deadline = Instant::now() + poll.deadline;
        let mut delay = poll.interval;
        loop {
            let result = self
                .compute
                .get_zone_operation(&self.project, zone, operation)
                .await?;
            if result.done {
                if let Some(error) = result.error {
                    tracing::warn!(%operation, "operation finished with error");
                    return Err(AppError::operation_failed(operation, error));
                }
                tracing::debug!(%operation, "operation done");
                return Ok(result);
            }
            let now = Instant::now();
            if now + delay > deadline {
                return Err(AppError::timeout(format!(
                    "operation {operation} not done after {}s",
                    poll.deadline.as_secs()
                )));
            }
            tokio::time::sleep(delay).await;
            delay = poll.next_delay(delay);
        }
    }

    /// Creates a fresh instance, waits for it to boot and pools it.
    pub async fn acquire_instance(&self, job_uid: &str, overrides: &Params) -> AppResult<Arc<Instance>> {
        let created = self.create_instance(overrides).await?;
        match self.await_instance(&created).await {
            Ok(instance) => {
                self.pool
                    .write()
                    .await
                    .insert(created.machine_name.clone(), instance.clone());
                tracing::info!(%job_uid, instance = %created.machine_name, "instance acquired");
                Ok(instance)
            }
            Err(err) => {
                tracing::warn!(%job_uid, instance = %created.machine_name, error = %err, "instance never became usable; deleting");
                self.delete_best_effort(&created.machine_zone, &created.machine_name)
                    .await;
                Err(err)
            }
        }
    }

    async fn await_instance(&self, created: &CreatedInstance) -> AppResult<Arc<Instance>> {
        self.wait_for_operation(&created.machine_zone, &created.operation_name)
            .await?;
        let described = self
            .compute
            .list_instances(&self.project, &created.machine_zone)
            .await?
            .into_iter()
            .find(|inst| inst.name == created.machine_name)
            .ok_or_else(|| {
                AppError::with_message(
                    AppErrorKind::Unavailable,
                    codes::NOT_FOUND,
                    format!("instance {} not listed after creation", created.machine_name),
                )
            })?;
        let ip = described
            .external_ip
            .or(described.internal_ip)
            .ok_or_else(|| {
                AppError::with_message(
                    AppErrorKind::Unavailable,
                    codes::NETWORK_ERROR,
                    format!("instance {} has no address yet", created.machine_name),
                )
            })?;
        let address = Address::parse(&ip);
        self.wait_until_reachable(&address).await?;
        Ok(Arc::new(Instance::new(
            created.machine_name.clone(),
            address,
            self.settings.name.clone(),
            InstanceBackend::Cloud {
                project: self.project.clone(),
                zone: created.machine_zone.clone(),
            },
            self.settings.layout.clone(),
            self.settings.vars.clone(),
            self.runtime.heartbeat_threshold,
            self.deps.executor.clone(),
        )))
    }

    async fn wait_until_reachable(&self, address: &Address) -> AppResult<()> {
        let poll = self.runtime.poll;
        let deadline = Instant::now() + poll.deadline;
        let mut delay = poll.interval;
        loop {
            match self
                .deps
                .network
                .check_host_reachable(address, self.runtime.heartbeat_port)
                .await
            {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => tracing::debug!(%address, error = %err, "heartbeat probe failed"),
            }
            if Instant::now() + delay > deadline {
                return Err(AppError::timeout(format!(
                    "{address} did not answer on port {} within {}s",
                    self.runtime.heartbeat_port,
                    poll.deadline.as_secs()
                )));
            }
            tokio::time::sleep(delay).await;
            delay = poll.next_delay(delay);
        }
    }

    pub async fn instance(&self, name: &str) -> Option<Arc<Instance>> {
        self.pool.read().await.get(name).cloned()
    }

    pub async fn release_instance(&self, name: &str) {
        let pooled = self.pool.write().await.remove(name);
        let zone = match pooled {
            Some(instance) => {
                instance.invalidate();
                match instance.backend() {
                    InstanceBackend::Cloud { zone, .. } => Some(zone.clone()),
                    InstanceBackend::Local => None,
                }
            }
            None => self
                .list_instances()
                .await
                .into_iter()
                .find(|inst| inst.name == name)
                .map(|inst| inst.zone),
        };
        match zone {
            Some(zone) => self.delete_best_effort(&zone, name).await,
            None => tracing::debug!(instance = %name, "nothing to release"),
        }
    }

    async fn delete_best_effort(&self, zone: &str, name: &str) {
        match self.compute.delete_instance(&self.project, zone, name).await {
            Ok(operation) => {
                tracing::info!(instance = %name, %zone, %operation, "instance deletion submitted")
            }
            Err(err) => tracing::warn!(instance = %name, %zone, error = %err, "instance deletion failed"),
        }
    }

    /// Lists instances across all zones; failing zones are logged and skipped.
    pub async fn list_instances(&self) -> Vec<CloudInstance> {
        let mut out = Vec::new();
        for zone in &self.settings.zones {
            match self.compute.list_instances(&self.project, zone).await {
                Ok(items) => out.extend(items),
                Err(err) => {
                    tracing::warn!(provider = %self.settings.name, %zone, error = %err, "zone listing failed")
                }
            }
        }
        out
    }

    /// Instances labelled with this provider's identifier.
    pub async fn list_jobs(&self) -> AppResult<Vec<CloudInstance>> {
        let identifier = param_str(&self.settings.defaults, IDENTIFIER_LABEL)
            .ok_or_else(|| {
                AppError::configuration(format!(
                    "provider {} has no '{IDENTIFIER_LABEL}' default",
                    self.settings.name
                ))
            })?
            .to_string();
        Ok(self
            .list_instances()
            .await
            .into_iter()
            .filter(|inst| inst.labels.get(IDENTIFIER_LABEL) == Some(&identifier))
            .collect())
    }

    pub async fn list_images(&self) -> AppResult<Vec<CloudImage>> {
        self.compute.list_images(&self.project).await
    }

    pub async fn check_connection(&self) -> bool {
        let Some(zone) = self.settings.zones.first() else {
            return false;
        };
        match self.compute.list_instances(&self.project, zone).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(provider = %self.settings.name, error = %err, "connection check failed");
                false
            }
        }
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), text))
        })
        .collect()
}

/// Replaces `${key}` placeholders with metadata values.
pub fn substitute_metadata(script: &str, metadata: &BTreeMap<String, String>) -> String {
    metadata.iter().fold(script.to_string(), |acc, (key, value)| {
        acc.replace(&format!("${{{key}}}"), value)
    })
}

fn creation_time_label(now: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    now.format(&format)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::{
        RecordingAutomation, ScriptedCompute, provider_deps, runtime, settings,
    };
    use crate::app::types::BackendKind;
    use std::io::Write;

    fn gcp_settings() -> ProviderSettings {
        let mut s = settings("gcp-main", BackendKind::Gcp);
        s.project = Some("proj".to_string());
        s.zones = vec!["us-east1-b".to_string(), "us-west1-a".to_string()];
        s.defaults = json!({
            "source-image": "projects/debian-cloud/global/images/family/debian-12",
            "instance-type": "e2-standard-4",
            "dispatch-identifier": "team-a",
            "labels": {"team": "ml"},
            "install": ["docker"],
        })
        .as_object()
        .cloned()
        .unwrap();
        s
    }

    fn provider(compute: Arc<ScriptedCompute>) -> GcpProvider {
        let automation = Arc::new(RecordingAutomation::new());
        GcpProvider::new(gcp_settings(), runtime(), provider_deps(automation), compute)
            .expect("valid provider")
    }

    fn overrides(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn ensure_network_access_creates_rule_once() {
        let compute = Arc::new(ScriptedCompute::new());
        let provider = provider(compute.clone());
        provider.ensure_network_access().await.unwrap();
        provider.ensure_network_access().await.unwrap();

        let inserted = compute.inserted_firewalls();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].target_tags, vec!["dispatch-firewall".to_string()]);
        let protocols: Vec<_> = inserted[0].allowed.iter().map(|a| a.protocol.as_str()).collect();
        assert_eq!(protocols, vec!["tcp", "udp"]);
        assert_eq!(inserted[0].allowed[0].ports, vec!["9991".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_network_checks_do_not_duplicate_rule() {
        let compute = Arc::new(ScriptedCompute::new());
        let provider = Arc::new(provider(compute.clone()));
        let a = provider.clone();
        let b = provider.clone();
        let (ra, rb) = tokio::join!(a.ensure_network_access(), b.ensure_network_access());
        ra.unwrap();
        rb.unwrap();
        assert_eq!(compute.inserted_firewalls().len(), 1);
    }

    #[tokio::test]
    async fn existing_rule_is_left_alone() {
        let compute = Arc::new(ScriptedCompute::new());
        compute.add_firewall("dispatch-firewall");
        let provider = provider(compute.clone());
        provider.ensure_network_access().await.unwrap();
        assert!(compute.inserted_firewalls().is_empty());
    }

    #[tokio::test]
    async fn request_merges_layers_and_labels() {
        let compute = Arc::new(ScriptedCompute::new());
        let provider = provider(compute);
        let request = provider
            .build_instance_request(&overrides(json!({
                "install": ["cuda"],
                "preemptible": true,
                "gpus": {"acceleratorType": "nvidia-tesla-t4", "acceleratorCount": 2},
            })))
            .await
            .unwrap();

        assert_eq!(request.zone, "us-east1-b");
        assert!(request.name.starts_with("dispatch-"));
        let body = &request.body;
        assert_eq!(body["machineType"], "zones/us-east1-b/machineTypes/e2-standard-4");
        assert_eq!(body["labels"]["dispatch-identifier"], "team-a");
        assert_eq!(body["labels"]["team"], "ml");
        assert!(body["labels"]["job-creation-time"].is_string());
        assert_eq!(body["disks"][0]["initializeParams"]["diskSizeGb"], "10");
        assert_eq!(body["scheduling"]["preemptible"], true);
        assert_eq!(body["scheduling"]["onHostMaintenance"], "TERMINATE");
        assert_eq!(
            body["guestAccelerators"][0]["acceleratorType"],
            "projects/proj/zones/us-east1-b/acceleratorTypes/nvidia-tesla-t4"
        );
        assert_eq!(body["tags"]["items"][0], "dispatch-firewall");
    }

    #[tokio::test]
    async fn missing_identifier_fails_before_any_api_call() {
        let compute = Arc::new(ScriptedCompute::new());
        let mut s = gcp_settings();
        s.defaults.remove("dispatch-identifier");
        let automation = Arc::new(RecordingAutomation::new());
        let provider =
            GcpProvider::new(s, runtime(), provider_deps(automation), compute.clone()).unwrap();

        let err = provider.create_instance(&Params::new()).await.unwrap_err();
        assert_eq!(err.code(), codes::CONFIGURATION_ERROR);
        assert!(err.message().contains("dispatch-identifier"));
        assert_eq!(compute.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_image_is_configuration_error() {
        let compute = Arc::new(ScriptedCompute::new());
        let mut s = gcp_settings();
        s.defaults.remove("source-image");
        let automation = Arc::new(RecordingAutomation::new());
        let provider =
            GcpProvider::new(s, runtime(), provider_deps(automation), compute.clone()).unwrap();
        let err = provider.create_instance(&Params::new()).await.unwrap_err();
        assert!(err.message().contains("source-image"));
        assert_eq!(compute.call_count(), 0);
    }

    #[tokio::test]
    async fn startup_script_is_wrapped_and_substituted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "echo ${{bucket}}").unwrap();
        let compute = Arc::new(ScriptedCompute::new());
        let provider = provider(compute);
        let request = provider
            .build_instance_request(&overrides(json!({
                "startup-script-file": file.path().to_string_lossy(),
                "metadata": {"bucket": "gs://outputs"},
            })))
            .await
            .unwrap();
        let items = request.body["metadata"]["items"].as_array().unwrap();
        let script = items
            .iter()
            .find(|item| item["key"] == STARTUP_SCRIPT_KEY)
            .and_then(|item| item["value"].as_str())
            .unwrap();
        assert!(script.starts_with(BOOTSTRAP_PREAMBLE));
        assert!(script.contains("echo gs://outputs"));
        assert!(script.ends_with(BOOTSTRAP_EPILOGUE));
        assert!(items.iter().any(|item| item["key"] == "bucket"));
    }

    #[tokio::test]
    async fn unreadable_startup_script_is_configuration_error() {
        let compute = Arc::new(ScriptedCompute::new());
        let provider = provider(compute.clone());
        let err = provider
            .create_instance(&overrides(json!({"startup-script-file": "/nonexistent/boot.sh"})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::CONFIGURATION_ERROR);
        assert_eq!(compute.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_operation_returns_terminal_result() {
        let compute = Arc::new(ScriptedCompute::new());
        compute.script_operation("op-1", 3, None);
        let provider = provider(compute);
        let result = provider.wait_for_operation("us-east1-b", "op-1").await.unwrap();
        assert!(result.done);
        assert_eq!(result.name, "op-1");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_operation_surfaces_error_payload() {
        let compute = Arc::new(ScriptedCompute::new());
        let payload = json!({"errors": [{"code": "ZONE_RESOURCE_POOL_EXHAUSTED"}]});
        compute.script_operation("op-2", 1, Some(payload.clone()));
        let provider = provider(compute);
        let err = provider.wait_for_operation("us-east1-b", "op-2").await.unwrap_err();
        assert_eq!(err.code(), codes::OPERATION_ERROR);
        assert_eq!(err.details(), Some(&payload));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_operation_times_out_retryably() {
        let compute = Arc::new(ScriptedCompute::new());
        compute.script_operation("op-3", u32::MAX, None);
        let provider = provider(compute);
        let err = provider.wait_for_operation("us-east1-b", "op-3").await.unwrap_err();
        assert_eq!(err.code(), codes::TIMEOUT);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn listing_skips_failing_zones() {
        let compute = Arc::new(ScriptedCompute::new());
        compute.fail_zone("us-east1-b");
        compute.add_instance("us-west1-a", "dispatch-abcdef", &[("dispatch-identifier", "team-a")]);
        compute.add_instance("us-west1-a", "other", &[("dispatch-identifier", "team-b")]);
        let provider = provider(compute);

        assert_eq!(provider.list_instances().await.len(), 2);
        let jobs = provider.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "dispatch-abcdef");
        assert!(!provider.check_connection().await);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_creates_waits_and_pools_instance() {
        let compute = Arc::new(ScriptedCompute::new());
        compute.complete_inserts_with_ip("10.1.0.7");
        let provider = provider(compute.clone());

        let instance = provider
            .acquire_instance("job-1", &Params::new())
            .await
            .expect("instance acquired");
        assert_eq!(instance.address().to_string(), "10.1.0.7");
        assert!(provider.instance(instance.name()).await.is_some());

        provider.release_instance(instance.name()).await;
        assert!(provider.instance(instance.name()).await.is_none());
        assert_eq!(compute.deleted(), vec![instance.name().to_string()]);
    }

    #[test]
    fn metadata_placeholders_are_replaced() {
        let mut metadata = BTreeMap::new();
        metadata.insert("user".to_string(), "alice".to_string());
        assert_eq!(
            substitute_metadata("home=/home/${user} keep=${other}", &metadata),
            "home=/home/alice keep=${other}"
        );
    }
}
