// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Hand-written fakes for the app ports.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::macros::datetime;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::executor::RemoteExecutor;
use crate::app::ports::{
    AutomationPort, AutomationReport, AutomationRequest, AutomationStatus, ClockPort,
    ComputeApiPort, NetworkProbePort,
};
use crate::app::providers::{PollPolicy, ProviderDeps, ProviderSettings, RuntimeSettings};
use crate::app::services::paths::StorageLayout;
use crate::app::types::{
    Address, BackendKind, CloudImage, CloudInstance, CodeItem, DataItem, FirewallRule, JobSpec,
    Params, RunSpec, ZoneOperation,
};

type Hook = Box<dyn Fn() + Send + Sync>;

/// Records every request and succeeds unless told otherwise.
#[derive(Default)]
pub struct RecordingAutomation {
    requests: Mutex<Vec<AutomationRequest>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    hook: Mutex<Option<Hook>>,
}

impl RecordingAutomation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, label: &str) {
        self.failing.lock().unwrap().insert(label.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn delay_on(&self, label: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(label.to_string(), delay);
    }

    /// Runs `hook` while each operation is in flight.
    pub fn on_run(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn requests(&self) -> Vec<AutomationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|request| request.operation.label())
            .collect()
    }
}

#[async_trait]
impl AutomationPort for RecordingAutomation {
    async fn run(&self, request: &AutomationRequest) -> AppResult<AutomationReport> {
        let label = request.operation.label();
        self.requests.lock().unwrap().push(request.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook();
        }
        let delay = self.delays.lock().unwrap().get(&label).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failed = self.failing.lock().unwrap().contains(&label);
        Ok(AutomationReport {
            status: if failed {
                AutomationStatus::Failed
            } else {
                AutomationStatus::Successful
            },
            stats: json!({"ok": u32::from(!failed), "failures": u32::from(failed)}),
            events: vec![format!("{label} ran")],
        })
    }
}

#[derive(Default)]
struct ComputeState {
    firewalls: Vec<FirewallRule>,
    inserted_firewalls: Vec<FirewallRule>,
    instances: HashMap<String, Vec<CloudInstance>>,
    failing_zones: HashSet<String>,
    operations: HashMap<String, (u32, Option<Value>)>,
    insert_ip: Option<String>,
    deleted: Vec<String>,
}

/// In-memory compute API with scripted operations.
#[derive(Default)]
pub struct ScriptedCompute {
    state: Mutex<ComputeState>,
    calls: AtomicUsize,
}

impl ScriptedCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_firewall(&self, name: &str) {
        self.state.lock().unwrap().firewalls.push(FirewallRule {
            name: name.to_string(),
            description: String::new(),
            allowed: Vec::new(),
            target_tags: Vec::new(),
        });
    }

    pub fn inserted_firewalls(&self) -> Vec<FirewallRule> {
        self.state.lock().unwrap().inserted_firewalls.clone()
    }

    pub fn fail_zone(&self, zone: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_zones
            .insert(zone.to_string());
    }

    pub fn add_instance(&self, zone: &str, name: &str, labels: &[(&str, &str)]) {
        let instance = CloudInstance {
            name: name.to_string(),
            zone: zone.to_string(),
            status: "RUNNING".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            internal_ip: Some("10.0.0.2".to_string()),
            external_ip: None,
        };
        self.state
            .lock()
            .unwrap()
            .instances
            .entry(zone.to_string())
            .or_default()
            .push(instance);
    }

    /// The operation stays pending for `pending_polls` polls, then finishes.
    pub fn script_operation(&self, name: &str, pending_polls: u32, error: Option<Value>) {
        self.state
            .lock()
            .unwrap()
            .operations
            .insert(name.to_string(), (pending_polls, error));
    }

    /// Inserted instances show up in listings with this external address.
    pub fn complete_inserts_with_ip(&self, ip: &str) {
        self.state.lock().unwrap().insert_ip = Some(ip.to_string());
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ComputeApiPort for ScriptedCompute {
    async fn list_firewalls(&self, _project: &str) -> AppResult<Vec<FirewallRule>> {
        self.touch();
        tokio::task::yield_now().await;
        Ok(self.state.lock().unwrap().firewalls.clone())
    }

    async fn insert_firewall(&self, _project: &str, rule: &FirewallRule) -> AppResult<String> {
        self.touch();
        let mut state = self.state.lock().unwrap();
        state.firewalls.push(rule.clone());
        state.inserted_firewalls.push(rule.clone());
        Ok(format!("op-firewall-{}", rule.name))
    }

    async fn list_instances(&self, _project: &str, zone: &str) -> AppResult<Vec<CloudInstance>> {
        self.touch();
        let state = self.state.lock().unwrap();
        if state.failing_zones.contains(zone) {
            return Err(AppError::with_message(
                AppErrorKind::Unavailable,
                codes::REMOTE_ERROR,
                format!("zone {zone} unavailable"),
            ));
        }
        Ok(state.instances.get(zone).cloned().unwrap_or_default())
    }

    async fn insert_instance(&self, _project: &str, zone: &str, body: &Value) -> AppResult<String> {
        self.touch();
        let name = body["name"].as_str().unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        if let Some(ip) = state.insert_ip.clone() {
            let labels: BTreeMap<String, String> = body["labels"]
                .as_object()
                .map(|labels| {
                    labels
                        .iter()
                        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                        .collect()
                })
                .unwrap_or_default();
            state
                .instances
                .entry(zone.to_string())
                .or_default()
                .push(CloudInstance {
                    name: name.clone(),
                    zone: zone.to_string(),
                    status: "RUNNING".to_string(),
                    labels,
                    internal_ip: Some("10.0.0.9".to_string()),
                    external_ip: Some(ip),
                });
        }
        Ok(format!("op-insert-{name}"))
    }

    async fn delete_instance(&self, _project: &str, zone: &str, name: &str) -> AppResult<String> {
        self.touch();
        let mut state = self.state.lock().unwrap();
        if let Some(items) = state.instances.get_mut(zone) {
            items.retain(|inst| inst.name != name);
        }
        state.deleted.push(name.to_string());
        Ok(format!("op-delete-{name}"))
    }

    async fn list_images(&self, _project: &str) -> AppResult<Vec<CloudImage>> {
        self.touch();
        Ok(vec![CloudImage {
            name: "dispatch-base-v1".to_string(),
            family: Some("dispatch-base".to_string()),
        }])
    }

    async fn get_zone_operation(
        &self,
        _project: &str,
        _zone: &str,
        operation: &str,
    ) -> AppResult<ZoneOperation> {
        self.touch();
        let mut state = self.state.lock().unwrap();
        let (done, error) = match state.operations.get_mut(operation) {
            Some((pending, _)) if *pending > 0 => {
                *pending -= 1;
                (false, None)
            }
            Some((_, error)) => (true, error.clone()),
            None => (true, None),
        };
        let raw = json!({
            "name": operation,
            "status": if done { "DONE" } else { "RUNNING" },
        });
        Ok(ZoneOperation {
            name: operation.to_string(),
            done,
            error,
            raw,
        })
    }
}

pub struct FixedClock {
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(datetime!(2026-03-01 10:00 UTC))
    }
}

impl ClockPort for FixedClock {
    fn now_utc(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

/// Answers heartbeats from a per-host table; unknown hosts are reachable.
#[derive(Default)]
pub struct ScriptedNetwork {
    down: Mutex<HashSet<String>>,
    probes: AtomicUsize,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, host: &str, down: bool) {
        let mut hosts = self.down.lock().unwrap();
        if down {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkProbePort for ScriptedNetwork {
    async fn check_host_reachable(&self, address: &Address, _port: u16) -> AppResult<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(!self.down.lock().unwrap().contains(&address.to_string()))
    }
}

pub fn runtime() -> RuntimeSettings {
    RuntimeSettings {
        heartbeat_threshold: 2,
        heartbeat_port: 9991,
        poll: PollPolicy {
            interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(30),
        },
    }
}

pub fn settings(name: &str, kind: BackendKind) -> ProviderSettings {
    ProviderSettings {
        name: name.to_string(),
        kind,
        defaults: Params::new(),
        layout: StorageLayout::new("/scratch", "/storage"),
        vars: Params::new(),
        project: None,
        zones: Vec::new(),
        firewall_rule_name: "dispatch-firewall".to_string(),
        required_ports: vec![9991],
    }
}

pub fn provider_deps(automation: Arc<RecordingAutomation>) -> ProviderDeps {
    ProviderDeps {
        executor: Arc::new(RemoteExecutor::new(automation, Duration::from_secs(60))),
        network: Arc::new(ScriptedNetwork::new()),
        clock: Arc::new(FixedClock::default()),
    }
}

/// One data item, one code item, no persist targets, pip environment.
pub fn sample_spec(job_uid: &str) -> JobSpec {
    JobSpec {
        job_uid: job_uid.to_string(),
        data: vec![DataItem {
            name: "mnist".to_string(),
            checksum: "c0ffee".to_string(),
            extension: ".tar".to_string(),
            path: "data/mnist".to_string(),
        }],
        code: vec![CodeItem {
            run_name: "train".to_string(),
            checksum: "abc123".to_string(),
            extension: ".tar.gz".to_string(),
        }],
        persist: Vec::new(),
        run: RunSpec {
            env_type: "pip".to_string(),
            env_file: "requirements.txt".to_string(),
            env: BTreeMap::new(),
            cmd: "python train.py".to_string(),
        },
    }
}
