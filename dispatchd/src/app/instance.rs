// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Backend-agnostic execution environment bound to one job at a time.
//!
//! Every stage goes through [`Instance::run_op`], which captures an operation token
//! right before the automation call and validates it right after. A result obtained
//! while the instance was replaced, restarted or declared unreachable is reported as
//! [`StageFailure::StaleOperation`] no matter what the runner said.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};

use crate::app::executor::RemoteExecutor;
use crate::app::ports::Operation;
use crate::app::services::params::merge_params;
use crate::app::services::paths::{
    self, LOGS_DIR, LOGS_SYNC_SCRIPT, StorageLayout, persist_loop_script_name,
    persist_script_name, with_trailing_slash,
};
use crate::app::services::shell::shell_command;
use crate::app::services::token::TokenGuard;
use crate::app::types::{
    Address, BackendKind, CodeItem, DataItem, EnvKind, JobSpec, Params, StageFailure,
    StageOutcome,
};

const PERSIST_INTERVAL_SECS: u64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceBackend {
    Local,
    Cloud { project: String, zone: String },
}

impl InstanceBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            InstanceBackend::Local => BackendKind::Local,
            InstanceBackend::Cloud { .. } => BackendKind::Gcp,
        }
    }
}

struct Health {
    misses: AtomicU32,
    /// Consecutive misses before the instance is declared unreachable; 0 disables.
    threshold: u32,
    unreachable: watch::Sender<bool>,
}

pub struct Instance {
    name: String,
    address: Address,
    provider: String,
    backend: InstanceBackend,
    layout: StorageLayout,
    vars: Params,
    tokens: TokenGuard,
    health: Health,
    executor: Arc<RemoteExecutor>,
    persist_started: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("provider", &self.provider)
            .field("backend", &self.backend)
            .field("generation", &self.tokens.current())
            .finish()
    }
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        address: Address,
        provider: impl Into<String>,
        backend: InstanceBackend,
        layout: StorageLayout,
        vars: Params,
        heartbeat_threshold: u32,
        executor: Arc<RemoteExecutor>,
    ) -> Self {
        let (unreachable, _) = watch::channel(false);
        Self {
            name: name.into(),
            address,
            provider: provider.into(),
            backend,
            layout,
            vars,
            tokens: TokenGuard::new(),
            health: Health {
                misses: AtomicU32::new(0),
                threshold: heartbeat_threshold,
                unreachable,
            },
            executor,
            persist_started: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn backend(&self) -> &InstanceBackend {
        &self.backend
    }

    pub fn is_local(&self) -> bool {
        self.backend == InstanceBackend::Local
    }

    /// Marks every in-flight operation as stale.
    pub fn invalidate(&self) -> u64 {
        let generation = self.tokens.invalidate();
        tracing::debug!(instance = %self.name, generation, "instance identity invalidated");
        generation
    }

    pub fn is_unreachable(&self) -> bool {
        *self.health.unreachable.borrow()
    }

    /// Resolves once the instance is declared unreachable.
    pub async fn unreachable_signal(&self) {
        let mut rx = self.health.unreachable.subscribe();
        let closed = rx.wait_for(|unreachable| *unreachable).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Feeds one heartbeat result. Returns `true` when this miss crossed the
    /// threshold and the instance was just declared unreachable.
    pub fn record_heartbeat(&self, reachable: bool) -> bool {
        if reachable {
            self.health.misses.store(0, Ordering::Release);
            self.health.unreachable.send_if_modified(|unreachable| {
                let changed = *unreachable;
                *unreachable = false;
                changed
            });
            return false;
        }
        let misses = self.health.misses.fetch_add(1, Ordering::AcqRel) + 1;
        if self.health.threshold == 0 || misses < self.health.threshold || self.is_unreachable() {
            return false;
        }
        tracing::warn!(instance = %self.name, misses, "instance declared unreachable");
        self.invalidate();
        self.health.unreachable.send_replace(true);
        true
    }

    pub fn heartbeat_misses(&self) -> u32 {
        self.health.misses.load(Ordering::Acquire)
    }

    pub async fn run_op(
        &self,
        operation: Operation,
        parameters: Params,
        environment: BTreeMap<String, String>,
    ) -> StageOutcome {
        let timeout = self.executor.operation_timeout();
        self.run_op_with_timeout(operation, parameters, environment, Some(timeout))
            .await
    }

    pub async fn run_op_with_timeout(
        &self,
        operation: Operation,
        parameters: Params,
        environment: BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> StageOutcome {
        let label = operation.label();
        let parameters = match operation {
            Operation::Role { .. } => merge_params(&self.vars, &parameters),
            _ => parameters,
        };
        let token = self.tokens.issue();
        let outcome = self
            .executor
            .execute_with_timeout(self, operation, parameters, environment, timeout)
            .await;
        if !self.tokens.validate(token) {
            tracing::warn!(instance = %self.name, %label, "discarding stale operation result");
            return StageOutcome::failed(
                StageFailure::StaleOperation,
                format!(
                    "{label}: instance {} changed while the operation was running",
                    self.name
                ),
            );
        }
        outcome
    }

    fn backend_prefix(&self) -> &'static str {
        self.backend.kind().as_str()
    }

    /// Readiness check run once per local provider before the first job.
    pub async fn check_setup(&self) -> StageOutcome {
        let role = format!("{}/setup/machine", self.backend_prefix());
        let outcome = self.run_op(Operation::role(role), Params::new(), BTreeMap::new()).await;
        named(outcome, "machine setup check passed", "machine setup check failed")
    }

    pub async fn setup_data_item(&self, job_uid: &str, item: &DataItem) -> StageOutcome {
        let destination = paths::join(&self.layout.job_dir(job_uid), &item.path);
        let archive = self
            .layout
            .dataset_path(&item.name, &item.checksum, &item.extension);

        let outcome = self
            .run_op(
                Operation::module("file"),
                params(json!({"path": destination, "state": "directory"})),
                BTreeMap::new(),
            )
            .await;
        if !outcome.success {
            return named(outcome, "", &format!("failed to create {destination}"));
        }
        let outcome = self
            .run_op(
                Operation::module("unarchive"),
                params(json!({"src": archive, "dest": destination, "remote_src": true})),
                BTreeMap::new(),
            )
            .await;
        named(
            outcome,
            &format!("data item {} staged", item.name),
            &format!("failed to extract data archive {}", item.name),
        )
    }

    pub async fn unpack_job_dir(&self, job_uid: &str) -> StageOutcome {
        let source = with_trailing_slash(&self.layout.storage_job_dir(job_uid));
        let destination = with_trailing_slash(&self.layout.job_dir(job_uid));
        let outcome = self
            .run_op(
                Operation::module("copy"),
                params(json!({"src": source, "dest": destination, "remote_src": true})),
                BTreeMap::new(),
            )
            .await;
        named(outcome, "job directory unpacked", "failed to copy job directory")
    }

    pub async fn unpack_code(&self, job_uid: &str, item: &CodeItem) -> StageOutcome {
        let archive = self
            .layout
            .code_path(&item.run_name, &item.checksum, &item.extension);
        let outcome = self
            .run_op(
                Operation::module("unarchive"),
                params(json!({
                    "src": archive,
                    "dest": self.layout.job_dir(job_uid),
                    "remote_src": true,
                })),
                BTreeMap::new(),
            )
            .await;
        named(
            outcome,
            &format!("code {} unpacked", item.run_name),
            "failed to extract code archive",
        )
    }

    pub async fn setup_logs_folder(&self, job_uid: &str) -> StageOutcome {
        let job_dir = self.layout.job_dir(job_uid);
        let mut args = self.persist_args(
            job_uid,
            &paths::join(&job_dir, LOGS_DIR),
            &paths::join(&job_dir, LOGS_SYNC_SCRIPT),
            LOGS_DIR,
        );
        args.insert("persist_time".to_string(), json!(PERSIST_INTERVAL_SECS));
        let role = format!("{}/configure/persist_folder", self.backend_prefix());
        let outcome = self.run_op(Operation::role(role), args, BTreeMap::new()).await;
        named(
            outcome,
            "logs persistence configured",
            "failed to configure logs persistence",
        )
    }

    pub async fn setup_persist_folder(&self, job_uid: &str, persist: &str) -> StageOutcome {
        let job_dir = self.layout.job_dir(job_uid);
        let script = paths::join(&self.layout.sync_dir(job_uid), &persist_script_name(persist));
        let args = self.persist_args(job_uid, &paths::join(&job_dir, persist), &script, persist);
        let role = format!("{}/configure/persist_folder", self.backend_prefix());
        let outcome = self.run_op(Operation::role(role), args, BTreeMap::new()).await;
        named(
            outcome,
            &format!("persistence configured for {persist}"),
            &format!("failed to set up persist folder {persist}"),
        )
    }

    fn persist_args(&self, job_uid: &str, folder: &str, script: &str, relative: &str) -> Params {
        let bucket = paths::join(&self.layout.storage_job_dir(job_uid), relative);
        params(json!({
            "persist_folder_path": with_trailing_slash(folder),
            "sync_folder_path": self.layout.sync_dir(job_uid),
            "sync_logs_path": self.layout.sync_log(job_uid),
            "persist_script_path": script,
            "bucket_path": with_trailing_slash(&bucket),
        }))
    }

    /// Starts the background persistence loop once per job on this instance.
    pub async fn start_persist(&self, job_uid: &str) -> StageOutcome {
        if self.persist_started.lock().await.contains(job_uid) {
            return StageOutcome::ok("persistence loop already running");
        }
        let loop_name = persist_loop_script_name(job_uid);
        let args = params(json!({
            "sync_folder_path": self.layout.sync_dir(job_uid),
            "sync_logs_path": self.layout.sync_log(job_uid),
            "persist_script_path": self.layout.persist_all_script(job_uid),
            "unique_persist_all_script_name": loop_name,
            "persist_loop_script_path": paths::join(&self.layout.sync_dir(job_uid), &loop_name),
        }));
        let role = format!("{}/configure/start_persist", self.backend_prefix());
        let outcome = self.run_op(Operation::role(role), args, BTreeMap::new()).await;
        if outcome.success {
            self.persist_started.lock().await.insert(job_uid.to_string());
        }
        named(
            outcome,
            "persistence loop started",
            "failed to start persistence of directories",
        )
    }

    /// Unsupported environment kinds fail here without contacting the instance.
    pub async fn setup_dependency_manager(&self, spec: &JobSpec) -> StageOutcome {
        let kind = match spec.run.env_type.parse::<EnvKind>() {
            Ok(kind) => kind,
            Err(message) => return StageOutcome::failed(StageFailure::Configuration, message),
        };
        let job_dir = self.layout.job_dir(&spec.job_uid);
        let args = params(json!({
            "environment_file": paths::join(&job_dir, &spec.run.env_file),
            "activate_file": self.layout.activate_file(&spec.job_uid),
            "job_dir_path": job_dir,
        }));
        let role = format!("run/{}/setup_{}", self.backend_prefix(), kind.as_str());
        let outcome = self.run_op(Operation::role(role), args, BTreeMap::new()).await;
        named(
            outcome,
            &format!("{} environment initialized", kind.as_str()),
            "failed to initialize environment manager",
        )
    }

    /// Runs the ordered setup stages, stopping at the first failure.
    #[tracing::instrument(skip_all, fields(instance = %self.name, job_uid = %spec.job_uid))]
    pub async fn setup_job(&self, spec: &JobSpec) -> StageOutcome {
        let uid = spec.job_uid.as_str();
        for item in &spec.data {
            let outcome = self.setup_data_item(uid, item).await;
            if !outcome.success {
                return outcome;
            }
        }
        let outcome = self.unpack_job_dir(uid).await;
        if !outcome.success {
            return outcome;
        }
        for item in &spec.code {
            let outcome = self.unpack_code(uid, item).await;
            if !outcome.success {
                return outcome;
            }
        }
        let outcome = self.setup_logs_folder(uid).await;
        if !outcome.success {
            return outcome;
        }
        for persist in &spec.persist {
            let outcome = self.setup_persist_folder(uid, persist).await;
            if !outcome.success {
                return outcome;
            }
        }
        let outcome = self.start_persist(uid).await;
        if !outcome.success {
            return outcome;
        }
        self.setup_dependency_manager(spec).await
    }

    /// Installs provider-level dependencies. Local hosts are prepared by the readiness
    /// check and skip this stage.
    pub async fn install_dependencies(&self, dependencies: &[String]) -> StageOutcome {
        if self.is_local() {
            return StageOutcome::ok("no installs needed on local host");
        }
        for dependency in dependencies {
            let role = format!("{}/install/{dependency}", self.backend_prefix());
            let outcome = self.run_op(Operation::role(role), Params::new(), BTreeMap::new()).await;
            if !outcome.success {
                return named(outcome, "", &format!("failed to install {dependency}"));
            }
        }
        StageOutcome::ok(format!("{} dependencies installed", dependencies.len()))
    }

    pub async fn execute_command(&self, spec: &JobSpec, timeout: Option<Duration>) -> StageOutcome {
        let args = params(json!({
            "run_command": spec.run.cmd,
            "job_dir_path": self.layout.job_dir(&spec.job_uid),
            "activate_file": self.layout.activate_file(&spec.job_uid),
        }));
        let role = format!("run/{}/cmd", self.backend_prefix());
        // Without a run timeout only heartbeat loss bounds the command.
        let outcome = self
            .run_op_with_timeout(Operation::role(role), args, spec.run.env.clone(), timeout)
            .await;
        named(
            outcome,
            "command finished",
            &format!("failed to run command properly: {}", spec.run.cmd),
        )
    }

    /// Runs the job command and flushes persisted outputs once more on success.
    #[tracing::instrument(skip_all, fields(instance = %self.name, job_uid = %spec.job_uid))]
    pub async fn run_job(&self, spec: &JobSpec, timeout: Option<Duration>) -> StageOutcome {
        let outcome = self.execute_command(spec, timeout).await;
        if !outcome.success {
            return outcome;
        }
        let script = self.layout.persist_all_script(&spec.job_uid);
        let outcome = self
            .run_op(
                Operation::shell(shell_command("bash", &[&script])),
                Params::new(),
                BTreeMap::new(),
            )
            .await;
        named(outcome, "job completed", "failed to run final sync")
    }

    /// Stops the job's persistence loop. Never fails: a missing process is fine.
    pub async fn cleanup_job(&self, job_uid: &str) -> StageOutcome {
        let loop_name = persist_loop_script_name(job_uid);
        let outcome = self
            .run_op(
                Operation::shell(shell_command("killall", &[&loop_name])),
                Params::new(),
                BTreeMap::new(),
            )
            .await;
        if !outcome.success {
            tracing::debug!(instance = %self.name, %job_uid, message = %outcome.message, "persistence loop stop reported failure");
        }
        self.persist_started.lock().await.remove(job_uid);
        StageOutcome::ok("cleaned up job")
    }
}

/// Replaces the executor's generic message with a stage-specific one, keeping the
/// failure class and diagnostics. Staleness keeps its own message.
fn named(mut outcome: StageOutcome, ok: &str, failed: &str) -> StageOutcome {
    if outcome.success {
        if !ok.is_empty() {
            outcome.message = ok.to_string();
        }
    } else if !outcome.is_stale() && outcome.failure != Some(StageFailure::Unreachable) {
        outcome.message = format!("{failed}: {}", outcome.message);
    }
    outcome
}

fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}
