// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use time::Duration as TimeDuration;
use tokio::sync::Mutex;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::instance::Instance;
use crate::app::ports::{ClockPort, JobStorePort, NetworkProbePort, TelemetryEvent, TelemetryPort};
use crate::app::providers::Provider;
use crate::app::services::{lifecycle, paths};
use crate::app::types::{
    CloudImage, CloudInstance, CreatedInstance, InstanceSummary, JobRecord, JobSpec, JobState,
    Params, StageOutcome,
};

/// Orchestrator-wide knobs resolved from configuration.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorPolicy {
    pub max_dispatch_attempts: u32,
    pub heartbeat_port: u16,
    pub stale_after: TimeDuration,
    pub cleanup_grace: TimeDuration,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            max_dispatch_attempts: 2,
            heartbeat_port: 9991,
            stale_after: TimeDuration::days(1),
            cleanup_grace: TimeDuration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub abandoned: usize,
    pub reclaimed: usize,
}

#[derive(Clone)]
pub struct UseCases {
    pub(crate) jobs: Arc<dyn JobStorePort>,
    pub(crate) providers: Arc<BTreeMap<String, Arc<Provider>>>,
    pub(crate) network: Arc<dyn NetworkProbePort>,
    pub(crate) clock: Arc<dyn ClockPort>,
    pub(crate) telemetry: Arc<dyn TelemetryPort>,
    pub(crate) policy: OrchestratorPolicy,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl UseCases {
    pub fn new(
        jobs: Arc<dyn JobStorePort>,
        providers: Vec<Provider>,
        network: Arc<dyn NetworkProbePort>,
        clock: Arc<dyn ClockPort>,
        telemetry: Arc<dyn TelemetryPort>,
        policy: OrchestratorPolicy,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.name().to_string(), Arc::new(p)))
            .collect();
        Self {
            jobs,
            providers: Arc::new(providers),
            network,
            clock,
            telemetry,
            policy,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn provider(&self, name: &str) -> AppResult<Arc<Provider>> {
        self.providers.get(name).cloned().ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("provider '{name}' is not configured"),
            )
        })
    }

    fn selected_providers(&self, name: Option<&str>) -> AppResult<Vec<Arc<Provider>>> {
        match name {
            Some(name) => Ok(vec![self.provider(name)?]),
            None => Ok(self.providers.values().cloned().collect()),
        }
    }

    /// Makes sure every cloud provider can reach its instances. Failures are logged
    /// and retried on the next acquisition.
    pub async fn prepare_providers(&self) {
        for provider in self.providers.values() {
            if !provider.check_connection().await {
                tracing::warn!(provider = %provider.name(), "provider connection check failed");
            }
            if let Err(err) = provider.ensure_network_access().await {
                tracing::warn!(provider = %provider.name(), error = %err, "network access setup failed");
            }
        }
    }

    /// Validates and stores a job in `created`.
    pub async fn submit_job(
        &self,
        mut spec: JobSpec,
        provider_name: &str,
        overrides: Params,
        run_timeout: Option<StdDuration>,
    ) -> AppResult<JobRecord> {
        let provider = self.provider(provider_name)?;
        validate_spec(&mut spec)?;
        if self.jobs.get_job(&spec.job_uid).await?.is_some() {
            return Err(AppError::with_message(
                AppErrorKind::Conflict,
                codes::CONFLICT,
                format!("job {} already exists", spec.job_uid),
            ));
        }
        let mut record = JobRecord::new(spec, provider.name(), provider.kind(), self.clock.now_utc());
        record.overrides = overrides;
        record.run_timeout_secs = run_timeout.map(|t| t.as_secs());
        let stored = self.jobs.insert_job(&record).await?;
        self.emit("job.submitted", &stored, None);
        tracing::info!(job_uid = %stored.job_uid, provider = %provider_name, "job submitted");
        Ok(stored)
    }

    pub async fn get_job(&self, job_uid: &str) -> AppResult<JobRecord> {
        self.jobs.get_job(job_uid).await?.ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("job {job_uid} not found"),
            )
        })
    }

    pub async fn list_jobs(&self, provider: Option<&str>) -> AppResult<Vec<JobRecord>> {
        self.jobs.list_jobs(provider).await
    }

    pub async fn list_instances(&self, provider: Option<&str>) -> AppResult<Vec<InstanceSummary>> {
        let mut out = Vec::new();
        for provider in self.selected_providers(provider)? {
            out.extend(provider.list_instances().await);
        }
        Ok(out)
    }

    /// Cloud instances carrying this orchestrator's identifier label.
    pub async fn list_cloud_jobs(&self, provider: Option<&str>) -> AppResult<Vec<CloudInstance>> {
        let mut out = Vec::new();
        for provider in self.selected_providers(provider)? {
            out.extend(provider.list_jobs().await?);
        }
        Ok(out)
    }

    pub async fn list_images(&self, provider: &str) -> AppResult<Vec<CloudImage>> {
        self.provider(provider)?.list_images().await
    }

    /// Creates a standalone cloud instance and waits for the creation to finish.
    pub async fn create_instance(&self, provider: &str, overrides: &Params) -> AppResult<CreatedInstance> {
        let provider = self.provider(provider)?;
        let Provider::Gcp(gcp) = provider.as_ref() else {
            return Err(AppError::configuration(format!(
                "provider {} does not create instances",
                provider.name()
            )));
        };
        let created = gcp.create_instance(overrides).await?;
        gcp.wait_for_operation(&created.machine_zone, &created.operation_name)
            .await?;
        Ok(created)
    }

    /// Drives a `created` job through the whole pipeline. Any stage failure is
    /// job-fatal: the job ends `failed` and best-effort cleanup still runs.
    #[tracing::instrument(skip(self))]
    pub async fn run_job(&self, job_uid: &str) -> AppResult<JobRecord> {
        let mut job = self.get_job(job_uid).await?;
        if job.state != JobState::Created {
            return Err(AppError::with_message(
                AppErrorKind::FailedPrecondition,
                codes::INVALID_TRANSITION,
                format!("job {job_uid} is {} and cannot be dispatched", job.state),
            ));
        }
        let provider = match self.provider(&job.provider_name) {
            Ok(provider) => provider,
            Err(err) => {
                self.fail_job(&mut job, err.to_string()).await?;
                return Ok(job);
            }
        };

        self.advance(&mut job, JobState::DispatchingMachine).await?;
        let instance = match self.acquire_with_retry(&provider, &job).await {
            Ok(instance) => instance,
            Err(err) => {
                self.fail_job(&mut job, format!("instance acquisition failed: {err}"))
                    .await?;
                return Ok(job);
            }
        };
        job.instance_name = Some(instance.name().to_string());
        job.instance_address = Some(instance.address().to_string());

        let result = self.drive_pipeline(&provider, &instance, &mut job).await;
        match result {
            Ok(outcome) if outcome.success => {}
            Ok(outcome) => {
                tracing::warn!(%job_uid, message = %outcome.message, "stage failed");
                self.fail_job(&mut job, outcome.message).await?;
                self.cleanup_instance(&provider, &instance, &job).await;
            }
            Err(err) => {
                self.fail_job(&mut job, err.to_string()).await?;
                self.cleanup_instance(&provider, &instance, &job).await;
            }
        }
        Ok(job)
    }

    async fn drive_pipeline(
        &self,
        provider: &Provider,
        instance: &Instance,
        job: &mut JobRecord,
    ) -> AppResult<StageOutcome> {
        self.advance(job, JobState::DispatchingInstalls).await?;
        let outcome = instance.install_dependencies(&provider.dependencies()).await;
        if !outcome.success {
            return Ok(outcome);
        }

        self.advance(job, JobState::DispatchingSetup).await?;
        let outcome = instance.setup_job(&job.spec).await;
        if !outcome.success {
            return Ok(outcome);
        }

        self.advance(job, JobState::Running).await?;
        let timeout = job.run_timeout_secs.map(StdDuration::from_secs);
        let outcome = instance.run_job(&job.spec, timeout).await;
        if !outcome.success {
            return Ok(outcome);
        }

        self.advance(job, JobState::Cleanup).await?;
        instance.cleanup_job(&job.job_uid).await;
        provider.release_instance(instance.name()).await;
        job.message = Some(outcome.message.clone());
        self.advance(job, JobState::Finished).await?;
        self.jobs
            .mark_reclaimed(&job.job_uid, self.clock.now_utc())
            .await?;
        *job = self.get_job(&job.job_uid).await?;
        tracing::info!(job_uid = %job.job_uid, wall_time_secs = ?job.total_wall_time_secs, "job finished");
        Ok(outcome)
    }

    async fn acquire_with_retry(
        &self,
        provider: &Provider,
        job: &JobRecord,
    ) -> AppResult<Arc<Instance>> {
        let attempts = self.policy.max_dispatch_attempts.max(1);
        let mut attempt = 1;
        loop {
            match provider.acquire_instance(&job.job_uid, &job.overrides).await {
                Ok(instance) => return Ok(instance),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    tracing::warn!(job_uid = %job.job_uid, attempt, error = %err, "instance acquisition failed; retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn advance(&self, job: &mut JobRecord, next: JobState) -> AppResult<()> {
        lifecycle::transition(job, next, self.clock.now_utc())?;
        *job = self.jobs.update_job(job).await?;
        self.emit("job.state", job, None);
        Ok(())
    }

    /// Moves the job to `failed`. When another writer already settled the job, the
    /// stored terminal state wins.
    async fn fail_job(&self, job: &mut JobRecord, message: String) -> AppResult<()> {
        for _ in 0..2 {
            if job.state.is_terminal() {
                return Ok(());
            }
            let mut next = job.clone();
            lifecycle::transition(&mut next, JobState::Failed, self.clock.now_utc())?;
            next.message = Some(message.clone());
            match self.jobs.update_job(&next).await {
                Ok(stored) => {
                    *job = stored;
                    self.emit("job.state", job, Some(message));
                    return Ok(());
                }
                Err(err) if err.kind() == AppErrorKind::Conflict => {
                    *job = self.get_job(&job.job_uid).await?;
                }
                Err(err) => return Err(err),
            }
        }
        Err(AppError::with_message(
            AppErrorKind::Conflict,
            codes::CONFLICT,
            format!("job {} kept changing while being failed", job.job_uid),
        ))
    }

    async fn cleanup_instance(&self, provider: &Provider, instance: &Instance, job: &JobRecord) {
        instance.cleanup_job(&job.job_uid).await;
        provider.release_instance(instance.name()).await;
        if let Err(err) = self
            .jobs
            .mark_reclaimed(&job.job_uid, self.clock.now_utc())
            .await
        {
            tracing::warn!(job_uid = %job.job_uid, error = %err, "failed to mark job reclaimed");
        }
    }

    /// Spawns a pipeline task for every `created` job not already being driven.
    pub async fn spawn_pending_jobs(&self) -> AppResult<usize> {
        let pending: Vec<JobRecord> = self
            .jobs
            .list_active_jobs()
            .await?
            .into_iter()
            .filter(|job| job.state == JobState::Created)
            .collect();
        let mut spawned = 0;
        for job in pending {
            if !self.in_flight.lock().await.insert(job.job_uid.clone()) {
                continue;
            }
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.run_job(&job.job_uid).await {
                    tracing::warn!(job_uid = %job.job_uid, error = %err, "job run aborted");
                }
                this.in_flight.lock().await.remove(&job.job_uid);
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    /// Probes the instance of every active job. An instance that crosses the miss
    /// threshold is declared unreachable and its job fails.
    pub async fn check_running_jobs(&self) -> AppResult<usize> {
        let jobs = self.jobs.list_active_jobs().await?;
        let mut failed = 0;
        for mut job in jobs {
            let Some(instance_name) = job.instance_name.clone() else {
                continue;
            };
            let Ok(provider) = self.provider(&job.provider_name) else {
                tracing::warn!(job_uid = %job.job_uid, provider = %job.provider_name, "provider missing for active job");
                continue;
            };
            let Some(instance) = provider.instance(&instance_name).await else {
                continue;
            };
            if instance.is_local() {
                continue;
            }
            let reachable = match self
                .network
                .check_host_reachable(instance.address(), self.policy.heartbeat_port)
                .await
            {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!(instance = %instance_name, error = %err, "heartbeat probe failed");
                    false
                }
            };
            instance.record_heartbeat(reachable);
            if !instance.is_unreachable() {
                continue;
            }
            self.telemetry.event(
                "instance.unreachable",
                TelemetryEvent {
                    job_uid: Some(job.job_uid.clone()),
                    provider: Some(job.provider_name.clone()),
                    instance: Some(instance_name.clone()),
                    state: None,
                    message: None,
                },
            );
            let message = format!(
                "instance {instance_name} unreachable after {} missed heartbeats",
                instance.heartbeat_misses()
            );
            if let Err(err) = self.fail_job(&mut job, message).await {
                tracing::warn!(job_uid = %job.job_uid, error = %err, "failed to fail unreachable job");
                continue;
            }
            failed += 1;
        }
        Ok(failed)
    }

    /// Fails abandoned jobs and cleans up terminal jobs whose cleanup window elapsed.
    pub async fn reclaim_jobs(&self) -> AppResult<ReclaimReport> {
        let mut report = ReclaimReport::default();
        let now = self.clock.now_utc();
        let in_flight = self.in_flight.lock().await.clone();

        for mut job in self.jobs.list_active_jobs().await? {
            if in_flight.contains(&job.job_uid)
                || !lifecycle::is_abandoned(&job, now, self.policy.stale_after)
            {
                continue;
            }
            let message = format!(
                "abandoned in {} with no progress since {}",
                job.state,
                job.timestamps.last_progress()
            );
            self.fail_job(&mut job, message).await?;
            report.abandoned += 1;
        }

        for job in self.jobs.list_unreclaimed_jobs().await? {
            if in_flight.contains(&job.job_uid)
                || !lifecycle::is_cleanup_eligible(&job, now, self.policy.cleanup_grace)
            {
                continue;
            }
            if let (Some(name), Ok(provider)) =
                (job.instance_name.as_deref(), self.provider(&job.provider_name))
            {
                if let Some(instance) = provider.instance(name).await {
                    instance.cleanup_job(&job.job_uid).await;
                }
                provider.release_instance(name).await;
            }
            self.jobs.mark_reclaimed(&job.job_uid, now).await?;
            self.emit("job.reclaimed", &job, None);
            report.reclaimed += 1;
        }
        Ok(report)
    }

    fn emit(&self, name: &'static str, job: &JobRecord, message: Option<String>) {
        self.telemetry.event(
            name,
            TelemetryEvent {
                job_uid: Some(job.job_uid.clone()),
                provider: Some(job.provider_name.clone()),
                instance: job.instance_name.clone(),
                state: Some(job.state.as_str()),
                message: message.or_else(|| job.message.clone()),
            },
        );
    }
}

/// Rejects malformed specs before anything is stored and normalizes job-relative paths.
fn validate_spec(spec: &mut JobSpec) -> AppResult<()> {
    let context = format!("job {}", spec.job_uid);
    if spec.job_uid.trim().is_empty() || spec.job_uid.contains('/') {
        return Err(AppError::configuration(format!(
            "invalid job_uid '{}'",
            spec.job_uid
        )));
    }
    if spec.run.cmd.trim().is_empty() {
        return Err(AppError::configuration("run.cmd must not be empty").with_context(context));
    }
    for item in &mut spec.data {
        if item.name.trim().is_empty() || item.checksum.trim().is_empty() {
            return Err(AppError::configuration("data items need a name and a checksum")
                .with_context(context));
        }
        item.path = paths::normalize_job_relative(&item.path)
            .map_err(|e| AppError::configuration(e).with_context(context.clone()))?;
    }
    for item in &spec.code {
        if item.run_name.trim().is_empty() || item.checksum.trim().is_empty() {
            return Err(AppError::configuration("code items need a run_name and a checksum")
                .with_context(context));
        }
    }
    for persist in &mut spec.persist {
        *persist = paths::normalize_job_relative(persist)
            .map_err(|e| AppError::configuration(e).with_context(context.clone()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::db::{JobDb, SqliteJobStore};
    use crate::app::ports::NoopTelemetry;
    use crate::app::providers::{GcpProvider, ProviderDeps};
    use crate::app::test_support::{
        FixedClock, RecordingAutomation, ScriptedCompute, ScriptedNetwork, provider_deps, runtime,
        sample_spec, settings,
    };
    use crate::app::types::BackendKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use time::OffsetDateTime;

    /// SQLite store that can be told to reject updates for chosen jobs.
    struct FlakyStore {
        inner: SqliteJobStore,
        broken: StdMutex<HashSet<String>>,
    }

    impl FlakyStore {
        fn break_updates(&self, job_uid: &str) {
            self.broken.lock().unwrap().insert(job_uid.to_string());
        }
    }

    #[async_trait]
    impl JobStorePort for FlakyStore {
        async fn insert_job(&self, record: &JobRecord) -> AppResult<JobRecord> {
            self.inner.insert_job(record).await
        }
        async fn get_job(&self, job_uid: &str) -> AppResult<Option<JobRecord>> {
            self.inner.get_job(job_uid).await
        }
        async fn update_job(&self, record: &JobRecord) -> AppResult<JobRecord> {
            if self.broken.lock().unwrap().contains(&record.job_uid) {
                return Err(AppError::with_message(
                    AppErrorKind::Internal,
                    codes::INTERNAL_ERROR,
                    "disk I/O error",
                ));
            }
            self.inner.update_job(record).await
        }
        async fn list_jobs(&self, provider_name: Option<&str>) -> AppResult<Vec<JobRecord>> {
            self.inner.list_jobs(provider_name).await
        }
        async fn list_active_jobs(&self) -> AppResult<Vec<JobRecord>> {
            self.inner.list_active_jobs().await
        }
        async fn list_unreclaimed_jobs(&self) -> AppResult<Vec<JobRecord>> {
            self.inner.list_unreclaimed_jobs().await
        }
        async fn mark_reclaimed(&self, job_uid: &str, at: OffsetDateTime) -> AppResult<()> {
            self.inner.mark_reclaimed(job_uid, at).await
        }
    }

    struct Harness {
        usecases: UseCases,
        store: Arc<FlakyStore>,
        automation: Arc<RecordingAutomation>,
        clock: Arc<FixedClock>,
        network: Arc<ScriptedNetwork>,
        compute: Arc<ScriptedCompute>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(FlakyStore {
            inner: SqliteJobStore::new(JobDb::open_memory().await.expect("memory db")),
            broken: StdMutex::new(HashSet::new()),
        });
        let automation = Arc::new(RecordingAutomation::new());
        let clock = Arc::new(FixedClock::default());
        let network = Arc::new(ScriptedNetwork::new());
        let compute = Arc::new(ScriptedCompute::new());
        compute.complete_inserts_with_ip("10.2.0.4");

        let base = provider_deps(automation.clone());
        let deps = ProviderDeps {
            executor: base.executor,
            network: network.clone(),
            clock: clock.clone(),
        };
        let local = Provider::Local(crate::app::providers::LocalProvider::new(
            settings("local", BackendKind::Local),
            runtime(),
            deps.clone(),
        ));
        let mut gcp_settings = settings("gcp-main", BackendKind::Gcp);
        gcp_settings.project = Some("proj".to_string());
        gcp_settings.zones = vec!["us-east1-b".to_string()];
        gcp_settings.defaults = json!({
            "source-image": "family/debian-12",
            "instance-type": "e2-small",
            "dispatch-identifier": "team-a",
            "install": ["docker"],
        })
        .as_object()
        .cloned()
        .unwrap();
        let gcp = Provider::Gcp(
            GcpProvider::new(gcp_settings, runtime(), deps, compute.clone()).unwrap(),
        );

        let usecases = UseCases::new(
            store.clone(),
            vec![local, gcp],
            network.clone(),
            clock.clone(),
            Arc::new(NoopTelemetry),
            OrchestratorPolicy {
                max_dispatch_attempts: 2,
                heartbeat_port: 9991,
                stale_after: TimeDuration::hours(1),
                cleanup_grace: TimeDuration::ZERO,
            },
        );
        Harness {
            usecases,
            store,
            automation,
            clock,
            network,
            compute,
        }
    }

    #[tokio::test]
    async fn local_job_runs_to_finished() {
        let h = harness().await;
        h.usecases
            .submit_job(sample_spec("job-ok"), "local", Params::new(), None)
            .await
            .unwrap();

        let job = h.usecases.run_job("job-ok").await.unwrap();
        assert_eq!(job.state, JobState::Finished);
        assert!(job.total_wall_time_secs.unwrap() >= 0);
        assert_eq!(
            h.automation.labels(),
            vec![
                "role:local/setup/machine",
                "module:file",
                "module:unarchive",
                "module:copy",
                "module:unarchive",
                "role:local/configure/persist_folder",
                "role:local/configure/start_persist",
                "role:run/local/setup_pip",
                "role:run/local/cmd",
                "shell:bash '/scratch/job-ok/sync/persist_all.sh'",
                "shell:killall 'job-ok_persist_all_loop.sh'",
            ]
        );

        let ts = &job.timestamps;
        let ordered = [
            Some(ts.created_at),
            ts.dispatch_machine_at,
            ts.dispatch_installs_at,
            ts.dispatch_setup_at,
            ts.running_at,
            ts.cleanup_at,
            ts.completed_at,
        ];
        assert!(ordered.iter().all(Option::is_some));
        assert!(ordered.windows(2).all(|w| w[0] <= w[1]));
        assert!(job.timestamps.reclaimed_at.is_some());
    }

    #[tokio::test]
    async fn failed_code_unpack_fails_job_and_skips_later_stages() {
        let h = harness().await;
        h.automation.fail_on("module:unarchive");
        let mut spec = sample_spec("job-bad");
        spec.data.clear();
        h.usecases
            .submit_job(spec, "local", Params::new(), None)
            .await
            .unwrap();

        let job = h.usecases.run_job("job-bad").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(
            job.message
                .as_deref()
                .unwrap()
                .contains("failed to extract code archive")
        );
        let labels = h.automation.labels();
        assert!(!labels.iter().any(|l| l.contains("persist_folder")));
        assert!(!labels.iter().any(|l| l.contains("setup_pip")));
        assert_eq!(
            labels.last().map(String::as_str),
            Some("shell:killall 'job-bad_persist_all_loop.sh'")
        );
        assert!(job.timestamps.failed_at.is_some());
        assert!(job.timestamps.running_at.is_none());
    }

    #[tokio::test]
    async fn unsupported_env_is_rejected_without_remote_call() {
        let h = harness().await;
        let mut spec = sample_spec("job-env");
        spec.run.env_type = "poetry".to_string();
        h.usecases
            .submit_job(spec, "local", Params::new(), None)
            .await
            .unwrap();
        let job = h.usecases.run_job("job-env").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.message.unwrap().contains("poetry"));
        assert!(!h.automation.labels().iter().any(|l| l.starts_with("role:run/")));
    }

    #[tokio::test]
    async fn cloud_job_installs_dependencies_and_releases_instance() {
        let h = harness().await;
        h.usecases
            .submit_job(sample_spec("job-cloud"), "gcp-main", Params::new(), None)
            .await
            .unwrap();
        let job = h.usecases.run_job("job-cloud").await.unwrap();
        assert_eq!(job.state, JobState::Finished, "{:?}", job.message);
        assert_eq!(job.instance_address.as_deref(), Some("10.2.0.4"));
        let labels = h.automation.labels();
        assert_eq!(labels[0], "role:gcp/install/docker");
        assert!(labels.contains(&"role:run/gcp/setup_pip".to_string()));
        assert_eq!(h.compute.deleted(), vec![job.instance_name.unwrap()]);
        assert_eq!(h.compute.inserted_firewalls().len(), 1);
    }

    #[tokio::test]
    async fn configuration_errors_fail_before_any_cloud_call() {
        let h = harness().await;
        let overrides = json!({"dispatch-identifier": ""}).as_object().cloned().unwrap();
        h.usecases
            .submit_job(sample_spec("job-cfg"), "gcp-main", overrides, None)
            .await
            .unwrap();
        let job = h.usecases.run_job("job-cfg").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.message.unwrap().contains("dispatch-identifier"));
        assert_eq!(h.compute.call_count(), 0);
        assert!(h.automation.requests().is_empty());
    }

    #[tokio::test]
    async fn submit_rejects_escaping_paths_and_duplicates() {
        let h = harness().await;
        let mut spec = sample_spec("job-path");
        spec.persist = vec!["../../etc".to_string()];
        let err = h
            .usecases
            .submit_job(spec, "local", Params::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::CONFIGURATION_ERROR);

        h.usecases
            .submit_job(sample_spec("job-dup"), "local", Params::new(), None)
            .await
            .unwrap();
        let err = h
            .usecases
            .submit_job(sample_spec("job-dup"), "local", Params::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Conflict);

        let err = h
            .usecases
            .submit_job(sample_spec("job-x"), "nowhere", Params::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::NotFound);
    }

    #[tokio::test]
    async fn finished_job_cannot_be_run_again() {
        let h = harness().await;
        h.usecases
            .submit_job(sample_spec("job-twice"), "local", Params::new(), None)
            .await
            .unwrap();
        h.usecases.run_job("job-twice").await.unwrap();
        let err = h.usecases.run_job("job-twice").await.unwrap_err();
        assert_eq!(err.code(), codes::INVALID_TRANSITION);
    }

    #[tokio::test]
    async fn unreachable_instance_fails_running_job() {
        let h = harness().await;
        h.automation
            .delay_on("role:run/gcp/cmd", StdDuration::from_secs(3600));
        h.usecases
            .submit_job(sample_spec("job-hb"), "gcp-main", Params::new(), None)
            .await
            .unwrap();

        let runner = h.usecases.clone();
        let task = tokio::spawn(async move { runner.run_job("job-hb").await });
        loop {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            if h.usecases.get_job("job-hb").await.unwrap().state == JobState::Running {
                break;
            }
        }

        h.network.set_down("10.2.0.4", true);
        assert_eq!(h.usecases.check_running_jobs().await.unwrap(), 0);
        assert_eq!(h.usecases.check_running_jobs().await.unwrap(), 1);

        let job = task.await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.message.unwrap().contains("unreachable"));
        assert!(h.network.probes() >= 2);
    }

    #[tokio::test]
    async fn store_error_on_one_job_does_not_stop_heartbeat_pass() {
        let h = harness().await;
        h.automation
            .delay_on("role:run/gcp/cmd", StdDuration::from_secs(3600));
        let mut tasks = Vec::new();
        for uid in ["job-hb-a", "job-hb-b"] {
            h.usecases
                .submit_job(sample_spec(uid), "gcp-main", Params::new(), None)
                .await
                .unwrap();
            let runner = h.usecases.clone();
            tasks.push(tokio::spawn(async move { runner.run_job(uid).await }));
        }
        for uid in ["job-hb-a", "job-hb-b"] {
            while h.usecases.get_job(uid).await.unwrap().state != JobState::Running {
                tokio::time::sleep(StdDuration::from_millis(50)).await;
            }
        }

        h.store.break_updates("job-hb-a");
        h.network.set_down("10.2.0.4", true);
        assert_eq!(h.usecases.check_running_jobs().await.unwrap(), 0);
        assert_eq!(h.usecases.check_running_jobs().await.unwrap(), 1);

        let job = h.usecases.get_job("job-hb-b").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.message.unwrap().contains("unreachable"));
        assert_eq!(
            h.usecases.get_job("job-hb-a").await.unwrap().state,
            JobState::Running
        );
        for task in tasks {
            let _ = task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn abandoned_jobs_are_failed_and_then_reclaimed() {
        let h = harness().await;
        h.usecases
            .submit_job(sample_spec("job-old"), "local", Params::new(), None)
            .await
            .unwrap();

        let report = h.usecases.reclaim_jobs().await.unwrap();
        assert_eq!(report, ReclaimReport::default());

        h.clock.advance(TimeDuration::hours(2));
        let report = h.usecases.reclaim_jobs().await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.reclaimed, 1);

        let job = h.usecases.get_job("job-old").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.timestamps.reclaimed_at.is_some());
        assert_eq!(h.usecases.reclaim_jobs().await.unwrap(), ReclaimReport::default());
    }

    #[tokio::test]
    async fn pending_jobs_are_spawned_once() {
        let h = harness().await;
        h.usecases
            .submit_job(sample_spec("job-bg"), "local", Params::new(), None)
            .await
            .unwrap();
        assert_eq!(h.usecases.spawn_pending_jobs().await.unwrap(), 1);
        for _ in 0..100 {
            tokio::task::yield_now().await;
            let job = h.usecases.get_job("job-bg").await.unwrap();
            if job.state.is_terminal() {
                assert_eq!(job.state, JobState::Finished);
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("job never finished");
    }
}
