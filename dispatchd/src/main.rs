// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use anyhow::Context;
use tokio::time::Duration;

use crate::adapters::cli::Command;
use crate::app::executor::RemoteExecutor;
use crate::app::ports::{ClockPort, ComputeApiPort, NetworkProbePort};
use crate::app::providers::{PollPolicy, Provider, ProviderDeps, ProviderSettings, RuntimeSettings};
use crate::app::services::params::layered_defaults;
use crate::app::services::paths::StorageLayout;
use crate::app::types::{BackendKind, JobRecord};
use crate::app::usecases::{OrchestratorPolicy, UseCases};

mod adapters;
mod app;
mod config;
mod logging;

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => {
            log::info!(
                "config path: {} (source={}, present={})",
                path.display(),
                source.as_str(),
                report.config_file_present
            );
        }
        (Some(path), None) => {
            log::info!(
                "config path: {} (present={})",
                path.display(),
                report.config_file_present
            );
        }
        (None, _) => {
            log::info!("config path: (none)");
        }
    }
    log::info!(
        "config database_path: {} (source={})",
        report.database_path.value.display(),
        report.database_path.source.as_str()
    );
    log::info!(
        "config job_check_interval_secs: {} (source={})",
        report.job_check_interval_secs.value,
        report.job_check_interval_secs.source.as_str()
    );
    log::info!(
        "config heartbeat_port: {} (source={})",
        report.heartbeat_port.value,
        report.heartbeat_port.source.as_str()
    );
    log::info!(
        "config heartbeat_miss_threshold: {} (source={})",
        report.heartbeat_miss_threshold.value,
        report.heartbeat_miss_threshold.source.as_str()
    );
    log::info!(
        "config operation_timeout_secs: {} (source={})",
        report.operation_timeout_secs.value,
        report.operation_timeout_secs.source.as_str()
    );
    log::info!(
        "config verbose: {} (source={})",
        report.verbose.value,
        report.verbose.source.as_str()
    );
    log::info!("config providers: {}", report.providers.join(", "));
}

fn secs_to_time(secs: u64) -> time::Duration {
    time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn build_usecases(
    config: &config::Config,
    jobs: Arc<adapters::db::SqliteJobStore>,
) -> anyhow::Result<UseCases> {
    let automation = Arc::new(adapters::automation::AnsibleRunner::new(
        adapters::automation::AnsibleSettings {
            ansible_bin: config.automation.ansible_bin.clone(),
            playbook_bin: config.automation.playbook_bin.clone(),
            roles_path: config.automation.roles_path.clone(),
            remote_user: config.automation.remote_user.clone(),
            private_key_file: config.automation.private_key_file.clone(),
        },
    ));
    let executor = Arc::new(RemoteExecutor::new(
        automation,
        Duration::from_secs(config.operation_timeout_secs),
    ));
    let network: Arc<dyn NetworkProbePort> = Arc::new(adapters::network::NetworkAdapter::new());
    let clock: Arc<dyn ClockPort> = Arc::new(adapters::time::SystemClock::new());
    let deps = ProviderDeps {
        executor,
        network: network.clone(),
        clock: clock.clone(),
    };
    let runtime = RuntimeSettings {
        heartbeat_threshold: config.heartbeat_miss_threshold,
        heartbeat_port: config.heartbeat_port,
        poll: PollPolicy {
            interval: Duration::from_millis(config.poll_interval_ms),
            max_interval: Duration::from_millis(config.poll_max_interval_ms),
            deadline: Duration::from_secs(config.poll_deadline_secs),
        },
    };

    let mut providers = Vec::with_capacity(config.providers.len());
    for entry in &config.providers {
        let settings = ProviderSettings {
            name: entry.name.clone(),
            kind: entry.kind,
            defaults: layered_defaults(&config.defaults, entry.kind, &entry.name),
            layout: StorageLayout::new(entry.scratch_dir.clone(), entry.storage_dir.clone()),
            vars: entry.vars.clone(),
            project: entry.project.clone(),
            zones: entry.zones.clone(),
            firewall_rule_name: entry.firewall_rule_name.clone(),
            required_ports: entry.required_ports.clone(),
        };
        let compute: Option<Arc<dyn ComputeApiPort>> = match entry.kind {
            BackendKind::Local => None,
            BackendKind::Gcp => {
                let client = adapters::gcp::GcpComputeClient::from_env(&entry.access_token_env)
                    .with_context(|| format!("provider {}", entry.name))?;
                Some(Arc::new(client) as Arc<dyn ComputeApiPort>)
            }
        };
        providers.push(
            Provider::build(settings, runtime, deps.clone(), compute)
                .with_context(|| format!("failed to set up provider {}", entry.name))?,
        );
    }

    let policy = OrchestratorPolicy {
        max_dispatch_attempts: config.max_dispatch_attempts,
        heartbeat_port: config.heartbeat_port,
        stale_after: secs_to_time(config.stale_job_secs),
        cleanup_grace: secs_to_time(config.cleanup_grace_secs),
    };
    Ok(UseCases::new(
        jobs,
        providers,
        network,
        clock,
        Arc::new(adapters::telemetry::TracingTelemetry::new()),
        policy,
    ))
}

fn print_job(job: &JobRecord) {
    println!(
        "{}\t{}\t{}\t{}",
        job.job_uid,
        job.state,
        job.provider_name,
        job.instance_name.as_deref().unwrap_or("-")
    );
    if let Some(message) = &job.message {
        println!("  {message}");
    }
}

async fn serve(usecases: UseCases, interval: Duration) -> anyhow::Result<()> {
    usecases.prepare_providers().await;
    let mut ticker = tokio::time::interval(interval);
    log::info!("dispatch loop running every {}s", interval.as_secs());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = usecases.spawn_pending_jobs().await {
                    tracing::warn!(error = %err, "dispatching pending jobs failed");
                }
                if let Err(err) = usecases.check_running_jobs().await {
                    tracing::warn!(error = %err, "job check failed");
                }
                match usecases.reclaim_jobs().await {
                    Ok(report) if report.abandoned + report.reclaimed > 0 => {
                        tracing::info!(abandoned = report.abandoned, reclaimed = report.reclaimed, "reclaim pass");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "reclaim failed"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                log::info!("shutting down");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let command = opts.command.unwrap_or(Command::Serve {
        job_check_interval_secs: None,
        heartbeat_port: None,
    });
    let (job_check_interval_secs, heartbeat_port) = match &command {
        Command::Serve {
            job_check_interval_secs,
            heartbeat_port,
        } => (*job_check_interval_secs, *heartbeat_port),
        _ => (None, None),
    };
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            database_path: opts.database_path,
            job_check_interval_secs,
            heartbeat_port,
            verbose: parsed.verbose_override,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);
    config::ensure_database_dir(&config.database_path)?;
    let db = adapters::db::JobDb::open(&config.database_path)
        .await
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    let store = Arc::new(adapters::db::SqliteJobStore::new(db));
    let usecases = build_usecases(&config, store)?;

    match command {
        Command::Submit {
            file,
            provider,
            params,
            run_timeout_secs,
            run,
        } => {
            let spec = adapters::cli::load_job_spec(&file)?;
            let overrides = adapters::cli::parse_params(&params)?;
            let job = usecases
                .submit_job(
                    spec,
                    &provider,
                    overrides,
                    run_timeout_secs.map(Duration::from_secs),
                )
                .await?;
            let job = if run {
                usecases.run_job(&job.job_uid).await?
            } else {
                job
            };
            print_job(&job);
        }
        Command::Run { job_uid } => print_job(&usecases.run_job(&job_uid).await?),
        Command::ListJobs { provider } => {
            for job in usecases.list_jobs(provider.as_deref()).await? {
                print_job(&job);
            }
        }
        Command::ListInstances { provider } => {
            for instance in usecases.list_instances(provider.as_deref()).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    instance.name, instance.address, instance.provider, instance.status
                );
            }
        }
        Command::ListCloudJobs { provider } => {
            for instance in usecases.list_cloud_jobs(provider.as_deref()).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    instance.name,
                    instance.zone,
                    instance.status,
                    instance.external_ip.as_deref().unwrap_or("-")
                );
            }
        }
        Command::ListImages { provider } => {
            for image in usecases.list_images(&provider).await? {
                println!("{}\t{}", image.name, image.family.as_deref().unwrap_or("-"));
            }
        }
        Command::CreateInstance { provider, params } => {
            let overrides = adapters::cli::parse_params(&params)?;
            let created = usecases.create_instance(&provider, &overrides).await?;
            println!(
                "{}\t{}\t{}",
                created.machine_name, created.machine_zone, created.machine_project
            );
        }
        Command::Reclaim => {
            let report = usecases.reclaim_jobs().await?;
            println!(
                "abandoned: {}\treclaimed: {}",
                report.abandoned, report.reclaimed
            );
        }
        Command::Serve { .. } => {
            serve(usecases, Duration::from_secs(config.job_check_interval_secs)).await?;
        }
    }
    Ok(())
}
