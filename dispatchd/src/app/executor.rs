// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::app::instance::Instance;
use crate::app::ports::{
    AutomationPort, AutomationReport, AutomationRequest, AutomationStatus, AutomationTarget,
    Operation,
};
use crate::app::types::{Params, StageFailure, StageOutcome};

/// Runs one automation unit against an instance and folds every failure mode
/// (runner error, reported failure, timeout, lost instance) into a [`StageOutcome`].
pub struct RemoteExecutor {
    automation: Arc<dyn AutomationPort>,
    operation_timeout: Duration,
}

impl RemoteExecutor {
    pub fn new(automation: Arc<dyn AutomationPort>, operation_timeout: Duration) -> Self {
        Self {
            automation,
            operation_timeout,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    #[tracing::instrument(
        skip_all,
        fields(instance = %instance.name(), operation = %operation.label())
    )]
    pub async fn execute_with_timeout(
        &self,
        instance: &Instance,
        operation: Operation,
        parameters: Params,
        environment: BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> StageOutcome {
        let label = operation.label();
        if instance.is_unreachable() {
            return StageOutcome::failed(
                StageFailure::Unreachable,
                format!("instance {} is unreachable; skipped {label}", instance.name()),
            );
        }

        let request = AutomationRequest {
            target: AutomationTarget {
                host: instance.address().to_string(),
                local: instance.is_local(),
            },
            operation,
            parameters,
            environment,
            timeout,
        };

        let run = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, self.automation.run(&request)).await,
                None => Ok(self.automation.run(&request).await),
            }
        };
        let result = tokio::select! {
            result = run => result,
            _ = instance.unreachable_signal() => {
                tracing::warn!("instance became unreachable during {label}");
                return StageOutcome::failed(
                    StageFailure::Unreachable,
                    format!("instance {} became unreachable during {label}", instance.name()),
                );
            }
        };

        match result {
            Err(_) => {
                let secs = timeout.unwrap_or_default().as_secs();
                tracing::warn!(timeout_secs = secs, "operation timed out");
                StageOutcome::failed(
                    StageFailure::RemoteOperation,
                    format!("{label} timed out after {secs}s"),
                )
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "automation runner failed");
                StageOutcome::failed(
                    StageFailure::RemoteOperation,
                    format!("{label} could not be run: {err}"),
                )
            }
            Ok(Ok(report)) => outcome_from_report(&label, report),
        }
    }
}

fn outcome_from_report(label: &str, report: AutomationReport) -> StageOutcome {
    let diagnostics = json!({
        "stats": report.stats,
        "events": report.events,
    });
    match report.status {
        AutomationStatus::Successful => {
            StageOutcome::ok(format!("{label} succeeded")).with_diagnostics(diagnostics)
        }
        AutomationStatus::Failed => {
            tracing::debug!(%label, "operation reported failure");
            StageOutcome::failed(StageFailure::RemoteOperation, format!("{label} failed"))
                .with_diagnostics(diagnostics)
        }
        AutomationStatus::TimedOut => StageOutcome::failed(
            StageFailure::RemoteOperation,
            format!("{label} timed out in the automation runner"),
        )
        .with_diagnostics(diagnostics),
    }
}
