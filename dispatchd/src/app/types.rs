// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

/// Parameter map handed to providers and automation roles.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Address for an instance: either hostname or IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Address {
    Hostname(String),
    Ip(IpAddr),
}

impl Address {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Hostname(trimmed.to_string()),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Hostname(host) => write!(f, "{host}"),
            Address::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

/// Execution backend a provider (and its instances) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Gcp,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Gcp => "gcp",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "gcp" => Ok(Self::Gcp),
            other => Err(format!("{other} type for provider not supported")),
        }
    }
}

/// Dependency/environment manager a job declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKind {
    Conda,
    Pip,
    Docker,
}

impl EnvKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvKind::Conda => "conda",
            EnvKind::Pip => "pip",
            EnvKind::Docker => "docker",
        }
    }
}

impl FromStr for EnvKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "conda" => Ok(Self::Conda),
            "pip" => Ok(Self::Pip),
            "docker" => Ok(Self::Docker),
            other => Err(format!("unsupported environment kind: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItem {
    pub name: String,
    pub checksum: String,
    pub extension: String,
    /// Destination relative to the job directory.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeItem {
    pub run_name: String,
    pub checksum: String,
    pub extension: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Kept as text so unsupported kinds surface at the dependency stage.
    pub env_type: String,
    #[serde(default)]
    pub env_file: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub cmd: String,
}

/// Declarative job specification as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_uid: String,
    #[serde(default)]
    pub data: Vec<DataItem>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub code: Vec<CodeItem>,
    #[serde(default)]
    pub persist: Vec<String>,
    pub run: RunSpec,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<CodeItem>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(CodeItem),
        Many(Vec<CodeItem>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(item) => vec![item],
        OneOrMany::Many(items) => items,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    DispatchingMachine,
    DispatchingInstalls,
    DispatchingSetup,
    Running,
    Cleanup,
    Finished,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::DispatchingMachine => "dispatching_machine",
            JobState::DispatchingInstalls => "dispatching_installs",
            JobState::DispatchingSetup => "dispatching_setup",
            JobState::Running => "running",
            JobState::Cleanup => "cleanup",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "dispatching_machine" => Ok(Self::DispatchingMachine),
            "dispatching_installs" => Ok(Self::DispatchingInstalls),
            "dispatching_setup" => Ok(Self::DispatchingSetup),
            "running" => Ok(Self::Running),
            "cleanup" => Ok(Self::Cleanup),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Stage-entry timestamps. Once set, a timestamp is never cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobTimestamps {
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub dispatch_machine_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub dispatch_installs_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub dispatch_setup_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub running_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cleanup_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub failed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub reclaimed_at: Option<OffsetDateTime>,
}

impl JobTimestamps {
    pub fn new(created_at: OffsetDateTime) -> Self {
        Self {
            created_at,
            dispatch_machine_at: None,
            dispatch_installs_at: None,
            dispatch_setup_at: None,
            running_at: None,
            cleanup_at: None,
            completed_at: None,
            failed_at: None,
            reclaimed_at: None,
        }
    }

    /// Most recent progress marker, used to spot abandoned jobs.
    pub fn last_progress(&self) -> OffsetDateTime {
        [
            self.dispatch_machine_at,
            self.dispatch_installs_at,
            self.dispatch_setup_at,
            self.running_at,
            self.cleanup_at,
        ]
        .into_iter()
        .flatten()
        .fold(self.created_at, |acc, ts| acc.max(ts))
    }
}

/// Full stored job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub job_uid: String,
    pub spec: JobSpec,
    pub state: JobState,
    pub provider_name: String,
    pub provider_type: BackendKind,
    pub instance_name: Option<String>,
    pub instance_address: Option<String>,
    pub message: Option<String>,
    pub timestamps: JobTimestamps,
    pub total_wall_time_secs: Option<i64>,
    pub run_timeout_secs: Option<u64>,
    /// Call-site instance parameters given at submission.
    pub overrides: Params,
    /// Bumped on every successful write; used for update-if-unchanged.
    pub version: i64,
}

impl JobRecord {
    pub fn new(
        spec: JobSpec,
        provider_name: &str,
        provider_type: BackendKind,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            job_uid: spec.job_uid.clone(),
            spec,
            state: JobState::Created,
            provider_name: provider_name.to_string(),
            provider_type,
            instance_name: None,
            instance_address: None,
            message: None,
            timestamps: JobTimestamps::new(now),
            total_wall_time_secs: None,
            run_timeout_secs: None,
            overrides: Params::new(),
            version: 0,
        }
    }
}

/// Why a pipeline stage did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFailure {
    RemoteOperation,
    StaleOperation,
    Configuration,
    Unreachable,
}

impl StageFailure {
    pub fn code(self) -> &'static str {
        use crate::app::errors::codes;
        match self {
            StageFailure::RemoteOperation => codes::REMOTE_OPERATION_FAILURE,
            StageFailure::StaleOperation => codes::STALE_OPERATION,
            StageFailure::Configuration => codes::CONFIGURATION_ERROR,
            StageFailure::Unreachable => codes::UNREACHABLE,
        }
    }
}

/// Transient result of a pipeline stage or a single remote operation.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub success: bool,
    pub message: String,
    pub failure: Option<StageFailure>,
    pub diagnostics: Option<serde_json::Value>,
}

impl StageOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            failure: None,
            diagnostics: None,
        }
    }

    pub fn failed(failure: StageFailure, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            failure: Some(failure),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: serde_json::Value) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn is_stale(&self) -> bool {
        self.failure == Some(StageFailure::StaleOperation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallAllow {
    #[serde(rename = "IPProtocol")]
    pub protocol: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub allowed: Vec<FirewallAllow>,
    #[serde(default)]
    pub target_tags: Vec<String>,
}

/// Instance as reported by the cloud API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloudInstance {
    pub name: String,
    pub zone: String,
    pub status: String,
    pub labels: BTreeMap<String, String>,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloudImage {
    pub name: String,
    pub family: Option<String>,
}

/// Snapshot of an asynchronous cloud operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneOperation {
    pub name: String,
    pub done: bool,
    pub error: Option<serde_json::Value>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedInstance {
    pub machine_name: String,
    pub machine_project: String,
    pub machine_zone: String,
    pub operation_name: String,
}

/// Instance summary for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSummary {
    pub name: String,
    pub address: String,
    pub provider: String,
    pub status: String,
}
