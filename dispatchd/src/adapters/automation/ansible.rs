// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Automation through `ansible` (modules, shell) and `ansible-playbook` (roles).
//!
//! Both tools run with the `json` stdout callback so the run's stats and per-task
//! failures can be collected from stdout.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{
    AutomationPort, AutomationReport, AutomationRequest, AutomationStatus, Operation,
};
use crate::app::services::shell::sh_escape;

const MAX_EVENT_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct AnsibleSettings {
    pub ansible_bin: String,
    pub playbook_bin: String,
    /// Directory holding the role tree (`local/setup/machine`, `run/gcp/cmd`, ...).
    pub roles_path: Option<PathBuf>,
    pub remote_user: Option<String>,
    pub private_key_file: Option<PathBuf>,
}

impl Default for AnsibleSettings {
    fn default() -> Self {
        Self {
            ansible_bin: "ansible".to_string(),
            playbook_bin: "ansible-playbook".to_string(),
            roles_path: None,
            remote_user: None,
            private_key_file: None,
        }
    }
}

pub struct AnsibleRunner {
    settings: AnsibleSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    program: String,
    args: Vec<String>,
}

impl AnsibleRunner {
    pub fn new(settings: AnsibleSettings) -> Self {
        Self { settings }
    }

    fn connection_args(&self, request: &AutomationRequest) -> Vec<String> {
        let mut args = vec!["-i".to_string(), format!("{},", request.target.host)];
        if request.target.local {
            args.push("-c".to_string());
            args.push("local".to_string());
        } else {
            if let Some(user) = &self.settings.remote_user {
                args.push("-u".to_string());
                args.push(user.clone());
            }
            if let Some(key) = &self.settings.private_key_file {
                args.push("--private-key".to_string());
                args.push(key.to_string_lossy().into_owned());
            }
        }
        args
    }

    fn build_invocation(
        &self,
        request: &AutomationRequest,
        playbook: Option<&Path>,
    ) -> AppResult<Invocation> {
        let mut args = Vec::new();
        let program = match &request.operation {
            Operation::Role { .. } => {
                let path = playbook.ok_or_else(|| {
                    AppError::with_message(
                        AppErrorKind::Internal,
                        codes::LOCAL_ERROR,
                        "role invocation without a playbook",
                    )
                })?;
                args.extend(self.connection_args(request));
                args.push("--extra-vars".to_string());
                args.push(Value::Object(request.parameters.clone()).to_string());
                args.push(path.to_string_lossy().into_owned());
                self.settings.playbook_bin.clone()
            }
            Operation::Module { name } => {
                if !request.environment.is_empty() {
                    tracing::warn!(module = %name, "environment is ignored for ad-hoc modules");
                }
                args.push("all".to_string());
                args.extend(self.connection_args(request));
                args.push("-m".to_string());
                args.push(name.clone());
                if !request.parameters.is_empty() {
                    args.push("-a".to_string());
                    args.push(Value::Object(request.parameters.clone()).to_string());
                }
                self.settings.ansible_bin.clone()
            }
            Operation::Shell { command } => {
                args.push("all".to_string());
                args.extend(self.connection_args(request));
                args.push("-m".to_string());
                args.push("shell".to_string());
                args.push("-a".to_string());
                args.push(with_environment(command, &request.environment));
                self.settings.ansible_bin.clone()
            }
        };
        Ok(Invocation { program, args })
    }

    async fn spawn(
        &self,
        invocation: &Invocation,
        request: &AutomationRequest,
    ) -> AppResult<AutomationReport> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .env("ANSIBLE_STDOUT_CALLBACK", "json")
            .env("ANSIBLE_LOAD_CALLBACK_PLUGINS", "1")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_RETRY_FILES_ENABLED", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(roles) = &self.settings.roles_path {
            cmd.env("ANSIBLE_ROLES_PATH", roles);
        }

        let child = cmd.spawn().map_err(|e| {
            AppError::with_message(
                AppErrorKind::Unavailable,
                codes::LOCAL_ERROR,
                format!("failed to start {}: {e}", invocation.program),
            )
        })?;

        let output = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    return Ok(AutomationReport {
                        status: AutomationStatus::TimedOut,
                        stats: Value::Null,
                        events: vec![format!(
                            "{} did not finish within {}s",
                            request.operation.label(),
                            limit.as_secs()
                        )],
                    });
                }
            },
            None => child.wait_with_output().await,
        };
        match output {
            Err(e) => Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::LOCAL_ERROR,
                format!("failed to collect {} output: {e}", invocation.program),
            )),
            Ok(output) => Ok(parse_report(
                output.status.success(),
                &output.stdout,
                &output.stderr,
            )),
        }
    }
}

#[async_trait]
impl AutomationPort for AnsibleRunner {
    #[tracing::instrument(
        skip_all,
        fields(host = %request.target.host, op = %request.operation.label())
    )]
    async fn run(&self, request: &AutomationRequest) -> AppResult<AutomationReport> {
        // Kept alive until the playbook run ends.
        let playbook_file = match &request.operation {
            Operation::Role { name } => Some(write_playbook(name, &request.environment)?),
            _ => None,
        };
        let invocation =
            self.build_invocation(request, playbook_file.as_ref().map(|f| f.path()))?;
        tracing::debug!(program = %invocation.program, "starting automation");

        let report = self.spawn(&invocation, request).await?;
        match report.status {
            AutomationStatus::Successful => tracing::debug!("automation succeeded"),
            status => tracing::info!(
                ?status,
                events = report.events.len(),
                "automation did not succeed"
            ),
        }
        Ok(report)
    }
}

fn playbook(role: &str, environment: &BTreeMap<String, String>) -> Value {
    json!([{
        "hosts": "all",
        "gather_facts": false,
        "environment": environment,
        "roles": [{ "role": role }],
    }])
}

fn write_playbook(
    role: &str,
    environment: &BTreeMap<String, String>,
) -> AppResult<tempfile::NamedTempFile> {
    let io_err = |e: std::io::Error| {
        AppError::with_message(
            AppErrorKind::Internal,
            codes::LOCAL_ERROR,
            format!("failed to write playbook for role {role}: {e}"),
        )
    };
    let mut file = tempfile::Builder::new()
        .prefix("dispatchd-play-")
        .suffix(".json")
        .tempfile()
        .map_err(io_err)?;
    file.write_all(playbook(role, environment).to_string().as_bytes())
        .map_err(io_err)?;
    file.flush().map_err(io_err)?;
    Ok(file)
}

fn with_environment(command: &str, environment: &BTreeMap<String, String>) -> String {
    if environment.is_empty() {
        return command.to_string();
    }
    let mut out = String::from("env");
    for (key, value) in environment {
        out.push(' ');
        out.push_str(&sh_escape(&format!("{key}={value}")));
    }
    out.push_str(" sh -c ");
    out.push_str(&sh_escape(command));
    out
}

fn parse_report(success: bool, stdout: &[u8], stderr: &[u8]) -> AutomationReport {
    let status = if success {
        AutomationStatus::Successful
    } else {
        AutomationStatus::Failed
    };
    let Ok(parsed) = serde_json::from_slice::<Value>(stdout) else {
        let text = String::from_utf8_lossy(stderr);
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(MAX_EVENT_LINES);
        return AutomationReport {
            status,
            stats: Value::Null,
            events: lines[start..].iter().map(|l| l.to_string()).collect(),
        };
    };

    let mut events = Vec::new();
    for play in parsed["plays"].as_array().into_iter().flatten() {
        for task in play["tasks"].as_array().into_iter().flatten() {
            let task_name = task["task"]["name"].as_str().unwrap_or("task");
            let Some(hosts) = task["hosts"].as_object() else {
                continue;
            };
            for (host, result) in hosts {
                let failed = result["failed"].as_bool().unwrap_or(false)
                    || result["unreachable"].as_bool().unwrap_or(false);
                if failed {
                    let msg = result["msg"]
                        .as_str()
                        .or_else(|| result["stderr"].as_str())
                        .unwrap_or("failed");
                    events.push(format!("{task_name} on {host}: {msg}"));
                }
            }
        }
    }
    AutomationReport {
        status,
        stats: parsed.get("stats").cloned().unwrap_or(Value::Null),
        events,
    }
}
