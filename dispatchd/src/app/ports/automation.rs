// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::Params;

/// One opaque automation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A single primitive action (`file`, `unarchive`, `copy`, ...) with its arguments.
    Module { name: String },
    /// A named multi-step bundle; parameters are passed as extra vars.
    Role { name: String },
    /// A raw shell command.
    Shell { command: String },
}

impl Operation {
    pub fn module(name: impl Into<String>) -> Self {
        Operation::Module { name: name.into() }
    }

    pub fn role(name: impl Into<String>) -> Self {
        Operation::Role { name: name.into() }
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Operation::Shell {
            command: command.into(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Operation::Module { name } => format!("module:{name}"),
            Operation::Role { name } => format!("role:{name}"),
            Operation::Shell { command } => format!("shell:{command}"),
        }
    }
}

/// Where an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationTarget {
    pub host: String,
    /// Run on the orchestrator host without a remote connection.
    pub local: bool,
}

#[derive(Debug, Clone)]
pub struct AutomationRequest {
    pub target: AutomationTarget,
    pub operation: Operation,
    pub parameters: Params,
    pub environment: BTreeMap<String, String>,
    /// `None` lets the operation run without a deadline.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationStatus {
    Successful,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct AutomationReport {
    pub status: AutomationStatus,
    pub stats: serde_json::Value,
    pub events: Vec<String>,
}

/// Boundary to the external automation runner.
/// `Err` means the runner itself could not be invoked; a failed operation is
/// reported through [`AutomationReport::status`].
#[async_trait]
pub trait AutomationPort: Send + Sync {
    async fn run(&self, request: &AutomationRequest) -> AppResult<AutomationReport>;
}
