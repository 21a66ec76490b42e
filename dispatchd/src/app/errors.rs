// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

pub mod codes {
    pub const REMOTE_OPERATION_FAILURE: &str = "remote_operation_failure";
    pub const STALE_OPERATION: &str = "stale_operation";
    pub const CONFIGURATION_ERROR: &str = "configuration_error";
    pub const OPERATION_ERROR: &str = "operation_error";
    pub const UNREACHABLE: &str = "unreachable";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const INVALID_TRANSITION: &str = "invalid_transition";
    pub const TIMEOUT: &str = "timeout";
    pub const NETWORK_ERROR: &str = "network_error";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const REMOTE_ERROR: &str = "remote_error";
    pub const LOCAL_ERROR: &str = "local_error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    FailedPrecondition,
    Internal,
    Aborted,
    Unavailable,
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
    details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
            details: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
            details: None,
        }
    }

    /// Malformed or missing job/provider parameters, detected before any remote call.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_message(
            AppErrorKind::InvalidArgument,
            codes::CONFIGURATION_ERROR,
            message,
        )
    }

    /// A cloud operation reached a terminal state carrying an error payload.
    pub fn operation_failed(operation: &str, payload: serde_json::Value) -> Self {
        Self::with_message(
            AppErrorKind::Aborted,
            codes::OPERATION_ERROR,
            format!("operation {operation} finished with an error"),
        )
        .with_details(payload)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_message(AppErrorKind::DeadlineExceeded, codes::TIMEOUT, message)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&serde_json::Value> {
        self.details.as_ref()
    }

    /// Timeouts and transient unavailability may be retried by the orchestrator.
    /// Configuration errors never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            AppErrorKind::DeadlineExceeded | AppErrorKind::Unavailable
        ) && self.code != codes::CONFIGURATION_ERROR
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;
