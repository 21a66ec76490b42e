// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::NetworkProbePort;
use crate::app::types::Address;

mod heartbeat;

use heartbeat::HeartbeatError;

/// Window for a single heartbeat across every resolved address.
const HEARTBEAT_WINDOW: Duration = Duration::from_secs(3);

/// TCP connect probe against an instance's heartbeat port.
#[derive(Clone, Default)]
pub struct NetworkAdapter;

impl NetworkAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl From<HeartbeatError> for AppError {
    fn from(err: HeartbeatError) -> Self {
        AppError::with_message(AppErrorKind::Unavailable, codes::NETWORK_ERROR, err.to_string())
    }
}

#[async_trait]
impl NetworkProbePort for NetworkAdapter {
    async fn check_host_reachable(&self, address: &Address, port: u16) -> AppResult<bool> {
        Ok(heartbeat::beat(address, port, HEARTBEAT_WINDOW).await?)
    }
}
