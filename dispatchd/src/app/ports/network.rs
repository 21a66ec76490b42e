// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::Address;

/// Liveness probe used for instance heartbeats.
#[async_trait]
pub trait NetworkProbePort: Send + Sync {
    async fn check_host_reachable(&self, address: &Address, port: u16) -> AppResult<bool>;
}
