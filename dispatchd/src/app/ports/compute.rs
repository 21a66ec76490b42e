// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{CloudImage, CloudInstance, FirewallRule, ZoneOperation};

/// Minimal cloud compute contract: create/list/delete plus operation polling.
/// Mutating calls return the name of the asynchronous operation they started.
#[async_trait]
pub trait ComputeApiPort: Send + Sync {
    async fn list_firewalls(&self, project: &str) -> AppResult<Vec<FirewallRule>>;
    async fn insert_firewall(&self, project: &str, rule: &FirewallRule) -> AppResult<String>;
    async fn list_instances(&self, project: &str, zone: &str) -> AppResult<Vec<CloudInstance>>;
    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        body: &serde_json::Value,
    ) -> AppResult<String>;
    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> AppResult<String>;
    async fn list_images(&self, project: &str) -> AppResult<Vec<CloudImage>>;
    async fn get_zone_operation(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> AppResult<ZoneOperation>;
}
