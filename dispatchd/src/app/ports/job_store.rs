// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::app::errors::AppResult;
use crate::app::types::JobRecord;

/// Durable job records keyed by `job_uid`.
///
/// Writers must go through [`JobStorePort::update_job`], which only succeeds when the
/// stored version still matches `record.version`; the returned record carries the
/// bumped version.
#[async_trait]
pub trait JobStorePort: Send + Sync {
    async fn insert_job(&self, record: &JobRecord) -> AppResult<JobRecord>;
    async fn get_job(&self, job_uid: &str) -> AppResult<Option<JobRecord>>;
    async fn update_job(&self, record: &JobRecord) -> AppResult<JobRecord>;
    async fn list_jobs(&self, provider_name: Option<&str>) -> AppResult<Vec<JobRecord>>;
    async fn list_active_jobs(&self) -> AppResult<Vec<JobRecord>>;
    /// Terminal jobs that were not reclaimed yet.
    async fn list_unreclaimed_jobs(&self) -> AppResult<Vec<JobRecord>>;
    async fn mark_reclaimed(&self, job_uid: &str, at: OffsetDateTime) -> AppResult<()>;
}
