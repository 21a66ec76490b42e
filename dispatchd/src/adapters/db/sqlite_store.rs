// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::adapters::db::{JobDb, JobDbError};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::JobStorePort;
use crate::app::types::JobRecord;

#[derive(Clone)]
pub struct SqliteJobStore {
    db: Arc<JobDb>,
}

impl SqliteJobStore {
    pub fn new(db: JobDb) -> Self {
        Self { db: Arc::new(db) }
    }
}

/// Persistence errors stop here; the app core only sees `AppError`.
fn map_store_error(err: JobDbError) -> AppError {
    match err {
        JobDbError::EmptyJobUid => AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            "job uid must not be empty",
        ),
        JobDbError::Duplicate(uid) => AppError::with_message(
            AppErrorKind::Conflict,
            codes::CONFLICT,
            format!("job {uid} already exists"),
        ),
        err @ JobDbError::VersionConflict { .. } => {
            AppError::with_message(AppErrorKind::Conflict, codes::CONFLICT, err.to_string())
        }
        JobDbError::NotFound(uid) => AppError::with_message(
            AppErrorKind::NotFound,
            codes::NOT_FOUND,
            format!("job {uid} not found"),
        ),
        err @ (JobDbError::Corrupt { .. } | JobDbError::Serde(_)) => {
            AppError::with_message(AppErrorKind::Internal, codes::INTERNAL_ERROR, err.to_string())
        }
        JobDbError::Sqlx(err) => {
            tracing::error!(error = %err, "job store query failed");
            AppError::new(AppErrorKind::Internal, codes::INTERNAL_ERROR)
        }
    }
}

#[async_trait]
impl JobStorePort for SqliteJobStore {
    async fn insert_job(&self, record: &JobRecord) -> AppResult<JobRecord> {
        self.db.insert_job(record).await.map_err(map_store_error)
    }

    async fn get_job(&self, job_uid: &str) -> AppResult<Option<JobRecord>> {
        self.db.get_job(job_uid).await.map_err(map_store_error)
    }

    async fn update_job(&self, record: &JobRecord) -> AppResult<JobRecord> {
        self.db.update_job(record).await.map_err(map_store_error)
    }

    async fn list_jobs(&self, provider_name: Option<&str>) -> AppResult<Vec<JobRecord>> {
        self.db
            .list_jobs(provider_name)
            .await
            .map_err(map_store_error)
    }

    async fn list_active_jobs(&self) -> AppResult<Vec<JobRecord>> {
        self.db.list_active_jobs().await.map_err(map_store_error)
    }

    async fn list_unreclaimed_jobs(&self) -> AppResult<Vec<JobRecord>> {
        self.db
            .list_unreclaimed_jobs()
            .await
            .map_err(map_store_error)
    }

    async fn mark_reclaimed(&self, job_uid: &str, at: OffsetDateTime) -> AppResult<()> {
        self.db
            .mark_reclaimed(job_uid, at)
            .await
            .map_err(map_store_error)
    }
}
