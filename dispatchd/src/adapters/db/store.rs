// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::app::types::{BackendKind, JobRecord, JobState, JobTimestamps, Params};

#[derive(Debug, Error)]
pub enum JobDbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("empty job uid")]
    EmptyJobUid,
    #[error("job already exists: {0}")]
    Duplicate(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job {job_uid} changed concurrently (expected version {expected})")]
    VersionConflict { job_uid: String, expected: i64 },
    #[error("corrupt column {column}: {detail}")]
    Corrupt { column: &'static str, detail: String },
}

pub type Result<T> = std::result::Result<T, JobDbError>;

const JOB_COLUMNS: &str = "job_uid, spec_json, state, provider_name, provider_type, \
instance_name, instance_address, message, created_at, dispatch_machine_at, \
dispatch_installs_at, dispatch_setup_at, running_at, cleanup_at, completed_at, failed_at, \
reclaimed_at, total_wall_time_secs, run_timeout_secs, overrides_json, version";

/// Async job record store on SQLite.
#[derive(Clone)]
pub struct JobDb {
    pool: SqlitePool,
}

impl JobDb {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let url = format!("sqlite://{}", path_ref.to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    #[cfg(test)]
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
              job_uid TEXT PRIMARY KEY,
              spec_json TEXT NOT NULL,
              state TEXT NOT NULL,
              provider_name TEXT NOT NULL,
              provider_type TEXT NOT NULL,
              instance_name TEXT,
              instance_address TEXT,
              message TEXT,
              created_at TEXT NOT NULL,
              dispatch_machine_at TEXT,
              dispatch_installs_at TEXT,
              dispatch_setup_at TEXT,
              running_at TEXT,
              cleanup_at TEXT,
              completed_at TEXT,
              failed_at TEXT,
              reclaimed_at TEXT,
              total_wall_time_secs INTEGER,
              run_timeout_secs INTEGER,
              overrides_json TEXT NOT NULL DEFAULT '{}',
              version INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            CREATE INDEX IF NOT EXISTS idx_jobs_provider_name ON jobs(provider_name);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_job(&self, job: &JobRecord) -> Result<JobRecord> {
        if job.job_uid.trim().is_empty() {
            return Err(JobDbError::EmptyJobUid);
        }
        let spec_json = serde_json::to_string(&job.spec)?;
        let overrides_json = serde_json::to_string(&job.overrides)?;
        let ts = &job.timestamps;
        let res = sqlx::query(
            r#"
            insert into jobs(
              job_uid, spec_json, state, provider_name, provider_type, instance_name,
              instance_address, message, created_at, dispatch_machine_at, dispatch_installs_at,
              dispatch_setup_at, running_at, cleanup_at, completed_at, failed_at, reclaimed_at,
              total_wall_time_secs, run_timeout_secs, overrides_json, version
            )
            values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                    ?18, ?19, ?20, 1)
            on conflict(job_uid) do nothing
            "#,
        )
        .bind(&job.job_uid)
        .bind(spec_json)
        .bind(job.state.as_str())
        .bind(&job.provider_name)
        .bind(job.provider_type.as_str())
        .bind(&job.instance_name)
        .bind(&job.instance_address)
        .bind(&job.message)
        .bind(format_ts(ts.created_at))
        .bind(ts.dispatch_machine_at.map(format_ts))
        .bind(ts.dispatch_installs_at.map(format_ts))
        .bind(ts.dispatch_setup_at.map(format_ts))
        .bind(ts.running_at.map(format_ts))
        .bind(ts.cleanup_at.map(format_ts))
        .bind(ts.completed_at.map(format_ts))
        .bind(ts.failed_at.map(format_ts))
        .bind(ts.reclaimed_at.map(format_ts))
        .bind(job.total_wall_time_secs)
        .bind(job.run_timeout_secs.and_then(|v| i64::try_from(v).ok()))
        .bind(overrides_json)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(JobDbError::Duplicate(job.job_uid.clone()));
        }
        let mut stored = job.clone();
        stored.version = 1;
        Ok(stored)
    }

    /// Writes `job` only if the stored version still equals `job.version`.
    pub async fn update_job(&self, job: &JobRecord) -> Result<JobRecord> {
        let overrides_json = serde_json::to_string(&job.overrides)?;
        let ts = &job.timestamps;
        let res = sqlx::query(
            r#"
            update jobs set
              state = ?1, instance_name = ?2, instance_address = ?3, message = ?4,
              dispatch_machine_at = ?5, dispatch_installs_at = ?6, dispatch_setup_at = ?7,
              running_at = ?8, cleanup_at = ?9, completed_at = ?10, failed_at = ?11,
              reclaimed_at = ?12, total_wall_time_secs = ?13, run_timeout_secs = ?14,
              overrides_json = ?15, version = version + 1
            where job_uid = ?16 and version = ?17
            "#,
        )
        .bind(job.state.as_str())
        .bind(&job.instance_name)
        .bind(&job.instance_address)
        .bind(&job.message)
        .bind(ts.dispatch_machine_at.map(format_ts))
        .bind(ts.dispatch_installs_at.map(format_ts))
        .bind(ts.dispatch_setup_at.map(format_ts))
        .bind(ts.running_at.map(format_ts))
        .bind(ts.cleanup_at.map(format_ts))
        .bind(ts.completed_at.map(format_ts))
        .bind(ts.failed_at.map(format_ts))
        .bind(ts.reclaimed_at.map(format_ts))
        .bind(job.total_wall_time_secs)
        .bind(job.run_timeout_secs.and_then(|v| i64::try_from(v).ok()))
        .bind(overrides_json)
        .bind(&job.job_uid)
        .bind(job.version)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return match self.get_job(&job.job_uid).await? {
                Some(_) => Err(JobDbError::VersionConflict {
                    job_uid: job.job_uid.clone(),
                    expected: job.version,
                }),
                None => Err(JobDbError::NotFound(job.job_uid.clone())),
            };
        }
        let mut stored = job.clone();
        stored.version += 1;
        Ok(stored)
    }

    pub async fn get_job(&self, job_uid: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("select {JOB_COLUMNS} from jobs where job_uid = ?1"))
            .bind(job_uid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    pub async fn list_jobs(&self, provider_name: Option<&str>) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "select {JOB_COLUMNS} from jobs where (?1 is null or provider_name = ?1) \
             order by created_at, job_uid"
        ))
        .bind(provider_name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    pub async fn list_active_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "select {JOB_COLUMNS} from jobs where state not in ('finished', 'failed') \
             order by created_at, job_uid"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    pub async fn list_unreclaimed_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "select {JOB_COLUMNS} from jobs where state in ('finished', 'failed') \
             and reclaimed_at is null order by created_at, job_uid"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    /// Stamps `reclaimed_at` once; later calls keep the first value.
    pub async fn mark_reclaimed(&self, job_uid: &str, at: OffsetDateTime) -> Result<()> {
        let res = sqlx::query(
            r#"
            update jobs set
              reclaimed_at = coalesce(reclaimed_at, ?1),
              version = version + 1
            where job_uid = ?2
            "#,
        )
        .bind(format_ts(at))
        .bind(job_uid)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(JobDbError::NotFound(job_uid.to_string()));
        }
        Ok(())
    }
}

fn format_ts(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.unix_timestamp().to_string())
}

fn parse_ts(column: &'static str, raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| JobDbError::Corrupt {
        column,
        detail: e.to_string(),
    })
}

fn opt_ts(row: &SqliteRow, column: &'static str) -> Result<Option<OffsetDateTime>> {
    row.try_get::<Option<String>, _>(column)?
        .map(|raw| parse_ts(column, &raw))
        .transpose()
}

fn row_to_job(row: SqliteRow) -> Result<JobRecord> {
    let state_raw: String = row.try_get("state")?;
    let state = JobState::from_str(&state_raw).map_err(|detail| JobDbError::Corrupt {
        column: "state",
        detail,
    })?;
    let provider_raw: String = row.try_get("provider_type")?;
    let provider_type =
        BackendKind::from_str(&provider_raw).map_err(|detail| JobDbError::Corrupt {
            column: "provider_type",
            detail,
        })?;
    let spec_json: String = row.try_get("spec_json")?;
    let overrides_json: String = row.try_get("overrides_json")?;
    let overrides: Params = serde_json::from_str(&overrides_json)?;
    let created_raw: String = row.try_get("created_at")?;

    Ok(JobRecord {
        job_uid: row.try_get("job_uid")?,
        spec: serde_json::from_str(&spec_json)?,
        state,
        provider_name: row.try_get("provider_name")?,
        provider_type,
        instance_name: row.try_get("instance_name")?,
        instance_address: row.try_get("instance_address")?,
        message: row.try_get("message")?,
        timestamps: JobTimestamps {
            created_at: parse_ts("created_at", &created_raw)?,
            dispatch_machine_at: opt_ts(&row, "dispatch_machine_at")?,
            dispatch_installs_at: opt_ts(&row, "dispatch_installs_at")?,
            dispatch_setup_at: opt_ts(&row, "dispatch_setup_at")?,
            running_at: opt_ts(&row, "running_at")?,
            cleanup_at: opt_ts(&row, "cleanup_at")?,
            completed_at: opt_ts(&row, "completed_at")?,
            failed_at: opt_ts(&row, "failed_at")?,
            reclaimed_at: opt_ts(&row, "reclaimed_at")?,
        },
        total_wall_time_secs: row.try_get("total_wall_time_secs")?,
        run_timeout_secs: row
            .try_get::<Option<i64>, _>("run_timeout_secs")?
            .and_then(|v| u64::try_from(v).ok()),
        overrides,
        version: row.try_get("version")?,
    })
}
