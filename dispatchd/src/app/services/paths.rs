// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Deterministic locations for job directories and canonical storage.
//!
//! Paths are built as POSIX strings because they name locations on the target
//! instance, not on the machine running the orchestrator.

pub const LOGS_DIR: &str = "logs";
pub const SYNC_DIR: &str = "sync";
pub const SYNC_LOG_FILE: &str = "sync.log";
pub const LOGS_SYNC_SCRIPT: &str = ".logs_sync.sh";
pub const PERSIST_ALL_SCRIPT: &str = "persist_all.sh";
pub const ACTIVATE_FILE: &str = ".dispatch_activate";

/// Scratch root on the instance and canonical storage root it can reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub scratch_dir: String,
    pub storage_dir: String,
}

impl StorageLayout {
    pub fn new(scratch_dir: impl Into<String>, storage_dir: impl Into<String>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            storage_dir: storage_dir.into(),
        }
    }

    pub fn job_dir(&self, job_uid: &str) -> String {
        join(&self.scratch_dir, job_uid)
    }

    pub fn storage_job_dir(&self, job_uid: &str) -> String {
        join(&join(&self.storage_dir, "jobs"), job_uid)
    }

    pub fn dataset_path(&self, name: &str, checksum: &str, extension: &str) -> String {
        let dir = join(&join(&join(&self.storage_dir, "data"), name), checksum);
        join(&dir, &format!("data{extension}"))
    }

    pub fn code_path(&self, run_name: &str, checksum: &str, extension: &str) -> String {
        let dir = join(&join(&join(&self.storage_dir, "code"), run_name), checksum);
        join(&dir, &format!("code{extension}"))
    }

    pub fn sync_dir(&self, job_uid: &str) -> String {
        join(&self.job_dir(job_uid), SYNC_DIR)
    }

    pub fn sync_log(&self, job_uid: &str) -> String {
        join(&join(&self.job_dir(job_uid), LOGS_DIR), SYNC_LOG_FILE)
    }

    pub fn persist_all_script(&self, job_uid: &str) -> String {
        join(&self.sync_dir(job_uid), PERSIST_ALL_SCRIPT)
    }

    pub fn activate_file(&self, job_uid: &str) -> String {
        join(&self.job_dir(job_uid), ACTIVATE_FILE)
    }
}

/// Name of the background loop script; unique per job so cleanup can target it.
pub fn persist_loop_script_name(job_uid: &str) -> String {
    format!("{job_uid}_persist_all_loop.sh")
}

pub fn persist_script_name(persist_path: &str) -> String {
    format!("{}_sync.sh", persist_path.trim_matches('/').replace('/', "_"))
}

pub fn join(base: &str, segment: &str) -> String {
    let base = base.trim_end_matches('/');
    let segment = segment.trim_start_matches('/');
    if base.is_empty() {
        return format!("/{segment}");
    }
    format!("{base}/{segment}")
}

pub fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Validates a job-relative path (data destination, persist target) and returns
/// it normalized. Absolute paths and paths escaping the job directory are rejected.
pub fn normalize_job_relative(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("path must not be empty".to_string());
    }
    if trimmed.starts_with('/') {
        return Err(format!("path '{trimmed}' must be relative to the job directory"));
    }
    let mut parts: Vec<&str> = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(format!("path '{trimmed}' escapes the job directory"));
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(format!("path '{trimmed}' resolves to the job directory itself"));
    }
    Ok(parts.join("/"))
}
