// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Job lifecycle state machine.
//!
//! States are linear: `created -> dispatching_machine -> dispatching_installs ->
//! dispatching_setup -> running -> cleanup -> finished`. `failed` is absorbing and
//! reachable from every non-terminal state. Forward skips are allowed, so a job that
//! never needed installs can go straight from machine dispatch to setup.

use time::{Duration, OffsetDateTime};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::types::{JobRecord, JobState};

/// How far in the past `cleanup_at` is placed when a job finishes without ever
/// entering cleanup, so reclaimers pick it up immediately.
pub const CLEANUP_BACKDATE: Duration = Duration::days(5);

fn pipeline_rank(state: JobState) -> Option<u8> {
    match state {
        JobState::Created => Some(0),
        JobState::DispatchingMachine => Some(1),
        JobState::DispatchingInstalls => Some(2),
        JobState::DispatchingSetup => Some(3),
        JobState::Running => Some(4),
        JobState::Cleanup => Some(5),
        JobState::Finished => Some(6),
        JobState::Failed => None,
    }
}

pub fn can_transition(from: JobState, to: JobState) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to == JobState::Failed {
        return true;
    }
    match (pipeline_rank(from), pipeline_rank(to)) {
        (Some(current), Some(next)) => next > current,
        _ => false,
    }
}

/// Moves `job` into `next`, stamping the entry timestamp for that state.
///
/// Timestamps are never overwritten and are clamped so they stay non-decreasing in
/// pipeline order even if the clock steps backwards between calls.
pub fn transition(job: &mut JobRecord, next: JobState, now: OffsetDateTime) -> AppResult<()> {
    if !can_transition(job.state, next) {
        return Err(AppError::with_message(
            AppErrorKind::FailedPrecondition,
            codes::INVALID_TRANSITION,
            format!(
                "job {} cannot move from {} to {}",
                job.job_uid, job.state, next
            ),
        ));
    }

    let stamp_at = now.max(job.timestamps.last_progress());
    let ts = &mut job.timestamps;
    match next {
        JobState::Created => {}
        JobState::DispatchingMachine => stamp(&mut ts.dispatch_machine_at, stamp_at),
        JobState::DispatchingInstalls => stamp(&mut ts.dispatch_installs_at, stamp_at),
        JobState::DispatchingSetup => stamp(&mut ts.dispatch_setup_at, stamp_at),
        JobState::Running => stamp(&mut ts.running_at, stamp_at),
        JobState::Cleanup => stamp(&mut ts.cleanup_at, stamp_at),
        JobState::Finished => {
            stamp(&mut ts.completed_at, stamp_at);
            let elapsed = (stamp_at - ts.created_at).whole_seconds().max(0);
            job.total_wall_time_secs = Some(elapsed);
            if ts.cleanup_at.is_none() {
                ts.cleanup_at = Some(now - CLEANUP_BACKDATE);
            }
        }
        JobState::Failed => stamp(&mut ts.failed_at, stamp_at),
    }
    job.state = next;
    Ok(())
}

fn stamp(slot: &mut Option<OffsetDateTime>, at: OffsetDateTime) {
    if slot.is_none() {
        *slot = Some(at);
    }
}

/// A terminal job whose cleanup window has elapsed and that has not been reclaimed yet.
pub fn is_cleanup_eligible(job: &JobRecord, now: OffsetDateTime, grace: Duration) -> bool {
    if job.timestamps.reclaimed_at.is_some() {
        return false;
    }
    let since = match job.state {
        JobState::Finished => job.timestamps.cleanup_at,
        JobState::Failed => job.timestamps.failed_at,
        _ => None,
    };
    since.is_some_and(|at| at + grace <= now)
}

/// A non-terminal job that made no progress for `stale_after`.
pub fn is_abandoned(job: &JobRecord, now: OffsetDateTime, stale_after: Duration) -> bool {
    !job.state.is_terminal() && job.timestamps.last_progress() + stale_after <= now
}
