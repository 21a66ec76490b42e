// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::ports::{TelemetryEvent, TelemetryPort};

#[derive(Clone, Default)]
pub struct TracingTelemetry;

impl TracingTelemetry {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetryPort for TracingTelemetry {
    fn event(&self, name: &'static str, fields: TelemetryEvent) {
        let TelemetryEvent {
            job_uid,
            provider,
            instance,
            state,
            message,
        } = fields;

        tracing::info!(
            target: "dispatchd::telemetry",
            event = name,
            job_uid = job_uid.as_deref(),
            provider = provider.as_deref(),
            instance = instance.as_deref(),
            state = state,
            message = message.as_deref(),
        );
    }
}
