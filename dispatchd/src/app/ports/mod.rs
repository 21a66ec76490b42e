// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod automation;
pub mod clock;
pub mod compute;
pub mod job_store;
pub mod network;
pub mod telemetry;

pub use automation::{
    AutomationPort, AutomationReport, AutomationRequest, AutomationStatus, AutomationTarget,
    Operation,
};
pub use clock::ClockPort;
pub use compute::ComputeApiPort;
pub use job_store::JobStorePort;
pub use network::NetworkProbePort;
#[allow(unused_imports)]
pub use telemetry::{NoopTelemetry, TelemetryEvent, TelemetryPort};
