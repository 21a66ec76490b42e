// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod automation;
pub mod cli;
pub mod db;
pub mod gcp;
pub mod network;
pub mod telemetry;
pub mod time;
