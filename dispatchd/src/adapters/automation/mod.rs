// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod ansible;

pub use ansible::{AnsibleRunner, AnsibleSettings};
