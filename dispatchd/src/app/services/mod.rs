// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod lifecycle;
pub mod params;
pub mod paths;
pub mod random;
pub mod shell;
pub mod token;
