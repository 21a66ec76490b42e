// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use rand::Rng;

const INSTANCE_SUFFIX_LEN: usize = 6;

/// Appends random lowercase latin letters to `prefix` so concurrently created
/// instances never collide on name.
pub fn generate_instance_name(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..INSTANCE_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.random_range(0..26); // 0..=25
            (b'a' + idx) as char
        })
        .collect();
    format!("{prefix}{suffix}")
}
