// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::ports::ClockPort;
use time::OffsetDateTime;

/// Wall clock; every job timestamp is taken from here.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl ClockPort for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::UtcOffset;

    #[test]
    fn timestamps_are_utc_and_non_decreasing() {
        let clock = SystemClock::new();
        let first = clock.now_utc();
        let second = clock.now_utc();
        assert_eq!(first.offset(), UtcOffset::UTC);
        assert!(second >= first);
    }
}
