// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::atomic::{AtomicU64, Ordering};

/// Generation value captured before a remote operation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationToken(u64);

/// Per-instance generation counter.
///
/// Any event that changes the identity of an instance (replacement, restart,
/// reassignment, declared unreachable) calls [`TokenGuard::invalidate`]. A result
/// obtained under an older token is stale and must be discarded.
#[derive(Debug, Default)]
pub struct TokenGuard {
    generation: AtomicU64,
}

impl TokenGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> OperationToken {
        OperationToken(self.generation.load(Ordering::Acquire))
    }

    pub fn validate(&self, token: OperationToken) -> bool {
        self.generation.load(Ordering::Acquire) == token.0
    }

    /// Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_stays_valid_without_invalidation() {
        let guard = TokenGuard::new();
        let token = guard.issue();
        assert!(guard.validate(token));
        assert!(guard.validate(guard.issue()));
    }

    #[test]
    fn invalidation_makes_outstanding_tokens_stale() {
        let guard = TokenGuard::new();
        let before = guard.issue();
        assert_eq!(guard.invalidate(), 1);
        assert!(!guard.validate(before));
        let after = guard.issue();
        assert!(guard.validate(after));
        assert_ne!(after, before);
        assert_eq!(guard.current(), 1);
    }
}
