// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client-disconnect observation.
//!
//! The core never owns a transport connection; callers hand it a
//! [`CancelSignal`] so `tokio::select!` can race queue waits and execution
//! leases against disconnect the same way `spawn_health_checker` races
//! health polls against shutdown.

use tokio_util::sync::CancellationToken;

/// A cooperative cancellation handle for one in-flight admission request.
///
/// Cloning shares the same underlying signal; cancel from any clone and
/// every waiter observing it wakes up.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self { token: CancellationToken::new() }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// A signal that never fires, for callers with no disconnect source to wire up.
    pub fn never() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_all_clones() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(50), clone.cancelled()).await.unwrap();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn never_cancelled_signal_does_not_fire() {
        let signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
