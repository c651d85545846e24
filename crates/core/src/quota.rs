// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Quota Manager (§4.C) — per-account sliding-window unique-session
//! admission, backed by the atomic script in [`crate::kv::KvClient::admit_unique_session`].

use std::sync::Arc;

use crate::config::QuotaConfig;
use crate::error::{CoreError, CoreResult};
use crate::kv::KvClient;
use crate::time::epoch_ms;

/// Outcome of a quota admit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Admitted; `current` unique sessions now occupy the window out of `max`.
    Admitted { current: u32, max: u32, window_seconds: u32 },
    /// Quota disabled or fingerprint empty — caller proceeds unconstrained.
    Skipped,
}

pub struct SessionQuotaManager {
    kv: Arc<dyn KvClient>,
}

impl SessionQuotaManager {
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self { kv }
    }

    pub async fn admit(
        &self,
        account_id: &str,
        session_fingerprint: &str,
        config: &QuotaConfig,
    ) -> CoreResult<QuotaDecision> {
        let config = config.normalize();
        if !config.enabled || session_fingerprint.is_empty() {
            return Ok(QuotaDecision::Skipped);
        }
        if account_id.trim().is_empty() {
            return Err(CoreError::InvalidAccountId("account id must not be empty".to_owned()));
        }

        let key = format!("session_concurrency:{account_id}");
        let outcome = self
            .kv
            .admit_unique_session(&key, session_fingerprint, epoch_ms(), config.window_seconds, config.max_sessions)
            .await?;

        if !outcome.admitted {
            return Err(CoreError::SessionLimitExceeded {
                account_id: account_id.to_owned(),
                current: outcome.current,
                max: config.max_sessions,
            });
        }

        Ok(QuotaDecision::Admitted {
            current: outcome.current,
            max: config.max_sessions,
            window_seconds: config.window_seconds,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::kv::FakeKvClient;

    fn manager() -> Arc<SessionQuotaManager> {
        Arc::new(SessionQuotaManager::new(Arc::new(FakeKvClient::new())))
    }

    // Scenario: 20 concurrent admits racing against a 5-session window.
    #[tokio::test]
    async fn concurrent_admits_never_exceed_the_configured_session_limit() {
        let manager = manager();
        let config = QuotaConfig { enabled: true, max_sessions: 5, window_seconds: 3600 };

        let mut tasks = Vec::with_capacity(20);
        for i in 0..20 {
            let manager = Arc::clone(&manager);
            let config = config;
            tasks.push(tokio::spawn(async move {
                manager.admit("acct-1", &format!("fp-{i}"), &config).await
            }));
        }

        let mut admitted = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(QuotaDecision::Admitted { .. }) => admitted += 1,
                Err(CoreError::SessionLimitExceeded { .. }) => rejected += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(rejected, 15);
    }

    #[tokio::test]
    async fn skipped_when_disabled() {
        let manager = manager();
        let config = QuotaConfig { enabled: false, ..Default::default() };
        let decision = manager.admit("acct-1", "fp", &config).await.unwrap();
        assert_eq!(decision, QuotaDecision::Skipped);
    }

    #[tokio::test]
    async fn skipped_when_fingerprint_empty() {
        let manager = manager();
        let config = QuotaConfig::default();
        let decision = manager.admit("acct-1", "", &config).await.unwrap();
        assert_eq!(decision, QuotaDecision::Skipped);
    }

    #[tokio::test]
    async fn existing_fingerprint_refreshes_without_consuming_quota() {
        let manager = manager();
        let config = QuotaConfig { enabled: true, max_sessions: 1, window_seconds: 3600 };
        manager.admit("acct-1", "fp", &config).await.unwrap();
        let decision = manager.admit("acct-1", "fp", &config).await.unwrap();
        assert_eq!(decision, QuotaDecision::Admitted { current: 1, max: 1, window_seconds: 3600 });
    }

    #[tokio::test]
    async fn empty_account_id_rejected() {
        let manager = manager();
        let config = QuotaConfig::default();
        let result = manager.admit("  ", "fp", &config).await;
        assert!(matches!(result, Err(CoreError::InvalidAccountId(_))));
    }
}
