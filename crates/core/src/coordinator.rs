// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Coordinator & Scheduler (§4.E).
//!
//! The facade that assembles §4.A–D: builds the per-request session
//! context, filters candidate accounts by stickiness and exclusivity,
//! registers/refreshes the sticky binding, and orchestrates concurrency and
//! quota admission with LIFO release on any failure. Mirrors the teacher's
//! `MuxState` as the one constructed-not-global shared service (Design Note
//! §9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::account::Account;
use crate::cancel::CancelSignal;
use crate::config::{CoreConfig, LimiterConfig};
use crate::digest::{self, DigestTransition, DigestValidator};
use crate::error::{CoreError, CoreResult};
use crate::kv::KvClient;
use crate::limiter::{self, Registry};
use crate::message::RequestBody;
use crate::quota::{QuotaDecision, SessionQuotaManager};

/// Metadata keys that flip a conversation from "new" to "existing" when
/// present and non-null (§4.E.1).
const RESUME_FLAG_KEYS: &[&str] = &["resume", "isResume", "conversation_id", "session_id"];
const RESUME_SESSION_TYPES: &[&str] = &["resume", "existing"];

/// Per-request session context, built once and threaded through filtering,
/// binding registration and digest validation.
pub struct SessionContext {
    pub session_hash: String,
    pub session_id: Option<String>,
    pub is_new_session: bool,
    /// `accountId -> validation result`, populated lazily by [`DigestValidator::validate_cached`].
    pub digest_validation_cache: HashMap<String, CoreResult<DigestTransition>>,
    pub request_body: RequestBody,
    sticky_account: Option<String>,
}

fn has_resume_indicator(metadata: &serde_json::Value) -> bool {
    for key in RESUME_FLAG_KEYS {
        if metadata.get(key).is_some_and(|v| !v.is_null()) {
            return true;
        }
    }
    metadata
        .get("sessionType")
        .and_then(|v| v.as_str())
        .is_some_and(|t| RESUME_SESSION_TYPES.contains(&t))
}

fn has_non_user_non_system_message(body: &RequestBody) -> bool {
    body.messages.iter().any(|m| !m.is_system() && !m.is_user())
}

fn sticky_key(session_hash: &str) -> String {
    format!("sticky_session:{session_hash}")
}

fn digest_key(account: &Account, ctx: &SessionContext) -> String {
    if account.exclusive_session_only {
        format!("exclusive_session_digest:{}:{}", account.account_id, ctx.session_hash)
    } else {
        let id = ctx.session_id.as_deref().unwrap_or(&ctx.session_hash);
        format!("claude:session:digest:{id}")
    }
}

/// A resolved set of concurrency slots plus the quota decision for one
/// admitted request. `release` undoes the concurrency acquisitions in LIFO
/// order; the quota admission has no corresponding release (§4.C never
/// models an undo — the window simply slides).
pub struct AdmissionHandle {
    api_key_slot: limiter::Handle,
    account_slot: limiter::Handle,
    pub quota: QuotaDecision,
}

impl AdmissionHandle {
    pub async fn release(&self) {
        // LIFO: the account slot was acquired after the api-key slot.
        self.account_slot.release().await;
        self.api_key_slot.release().await;
    }
}

pub struct Coordinator {
    kv: Arc<dyn KvClient>,
    limiters: Registry,
    quota: SessionQuotaManager,
    digest: DigestValidator,
    config: CoreConfig,
}

impl Coordinator {
    pub fn new(kv: Arc<dyn KvClient>, config: CoreConfig) -> Self {
        let limiters = Registry::new(Arc::clone(&kv), &config);
        let quota = SessionQuotaManager::new(Arc::clone(&kv));
        let digest = DigestValidator::new(Arc::clone(&kv));
        Self { kv, limiters, quota, digest, config }
    }

    /// Build the session context (§4.E.1): derive `isNewSession` from the
    /// message shape, any existing sticky binding, any existing digest
    /// record, and explicit resume indicators in `requestBody.metadata`.
    pub async fn build_session_context(
        &self,
        session_hash: &str,
        session_id: Option<&str>,
        request_body: RequestBody,
    ) -> CoreResult<SessionContext> {
        let sticky_account = self.kv.get(&sticky_key(session_hash)).await?;

        let digest_record_exists = match session_id {
            Some(sid) => self.kv.get(&format!("claude:session:digest:{sid}")).await?.is_some(),
            None => false,
        };

        let is_new_session = !has_non_user_non_system_message(&request_body)
            && sticky_account.is_none()
            && !digest_record_exists
            && !has_resume_indicator(&request_body.metadata);

        Ok(SessionContext {
            session_hash: session_hash.to_owned(),
            session_id: session_id.map(str::to_owned),
            is_new_session,
            digest_validation_cache: HashMap::new(),
            request_body,
            sticky_account,
        })
    }

    /// Filter candidates by session eligibility (§4.E.2).
    pub fn filter_eligible_accounts<'a>(
        &self,
        ctx: &SessionContext,
        candidates: &'a [Account],
    ) -> Vec<&'a Account> {
        if ctx.is_new_session {
            return candidates.iter().collect();
        }
        match ctx.sticky_account.as_deref() {
            Some(bound) => {
                candidates.iter().filter(|a| a.account_id == bound || !a.exclusive_session_only).collect()
            }
            None => candidates.iter().filter(|a| !a.exclusive_session_only).collect(),
        }
    }

    /// Run §4.D for `account` if it requires it, using the per-request
    /// cache. Returns `None` when the account has message-digest validation
    /// disabled. An exclusive account attempting to mint a fresh digest
    /// (`Create`) for a conversation that is not brand-new is rejected —
    /// it does not already own this session, and an exclusive account only
    /// serves sessions it already owns or sessions that are genuinely new
    /// (glossary: "exclusive account"; see `DESIGN.md` for this reading of
    /// `SESSION_NOT_NEW`, which the distilled algorithm text doesn't spell
    /// out directly).
    pub async fn validate_account_digest(
        &self,
        ctx: &mut SessionContext,
        account: &Account,
    ) -> CoreResult<Option<DigestTransition>> {
        if !account.enable_message_digest {
            return Ok(None);
        }

        let new_digest = digest::build_digest(&ctx.request_body.messages);
        let key = digest_key(account, ctx);
        let session_id = ctx.session_id.clone().unwrap_or_else(|| ctx.session_hash.clone());
        let retention = Duration::from_secs(account.session_retention_seconds.max(1));

        if account.exclusive_session_only && !ctx.is_new_session {
            let existing = self.kv.get(&key).await?;
            if existing.is_none() {
                return Err(CoreError::SessionNotNew { session_id });
            }
        }

        let transition = self
            .digest
            .validate_cached(
                &mut ctx.digest_validation_cache,
                &account.account_id,
                &session_id,
                &key,
                &new_digest,
                retention,
            )
            .await?;
        Ok(Some(transition))
    }

    /// Register or refresh the sticky binding for `accountId` (§4.E.3).
    /// Extends the TTL only once the remaining time drops below the
    /// configured renewal threshold, so a healthy binding's TTL is left
    /// alone rather than reset on every request.
    pub async fn register_binding(&self, ctx: &SessionContext, account_id: &str) -> CoreResult<()> {
        let key = sticky_key(&ctx.session_hash);
        let remaining = self.kv.ttl(&key).await?;
        let needs_fresh_ttl = match remaining {
            None => true,
            Some(r) => r < self.config.renewal_threshold(),
        };
        if needs_fresh_ttl {
            self.kv.set(&key, account_id, Some(self.config.sticky_ttl())).await
        } else {
            self.kv.set(&key, account_id, remaining).await
        }
    }

    /// Orchestrate resource acquisition (§4.E.4, steps 1-3): api-key slot,
    /// then account slot, then session quota admission. Any failure after
    /// the api-key slot is acquired releases everything already acquired,
    /// in LIFO order. Digest validation (step 4) is deliberately not part
    /// of this method — a digest rejection must not release the slots this
    /// call granted (§7's propagation policy); callers validate the digest
    /// separately and release normally regardless of its outcome.
    pub async fn acquire(
        &self,
        api_key_id: &str,
        api_key_config: &LimiterConfig,
        account: &Account,
        session_fingerprint: &str,
        cancel: CancelSignal,
    ) -> CoreResult<AdmissionHandle> {
        let api_key_slot = self.limiters.acquire(api_key_id, api_key_config, cancel.clone()).await?;

        let account_slot =
            match self.limiters.acquire(&account.account_id, &account.concurrency_config, cancel).await {
                Ok(handle) => handle,
                Err(err) => {
                    api_key_slot.release().await;
                    return Err(err);
                }
            };

        let quota =
            match self.quota.admit(&account.account_id, session_fingerprint, &account.session_concurrency_config).await
            {
                Ok(decision) => decision,
                Err(err) => {
                    account_slot.release().await;
                    api_key_slot.release().await;
                    return Err(err);
                }
            };

        Ok(AdmissionHandle { api_key_slot, account_slot, quota })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::account::AccountStatus;
    use crate::config::QuotaConfig;
    use crate::kv::FakeKvClient;
    use crate::message::{MessageContent, RequestMessage};

    fn account(id: &str, exclusive: bool) -> Account {
        Account {
            account_id: id.to_owned(),
            platform: "claude".to_owned(),
            exclusive_session_only: exclusive,
            session_retention_seconds: 3600,
            session_concurrency_config: QuotaConfig::default(),
            concurrency_config: LimiterConfig::default(),
            enable_message_digest: false,
            status: AccountStatus::Active,
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(Arc::new(FakeKvClient::new()), CoreConfig::default())
    }

    fn body_with(messages: Vec<RequestMessage>) -> RequestBody {
        RequestBody { messages, metadata: serde_json::Value::Null }
    }

    #[tokio::test]
    async fn new_session_has_no_prior_signal() {
        let coordinator = coordinator();
        let ctx = coordinator
            .build_session_context(
                "hash-1",
                None,
                body_with(vec![RequestMessage {
                    role: "user".to_owned(),
                    content: MessageContent::Text("hi".to_owned()),
                }]),
            )
            .await
            .unwrap();
        assert!(ctx.is_new_session);
    }

    #[tokio::test]
    async fn assistant_message_in_history_flips_to_existing() {
        let coordinator = coordinator();
        let messages = vec![
            RequestMessage { role: "user".to_owned(), content: MessageContent::Text("hi".to_owned()) },
            RequestMessage {
                role: "assistant".to_owned(),
                content: MessageContent::Text("hello".to_owned()),
            },
        ];
        let ctx = coordinator.build_session_context("hash-2", None, body_with(messages)).await.unwrap();
        assert!(!ctx.is_new_session);
    }

    #[tokio::test]
    async fn resume_metadata_flips_to_existing_even_with_no_history() {
        let coordinator = coordinator();
        let body = RequestBody { messages: vec![], metadata: serde_json::json!({"resume": true}) };
        let ctx = coordinator.build_session_context("hash-3", None, body).await.unwrap();
        assert!(!ctx.is_new_session);
    }

    // Scenario: existing session, no sticky binding yet.
    #[tokio::test]
    async fn existing_session_without_binding_excludes_exclusive_accounts() {
        let coordinator = coordinator();
        let candidates =
            vec![account("A", true), account("B", true), account("C", false), account("D", false)];
        let ctx = SessionContext {
            session_hash: "h".to_owned(),
            session_id: None,
            is_new_session: false,
            digest_validation_cache: HashMap::new(),
            request_body: body_with(vec![]),
            sticky_account: None,
        };
        let eligible = coordinator.filter_eligible_accounts(&ctx, &candidates);
        let ids: Vec<&str> = eligible.iter().map(|a| a.account_id.as_str()).collect();
        assert_eq!(ids, vec!["C", "D"]);
    }

    // Scenario: existing session with a sticky binding to an exclusive account.
    #[tokio::test]
    async fn existing_session_with_sticky_binding_includes_the_bound_exclusive_account() {
        let coordinator = coordinator();
        let candidates =
            vec![account("A", true), account("B", true), account("C", false), account("D", false)];
        let ctx = SessionContext {
            session_hash: "h".to_owned(),
            session_id: None,
            is_new_session: false,
            digest_validation_cache: HashMap::new(),
            request_body: body_with(vec![]),
            sticky_account: Some("A".to_owned()),
        };
        let eligible = coordinator.filter_eligible_accounts(&ctx, &candidates);
        let ids: Vec<&str> = eligible.iter().map(|a| a.account_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C", "D"]);
    }

    #[tokio::test]
    async fn new_session_makes_every_candidate_eligible() {
        let coordinator = coordinator();
        let candidates = vec![account("A", true), account("B", false)];
        let ctx = SessionContext {
            session_hash: "h".to_owned(),
            session_id: None,
            is_new_session: true,
            digest_validation_cache: HashMap::new(),
            request_body: body_with(vec![]),
            sticky_account: None,
        };
        assert_eq!(coordinator.filter_eligible_accounts(&ctx, &candidates).len(), 2);
    }

    #[tokio::test]
    async fn register_binding_writes_a_fresh_ttl_for_a_brand_new_binding() {
        let kv = Arc::new(FakeKvClient::new());
        let coordinator = Coordinator::new(kv.clone(), CoreConfig::default());
        let ctx = coordinator.build_session_context("hash-4", None, body_with(vec![])).await.unwrap();
        coordinator.register_binding(&ctx, "acct-1").await.unwrap();
        assert_eq!(kv.get("sticky_session:hash-4").await.unwrap(), Some("acct-1".to_owned()));
        let ttl = kv.ttl("sticky_session:hash-4").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn acquire_releases_api_key_slot_when_account_slot_fails() {
        let kv = Arc::new(FakeKvClient::new());
        let coordinator = Coordinator::new(kv.clone(), CoreConfig::default());
        let busy_account_config =
            LimiterConfig { max_concurrency: 1, queue_size: 0, queue_wait_seconds: 1, ..Default::default() };
        let mut acct = account("acct-1", false);
        acct.concurrency_config = busy_account_config.clone();

        // Occupy the account-level slot out of band so the coordinator's
        // own acquire for it fails with QueueFull.
        let blocker =
            coordinator.limiters.acquire("acct-1", &busy_account_config, CancelSignal::never()).await.unwrap();

        let api_key_config = LimiterConfig { max_concurrency: 5, ..Default::default() };
        let result =
            coordinator.acquire("api-key-1", &api_key_config, &acct, "fp-1", CancelSignal::never()).await;
        assert!(matches!(result, Err(CoreError::QueueFull { .. })));

        // The api-key slot must have been released on the rollback path —
        // a fresh acquire on it should succeed immediately.
        let fresh =
            coordinator.limiters.acquire("api-key-1", &api_key_config, CancelSignal::never()).await;
        assert!(fresh.is_ok());
        blocker.release().await;
    }

    #[tokio::test]
    async fn validate_account_digest_skips_accounts_with_digest_disabled() {
        let coordinator = coordinator();
        let mut ctx = coordinator.build_session_context("hash-5", None, body_with(vec![])).await.unwrap();
        let acct = account("acct-1", false);
        let result = coordinator.validate_account_digest(&mut ctx, &acct).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn exclusive_account_rejects_minting_a_digest_for_a_non_new_session() {
        let coordinator = coordinator();
        let mut acct = account("acct-1", true);
        acct.enable_message_digest = true;
        let messages = vec![
            RequestMessage { role: "user".to_owned(), content: MessageContent::Text("hi".to_owned()) },
            RequestMessage {
                role: "assistant".to_owned(),
                content: MessageContent::Text("hello".to_owned()),
            },
        ];
        let mut ctx =
            coordinator.build_session_context("hash-6", Some("s-6"), body_with(messages)).await.unwrap();
        assert!(!ctx.is_new_session);
        let result = coordinator.validate_account_digest(&mut ctx, &acct).await;
        assert!(matches!(result, Err(CoreError::SessionNotNew { .. })));
    }
}
