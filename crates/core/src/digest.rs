// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Digest Validator (§4.D).
//!
//! A per-conversation append-only hash chain. Each non-system message
//! contributes one fixed-width 9-character unit (`'-'`/`'_'` role prefix +
//! 8 lowercase hex chars of a fast non-cryptographic hash). Comparing two
//! digests classifies the transition between them as a legal continuation
//! (`create` / `refresh` / `append` / `rollback` / `branch`) or a rejection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::kv::KvClient;
use crate::message::RequestMessage;

/// Width of one digest unit: a role-prefix char plus 8 hex chars.
const UNIT_LEN: usize = 9;

/// A legal transition between an old and a new digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestTransition {
    /// No prior digest existed for this conversation.
    Create,
    /// The digest is unchanged from the stored value.
    Refresh,
    /// Exactly one new unit appended to an unchanged prefix.
    Append,
    /// The new digest is a strict prefix of the old one, ending at a user turn.
    Rollback,
    /// Same length, diverges after a common prefix that ends at a user turn.
    Branch,
}

/// A rejected transition, before it is attached to a `sessionId` for the
/// caller-facing [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestRejection {
    ContentMismatch,
    AppendViolation,
    RollbackViolation,
    BranchViolation,
}

impl DigestRejection {
    fn into_error(self, session_id: &str) -> CoreError {
        let session_id = session_id.to_owned();
        match self {
            Self::ContentMismatch => CoreError::SessionContentMismatch { session_id },
            Self::AppendViolation => CoreError::SessionAppendViolation { session_id },
            Self::RollbackViolation => CoreError::SessionRollbackViolation { session_id },
            Self::BranchViolation => CoreError::SessionBranchViolation { session_id },
        }
    }
}

fn unit_at(digest: &str, index: usize) -> &str {
    &digest[index * UNIT_LEN..(index + 1) * UNIT_LEN]
}

fn prefix_at(digest: &str, index: usize) -> char {
    unit_at(digest, index).chars().next().unwrap_or('_')
}

fn unit_count(digest: &str) -> usize {
    digest.len() / UNIT_LEN
}

/// Count of matching 9-char units, scanning left to right, stopping at the
/// first mismatch.
pub fn common_units(old: &str, new: &str) -> usize {
    let n = unit_count(old).min(unit_count(new));
    (0..n).take_while(|&i| unit_at(old, i) == unit_at(new, i)).count()
}

/// Classify the transition from `old` (`None` if no prior digest exists) to
/// `new`, per the table in §4.D.
fn classify(old: Option<&str>, new: &str) -> Result<DigestTransition, DigestRejection> {
    let Some(old) = old.filter(|o| !o.is_empty()) else {
        return Ok(DigestTransition::Create);
    };
    if old == new {
        return Ok(DigestTransition::Refresh);
    }

    let c = common_units(old, new);
    if c == 0 {
        return Err(DigestRejection::ContentMismatch);
    }

    let old_n = unit_count(old);
    let new_n = unit_count(new);

    if new_n > old_n {
        if new_n == old_n + 1 && c == old_n {
            return Ok(DigestTransition::Append);
        }
        return Err(DigestRejection::AppendViolation);
    }

    if new_n < old_n {
        if c == new_n && prefix_at(new, new_n - 1) == '-' {
            return Ok(DigestTransition::Rollback);
        }
        return Err(DigestRejection::RollbackViolation);
    }

    // new_n == old_n and c < new_n (c == new_n would have matched `old == new` above).
    if prefix_at(old, c - 1) == '-' {
        return Ok(DigestTransition::Branch);
    }
    Err(DigestRejection::BranchViolation)
}

/// Build the digest for a message list: one unit per non-system message, in
/// order, skipping `system` messages entirely.
pub fn build_digest(messages: &[RequestMessage]) -> String {
    let mut digest = String::new();
    let mut relative_index = 0usize;
    for message in messages {
        if message.is_system() {
            continue;
        }
        let parts = message.content.to_parts();
        let hashable = if parts.is_empty() {
            format!("__empty_message_{relative_index}__")
        } else {
            serde_json::to_string(&parts).unwrap_or_else(|_| format!("__empty_message_{relative_index}__"))
        };
        let hash = rapidhash::v3::rapidhash_v3(hashable.as_bytes()) as u32;
        let prefix = if message.is_user() { '-' } else { '_' };
        digest.push(prefix);
        digest.push_str(&format!("{hash:08x}"));
        relative_index += 1;
    }
    digest
}

pub struct DigestValidator {
    kv: Arc<dyn KvClient>,
}

impl DigestValidator {
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self { kv }
    }

    /// Validate `new_digest` against whatever is stored at `key`, classify
    /// the transition and — on acceptance — persist `new_digest` with a
    /// fresh `retention` TTL. Rejections leave the stored value untouched.
    ///
    /// The `refresh` transition also rewrites and resets the TTL (see
    /// `DESIGN.md`'s Open Question decisions — this crate always rewrites
    /// on accept rather than special-casing the no-op case).
    pub async fn validate_and_persist(
        &self,
        session_id: &str,
        key: &str,
        new_digest: &str,
        retention: Duration,
    ) -> CoreResult<DigestTransition> {
        let old = self.kv.get(key).await?;
        let transition =
            classify(old.as_deref(), new_digest).map_err(|rejection| rejection.into_error(session_id))?;
        self.kv.set(key, new_digest, Some(retention)).await?;
        Ok(transition)
    }

    /// Per-request cached validation: the scheduler may evaluate the same
    /// `sessionId`/account pair more than once while filtering candidates,
    /// so the first result is memoized in `cache` (§4.D "Per-request caching").
    pub async fn validate_cached(
        &self,
        cache: &mut HashMap<String, CoreResult<DigestTransition>>,
        cache_key: &str,
        session_id: &str,
        storage_key: &str,
        new_digest: &str,
        retention: Duration,
    ) -> CoreResult<DigestTransition> {
        if let Some(cached) = cache.get(cache_key) {
            return cached.clone();
        }
        let result = self.validate_and_persist(session_id, storage_key, new_digest, retention).await;
        cache.insert(cache_key.to_owned(), result.clone());
        result
    }
}
