// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `Account` entity (§3), as consumed from the external account
//! catalog. Persistence and lifecycle of the catalog itself are out of
//! scope; this crate only needs the shape of one candidate account plus the
//! per-account policy knobs that the limiter and quota managers consume.

use serde::{Deserialize, Serialize};

use crate::config::{LimiterConfig, QuotaConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub platform: String,
    /// Refuses to serve any session it does not already own and that is
    /// not brand-new (glossary: "exclusive account").
    pub exclusive_session_only: bool,
    pub session_retention_seconds: u64,
    pub session_concurrency_config: QuotaConfig,
    pub concurrency_config: LimiterConfig,
    pub enable_message_digest: bool,
    pub status: AccountStatus,
}
