// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admission-control and session-affinity core for a multi-tenant LLM proxy.
//!
//! Decides, per inbound chat-completion request, whether a concurrency slot
//! may be occupied (§4.B), whether an account is eligible to handle the
//! conversation under sticky/exclusivity rules (§4.E), whether the message
//! history is a legitimate continuation of a previously observed
//! conversation (§4.D), and how to release every acquired resource when the
//! request ends. HTTP transport, upstream LLM calls, account catalog
//! persistence, and authentication of API keys are out of scope: this crate
//! only consumes their contracts.

pub mod account;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod kv;
pub mod limiter;
pub mod message;
pub mod quota;
pub mod time;

pub use account::{Account, AccountStatus};
pub use cancel::CancelSignal;
pub use config::CoreConfig;
pub use coordinator::{AdmissionHandle, Coordinator, SessionContext};
pub use digest::DigestTransition;
pub use error::{CoreError, CoreResult, ErrorCategory};
pub use kv::{FakeKvClient, KvClient, RedisKvClient};
pub use message::{ContentPart, MessageContent, RequestBody, RequestMessage};
pub use quota::QuotaDecision;
