// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration structs for the admission-control core.
//!
//! No CLI binding here — HTTP/CLI surfaces are out of scope for this crate.
//! Config is plain `serde`-deserializable so an outer binary can load it from
//! TOML, JSON or environment as it sees fit.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The set of upstream services a resource limiter config may target.
pub const RECOGNIZED_SERVICES: &[&str] = &["claude", "gemini", "openai", "droid"];

/// Top-level configuration for the core, aggregating every knob named in the
/// external-interface contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// `redis://` connection URL for the shared KV/scripting client.
    pub redis_url: String,
    /// `defaults.concurrency.executionTimeout` (seconds, 0 disables).
    pub default_execution_timeout_secs: u64,
    /// `concurrency.limiterCacheTtl` (ms) — LRU idle-eviction TTL for §4.B's registry.
    pub limiter_cache_ttl_ms: u64,
    /// `concurrency.sessionConfigCacheTtl` (ms) — TTL for cached per-account quota config.
    pub session_config_cache_ttl_ms: u64,
    /// `session.stickyTtlHours` — default sticky-binding TTL.
    pub sticky_ttl_hours: u64,
    /// `session.renewalThresholdMinutes` — extend a binding's TTL once remaining
    /// time drops below this threshold.
    pub renewal_threshold_minutes: u64,
    /// Max entries the in-process limiter LRU holds before evicting idle ones.
    pub limiter_registry_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1/".to_owned(),
            default_execution_timeout_secs: 300,
            limiter_cache_ttl_ms: 1_800_000,
            session_config_cache_ttl_ms: 1_800_000,
            sticky_ttl_hours: 168,
            renewal_threshold_minutes: 60,
            limiter_registry_capacity: 10_000,
        }
    }
}

impl CoreConfig {
    pub fn default_execution_timeout(&self) -> Option<Duration> {
        (self.default_execution_timeout_secs > 0)
            .then(|| Duration::from_secs(self.default_execution_timeout_secs))
    }

    pub fn limiter_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.limiter_cache_ttl_ms)
    }

    pub fn sticky_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_ttl_hours * 3600)
    }

    pub fn renewal_threshold(&self) -> Duration {
        Duration::from_secs(self.renewal_threshold_minutes * 60)
    }
}

/// Resource Limiter Config (§3) — the per-resource concurrency policy.
///
/// Accepted from callers as either a JSON string or a structured object;
/// unknown/missing fields fall back to installation defaults via
/// [`LimiterConfig::normalize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub enabled: bool,
    pub max_concurrency: i64,
    pub queue_size: i64,
    pub queue_wait_seconds: i64,
    /// `0` means execution timeout disabled.
    pub execution_seconds: i64,
    pub target_services: HashSet<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: 1,
            queue_size: 0,
            queue_wait_seconds: 30,
            execution_seconds: 300,
            target_services: RECOGNIZED_SERVICES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Normalized, validated limiter settings — the only form the registry
/// (§4.B) ever operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedLimiterConfig {
    pub enabled: bool,
    pub max_concurrency: u32,
    pub queue_size: u32,
    pub queue_wait_seconds: u32,
    /// `None` means execution timeout disabled.
    pub execution_seconds: Option<u32>,
}

impl NormalizedLimiterConfig {
    pub fn queue_wait(&self) -> Duration {
        Duration::from_secs(self.queue_wait_seconds as u64)
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_seconds.map(|s| Duration::from_secs(s as u64))
    }
}

impl LimiterConfig {
    /// Apply the concrete clamps from the spec: `maxConcurrency ← max(1,
    /// floor(x))`, `queueSize ← max(0, floor(x))`, `queueWaitSeconds ←
    /// max(1, floor(x))`, `executionSeconds ← x>0 ? floor(x) : disabled`,
    /// `targetServices` filtered to the recognized set.
    pub fn normalize(&self) -> NormalizedLimiterConfig {
        NormalizedLimiterConfig {
            enabled: self.enabled,
            max_concurrency: self.max_concurrency.max(1) as u32,
            queue_size: self.queue_size.max(0) as u32,
            queue_wait_seconds: self.queue_wait_seconds.max(1) as u32,
            execution_seconds: (self.execution_seconds > 0).then_some(self.execution_seconds as u32),
        }
    }

    /// Parse from either a JSON string or fall back to defaults on malformed input.
    pub fn from_json_str(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }

    pub fn recognized_target_services(&self) -> HashSet<String> {
        self.target_services
            .iter()
            .filter(|s| RECOGNIZED_SERVICES.contains(&s.as_str()))
            .cloned()
            .collect()
    }
}

/// Session Quota Manager config (§4.C).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub enabled: bool,
    pub max_sessions: u32,
    pub window_seconds: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self { enabled: true, max_sessions: 5, window_seconds: 3600 }
    }
}

impl QuotaConfig {
    pub fn normalize(&self) -> QuotaConfig {
        QuotaConfig {
            enabled: self.enabled,
            max_sessions: self.max_sessions.max(1),
            window_seconds: self.window_seconds.max(60),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn clamps_max_concurrency_to_at_least_one() {
        let cfg = LimiterConfig { max_concurrency: 0, ..Default::default() };
        assert_eq!(cfg.normalize().max_concurrency, 1);
        let cfg = LimiterConfig { max_concurrency: -5, ..Default::default() };
        assert_eq!(cfg.normalize().max_concurrency, 1);
    }

    #[test]
    fn queue_size_zero_is_preserved_not_treated_as_unbounded() {
        let cfg = LimiterConfig { queue_size: 0, ..Default::default() };
        assert_eq!(cfg.normalize().queue_size, 0);
    }

    #[test]
    fn execution_seconds_non_positive_disables_timeout() {
        let cfg = LimiterConfig { execution_seconds: 0, ..Default::default() };
        assert_eq!(cfg.normalize().execution_seconds, None);
        let cfg = LimiterConfig { execution_seconds: -1, ..Default::default() };
        assert_eq!(cfg.normalize().execution_seconds, None);
    }

    #[test]
    fn queue_wait_seconds_clamped_to_at_least_one() {
        let cfg = LimiterConfig { queue_wait_seconds: 0, ..Default::default() };
        assert_eq!(cfg.normalize().queue_wait_seconds, 1);
    }

    #[test]
    fn unrecognized_target_services_are_filtered_out() {
        let mut cfg = LimiterConfig::default();
        cfg.target_services = ["claude", "made_up"].iter().map(|s| s.to_string()).collect();
        let filtered = cfg.recognized_target_services();
        assert!(filtered.contains("claude"));
        assert!(!filtered.contains("made_up"));
    }

    #[test]
    fn malformed_json_falls_back_to_defaults() {
        let cfg = LimiterConfig::from_json_str("not json");
        assert_eq!(cfg.normalize().max_concurrency, 1);
    }

    #[test]
    fn quota_config_clamps_window_to_at_least_sixty_seconds() {
        let cfg = QuotaConfig { window_seconds: 10, ..Default::default() };
        assert_eq!(cfg.normalize().window_seconds, 60);
    }

    proptest::proptest! {
        #[test]
        fn normalize_never_produces_an_out_of_range_limiter_config(
            max_concurrency in i64::MIN..=i64::MAX,
            queue_size in i64::MIN..=i64::MAX,
            queue_wait_seconds in i64::MIN..=i64::MAX,
            execution_seconds in i64::MIN..=i64::MAX,
        ) {
            let cfg = LimiterConfig { max_concurrency, queue_size, queue_wait_seconds, execution_seconds, ..Default::default() };
            let normalized = cfg.normalize();
            prop_assert!(normalized.max_concurrency >= 1);
            prop_assert!(normalized.queue_wait_seconds >= 1);
            prop_assert!(execution_seconds <= 0 || normalized.execution_seconds.is_some());
            prop_assert!(execution_seconds > 0 || normalized.execution_seconds.is_none());
        }

        #[test]
        fn normalize_never_produces_an_out_of_range_quota_config(
            max_sessions in 0u32..=u32::MAX,
            window_seconds in 0u32..=u32::MAX,
        ) {
            let cfg = QuotaConfig { enabled: true, max_sessions, window_seconds };
            let normalized = cfg.normalize();
            prop_assert!(normalized.max_sessions >= 1);
            prop_assert!(normalized.window_seconds >= 60);
        }
    }
}
