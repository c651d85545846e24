// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wall-clock helpers shared by every component that stamps KV entries.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, saturating to 0 if the clock is set
/// before 1970 (matches `MuxState::epoch_ms`'s defensive fallback).
pub fn epoch_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

pub fn epoch_secs() -> i64 {
    epoch_ms() / 1000
}
