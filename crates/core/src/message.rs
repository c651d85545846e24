// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request-body types: the "dynamic field soup" design note (§9) turned into
//! explicit structs with a tagged union for message content parts.

use serde::{Deserialize, Serialize};

/// One part of a message's structured content.
///
/// Unknown content parts fall back to the `Unknown` unit variant via
/// `#[serde(other)]`, so the digest hasher never panics on a part shape it
/// doesn't recognize (see `DESIGN.md` for the resulting hash-fidelity
/// tradeoff).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
    },
    Image {
        source: serde_json::Value,
    },
    /// A part shape this crate doesn't recognize; hashed via its raw JSON.
    #[serde(other)]
    Unknown,
}

/// A message's content, as callers actually send it: either a plain string
/// or the full structured-parts array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Normalize to the structured-parts shape the digest hasher consumes.
    pub fn to_parts(&self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(s) if s.is_empty() => Vec::new(),
            MessageContent::Text(s) => vec![ContentPart::Text { text: s.clone() }],
            MessageContent::Parts(parts) => parts.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: String,
    pub content: MessageContent,
}

impl RequestMessage {
    pub fn is_system(&self) -> bool {
        self.role == "system"
    }

    pub fn is_user(&self) -> bool {
        self.role == "user"
    }
}

/// The full chat-completion request body, as received from the adapter.
/// `metadata` carries whatever the caller sent (`resume`, `session_id`,
/// `conversation_id`, ...) and is inspected, never re-shaped, by the
/// session coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestBody {
    pub messages: Vec<RequestMessage>,
    pub metadata: serde_json::Value,
}

impl Default for RequestBody {
    fn default() -> Self {
        Self { messages: Vec::new(), metadata: serde_json::Value::Null }
    }
}
