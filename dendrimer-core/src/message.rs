use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::segment::Segment;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Assistant,
    System,
}

impl Role {
    /// Parses the role names used by chat exports (`user` is an alias of `human`).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "human" | "user" => Some(Role::Human),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Capitalized name used in turn headers.
    pub fn title(&self) -> &'static str {
        match self {
            Role::Human => "Human",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-message details carried through from the source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Position the source service assigned to the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        *self == MessageMetadata::default()
    }
}

/// A single normalized message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Parent message; `None` marks a declared root.
    pub parent_id: Option<String>,
    pub role: Role,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content: Vec<Segment>,
    /// Reasoning the assistant produced before answering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    /// Creates a message with a single text segment.
    pub fn text(
        id: impl Into<String>,
        parent_id: Option<&str>,
        role: Role,
        timestamp: Option<DateTime<Utc>>,
        text: impl Into<String>,
    ) -> Self {
        Message {
            id: id.into(),
            parent_id: parent_id.map(str::to_string),
            role,
            timestamp,
            content: vec![Segment::Text { text: text.into() }],
            thinking: None,
            metadata: None,
        }
    }

    /// Sibling order: ascending timestamp (missing timestamps last), then id.
    pub fn chronological_cmp(&self, other: &Message) -> Ordering {
        self.timestamp
            .is_none()
            .cmp(&other.timestamp.is_none())
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Number of unreplaced tool placeholders in the content.
    pub fn placeholder_count(&self) -> usize {
        self.content
            .iter()
            .filter(|segment| segment.is_placeholder())
            .count()
    }

    pub fn model(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.model.as_deref())
    }
}

/// Conversation-level details shown in rendering headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Conversation {
            id: id.into(),
            title: title.into(),
            summary: None,
            model: None,
            created_at: None,
            updated_at: None,
            project_id: None,
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Conversation::new("", "Untitled")
    }
}
