//! Normalization of raw conversation records into [`Message`]s.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use indexmap::map::Entry;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::message::{Conversation, Message, MessageMetadata, Role};
use crate::segment::{ArtifactRef, AttachmentRef, DEFAULT_PLACEHOLDER, Segment, Segmenter};
use crate::time::parse_timestamp;

/// Parent identifier the source service gives to the first message.
pub const ROOT_SENTINEL: &str = "00000000-0000-4000-8000-000000000000";

const ID_FIELDS: &[&str] = &["uuid", "id"];
const PARENT_FIELDS: &[&str] = &["parent_message_uuid", "parent_uuid", "parent_id"];
const ROLE_FIELDS: &[&str] = &["sender", "role"];
const TIMESTAMP_FIELDS: &[&str] = &["created_at", "timestamp"];
const BLOCK_SEPARATOR: &str = "\n\n";

/// What to do with records that lack required fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Fail the whole load.
    #[default]
    Strict,
    /// Skip the record and list it in the [`LoadReport`].
    SkipMalformed,
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub policy: LoadPolicy,
    /// Text the source service shows in place of tool calls.
    pub placeholder: String,
    /// Parent identifiers treated as "no parent".
    pub root_sentinels: Vec<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            policy: LoadPolicy::Strict,
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
            root_sentinels: vec![ROOT_SENTINEL.to_string()],
        }
    }
}

/// A record dropped under [`LoadPolicy::SkipMalformed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub position: usize,
    pub id: Option<String>,
    pub field: &'static str,
    pub reason: String,
}

/// A content block that was not understood and left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredBlock {
    pub message_id: String,
    pub block_type: String,
}

/// Recoverable problems found while loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub skipped: Vec<SkippedRecord>,
    /// Messages whose timestamp could not be parsed.
    pub bad_timestamps: Vec<String>,
    pub ignored_blocks: Vec<IgnoredBlock>,
    /// Identical duplicate records that were collapsed.
    pub duplicates: Vec<String>,
    /// Messages nested under a skipped record that had no identifier; they
    /// were loaded as roots.
    pub orphaned: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
            && self.bad_timestamps.is_empty()
            && self.ignored_blocks.is_empty()
            && self.duplicates.is_empty()
            && self.orphaned.is_empty()
    }
}

/// Normalized messages of one conversation, in input order.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    conversation: Conversation,
    messages: IndexMap<String, Message>,
    report: LoadReport,
}

/// Reason a single record could not be decoded.
struct Malformed {
    id: Option<String>,
    field: &'static str,
    reason: String,
}

impl MessageStore {
    /// Parses JSON text and loads it with [`MessageStore::from_value`].
    pub fn from_json_str(text: &str, options: &LoadOptions) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value, options)
    }

    /// Loads a decoded conversation document.
    ///
    /// Accepts a conversation object (`chat_messages`, `messages` or `root`),
    /// a bare array of records, or a single record with nested `children`.
    #[instrument(skip(value, options), fields(policy = ?options.policy))]
    pub fn from_value(value: &Value, options: &LoadOptions) -> Result<Self> {
        let (conversation, records) = split_document(value)?;

        let mut store = MessageStore {
            conversation,
            messages: IndexMap::new(),
            report: LoadReport::default(),
        };
        let loader = RecordLoader {
            options,
            segmenter: Segmenter::new(&options.placeholder),
        };

        // Records with the id of the enclosing record, if any, and whether
        // they were nested under a record without one.
        let mut stack: Vec<(&Value, Option<String>, bool)> =
            records.iter().rev().map(|record| (record, None, false)).collect();
        let mut position = 0;

        while let Some((record, inherited, orphaned)) = stack.pop() {
            let current = position;
            position += 1;

            let children = record
                .get("children")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let nested_parent = record.as_object().and_then(|obj| lookup_id(obj, ID_FIELDS));
            for child in children.iter().rev() {
                stack.push((child, nested_parent.clone(), nested_parent.is_none()));
            }

            match loader.load(record, inherited, &mut store.report) {
                Ok(message) => {
                    if orphaned && message.parent_id.is_none() {
                        warn!(id = %message.id, "parent record has no identifier, loading as root");
                        store.report.orphaned.push(message.id.clone());
                    }
                    store.insert(message)?;
                }
                Err(malformed) => store.reject(current, malformed, options.policy)?,
            }
        }

        debug!(
            messages = store.messages.len(),
            skipped = store.report.skipped.len(),
            "loaded message store"
        );
        Ok(store)
    }

    /// Builds a store from already normalized messages.
    pub fn from_messages(conversation: Conversation, messages: Vec<Message>) -> Result<Self> {
        let mut store = MessageStore {
            conversation,
            messages: IndexMap::with_capacity(messages.len()),
            report: LoadReport::default(),
        };
        for message in messages {
            store.insert(message)?;
        }
        Ok(store)
    }

    fn insert(&mut self, message: Message) -> Result<()> {
        match self.messages.entry(message.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(message);
            }
            Entry::Occupied(existing) => {
                if *existing.get() != message {
                    return Err(Error::DuplicateIdentifier { id: message.id });
                }
                debug!(id = %message.id, "collapsing identical duplicate");
                self.report.duplicates.push(message.id);
            }
        }
        Ok(())
    }

    fn reject(&mut self, position: usize, malformed: Malformed, policy: LoadPolicy) -> Result<()> {
        match policy {
            LoadPolicy::Strict => Err(Error::MalformedRecord {
                position,
                id: malformed.id,
                field: malformed.field,
                reason: malformed.reason,
            }),
            LoadPolicy::SkipMalformed => {
                warn!(position, field = malformed.field, reason = %malformed.reason, "skipping malformed record");
                self.report.skipped.push(SkippedRecord {
                    position,
                    id: malformed.id,
                    field: malformed.field,
                    reason: malformed.reason,
                });
                Ok(())
            }
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in input order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }
}

/// Separates conversation fields from the list of top-level records.
fn split_document(value: &Value) -> Result<(Conversation, &[Value])> {
    match value {
        Value::Array(records) => Ok((Conversation::default(), records.as_slice())),
        Value::Object(obj) => {
            for key in ["chat_messages", "messages"] {
                if let Some(records) = obj.get(key).and_then(Value::as_array) {
                    return Ok((conversation_fields(obj), records.as_slice()));
                }
            }
            match obj.get("root") {
                Some(root @ Value::Object(_)) => {
                    Ok((conversation_fields(obj), std::slice::from_ref(root)))
                }
                Some(Value::Array(roots)) => Ok((conversation_fields(obj), roots.as_slice())),
                _ if ["sender", "role", "children"].iter().any(|k| obj.contains_key(*k)) => {
                    Ok((Conversation::default(), std::slice::from_ref(value)))
                }
                _ => Err(Error::UnsupportedInput {
                    reason: "object has no chat_messages, messages or root".to_string(),
                }),
            }
        }
        other => Err(Error::UnsupportedInput {
            reason: format!("expected an object or array, found {}", json_kind(other)),
        }),
    }
}

fn conversation_fields(obj: &Map<String, Value>) -> Conversation {
    let mut conversation = Conversation::new(
        lookup_id(obj, ID_FIELDS).unwrap_or_default(),
        lookup_str(obj, &["name", "title"])
            .filter(|name| !name.trim().is_empty())
            .unwrap_or("Untitled"),
    );
    conversation.summary = lookup_str(obj, &["summary"])
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    conversation.model = lookup_str(obj, &["model"]).map(str::to_string);
    conversation.created_at = lookup_str(obj, &["created_at"]).and_then(parse_timestamp);
    conversation.updated_at = lookup_str(obj, &["updated_at"]).and_then(parse_timestamp);
    conversation.project_id = lookup_id(obj, &["project_uuid", "project_id"]);
    conversation
}

struct RecordLoader<'o> {
    options: &'o LoadOptions,
    segmenter: Segmenter<'o>,
}

impl RecordLoader<'_> {
    fn load(
        &self,
        record: &Value,
        inherited_parent: Option<String>,
        report: &mut LoadReport,
    ) -> std::result::Result<Message, Malformed> {
        let Some(obj) = record.as_object() else {
            return Err(Malformed {
                id: None,
                field: "record",
                reason: format!("expected an object, found {}", json_kind(record)),
            });
        };

        let Some(id) = lookup_id(obj, ID_FIELDS) else {
            return Err(Malformed {
                id: None,
                field: "uuid",
                reason: "missing message identifier".to_string(),
            });
        };

        let role = match lookup_str(obj, ROLE_FIELDS) {
            None => {
                return Err(Malformed {
                    id: Some(id),
                    field: "sender",
                    reason: "missing role".to_string(),
                });
            }
            Some(raw) => match Role::parse(raw) {
                Some(role) => role,
                None => {
                    return Err(Malformed {
                        id: Some(id),
                        field: "sender",
                        reason: format!("unknown role `{raw}`"),
                    });
                }
            },
        };

        let parent_id = lookup_id(obj, PARENT_FIELDS)
            .or(inherited_parent)
            .filter(|parent| !self.options.root_sentinels.iter().any(|s| s == parent));

        let timestamp = match lookup_str(obj, TIMESTAMP_FIELDS) {
            None => None,
            Some(raw) => {
                let parsed = parse_timestamp(raw);
                if parsed.is_none() {
                    warn!(id = %id, timestamp = raw, "unparseable timestamp");
                    report.bad_timestamps.push(id.clone());
                }
                parsed
            }
        };

        let mut thinking = Vec::new();
        let mut content = self.content(&id, obj, &mut thinking, report);
        let thinking = match lookup_str(obj, &["thinking"]) {
            Some(text) if !text.is_empty() => Some(text.to_string()),
            _ => (!thinking.is_empty()).then(|| thinking.join(BLOCK_SEPARATOR)),
        };
        for key in ["attachments", "files"] {
            for attachment in obj.get(key).and_then(Value::as_array).into_iter().flatten() {
                match serde_json::from_value::<AttachmentRef>(attachment.clone()) {
                    Ok(attachment) => content.push(Segment::Attachment(attachment)),
                    Err(_) => report.ignored_blocks.push(IgnoredBlock {
                        message_id: id.clone(),
                        block_type: key.to_string(),
                    }),
                }
            }
        }

        let metadata = MessageMetadata {
            model: lookup_str(obj, &["model"]).map(str::to_string),
            stop_reason: lookup_str(obj, &["stop_reason"]).map(str::to_string),
            index: obj.get("index").and_then(Value::as_u64),
            updated_at: optional_timestamp(obj, "updated_at"),
            edited_at: optional_timestamp(obj, "edited_at"),
            feedback: obj.get("chat_feedback").and_then(|feedback| match feedback {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }),
        };

        Ok(Message {
            id,
            parent_id,
            role,
            timestamp,
            content,
            thinking,
            metadata: (!metadata.is_empty()).then_some(metadata),
        })
    }

    /// Typed `content` blocks win over `text` when both are present.
    fn content(
        &self,
        id: &str,
        obj: &Map<String, Value>,
        thinking: &mut Vec<String>,
        report: &mut LoadReport,
    ) -> Vec<Segment> {
        match obj.get("content") {
            Some(Value::Array(blocks)) if !blocks.is_empty() => {
                self.blocks(id, blocks, thinking, report)
            }
            _ => match lookup_str(obj, &["text", "content"]) {
                Some(text) => self.segmenter.segment(text),
                None => Vec::new(),
            },
        }
    }

    /// Decodes typed blocks; `thinking` blocks are collected separately.
    fn blocks(
        &self,
        id: &str,
        blocks: &[Value],
        thinking: &mut Vec<String>,
        report: &mut LoadReport,
    ) -> Vec<Segment> {
        let mut segments = Vec::new();

        for block in blocks {
            let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
            if block_type == "thinking" {
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    thinking.push(text.to_string());
                    continue;
                }
            }
            let decoded = match block_type {
                "text" => block
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|text| self.segmenter.segment(text)),
                "tool_use" if block.get("name").and_then(Value::as_str) == Some("artifacts") => {
                    Some(vec![Segment::Artifact(artifact(block))])
                }
                "tool_use" | "tool_result" => Some(vec![Segment::ToolPlaceholder {
                    text: self.options.placeholder.clone(),
                    fenced: false,
                }]),
                _ => None,
            };

            match decoded {
                Some(decoded) if decoded.is_empty() => {}
                Some(decoded) => {
                    if !segments.is_empty() {
                        segments.push(Segment::text(BLOCK_SEPARATOR));
                    }
                    segments.extend(decoded);
                }
                None => {
                    debug!(id, block_type, "ignoring content block");
                    report.ignored_blocks.push(IgnoredBlock {
                        message_id: id.to_string(),
                        block_type: block_type.to_string(),
                    });
                }
            }
        }

        segments
    }
}

fn artifact(block: &Value) -> ArtifactRef {
    let input = block.get("input");
    let field = |name: &str| {
        input
            .and_then(|input| input.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    ArtifactRef {
        id: field("id")
            .or_else(|| block.get("id").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default(),
        title: field("title"),
        kind: field("type"),
        language: field("language"),
        content: field("content"),
    }
}

fn optional_timestamp(obj: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    lookup_str(obj, &[key]).and_then(parse_timestamp)
}

/// First present string field among `keys`.
fn lookup_str<'v>(obj: &'v Map<String, Value>, keys: &[&str]) -> Option<&'v str> {
    keys.iter().find_map(|key| obj.get(*key).and_then(Value::as_str))
}

/// Identifiers may be strings or integers; empty strings count as absent.
fn lookup_id(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
