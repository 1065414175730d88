//! Lossless JSON/YAML serialization of a tree and its branches.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::branch::{BranchId, BranchSet};
use crate::enrich::{Enrichable, TurnInfo};
use crate::error::{Error, Result};
use crate::message::{Conversation, Message, MessageMetadata, Role};
use crate::segment::Segment;
use crate::tree::{BuildWarning, ConversationTree};

/// Version written to and required from [`ExportDocument::format_version`].
pub const FORMAT_VERSION: u32 = 1;

/// Export format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Yaml,
}

/// Export options.
#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    /// Whether to pretty print (JSON only).
    pub pretty: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { pretty: true }
    }
}

/// A message with its ordered child ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMessage {
    pub id: String,
    pub parent_id: Option<String>,
    pub role: Role,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default)]
    pub children: Vec<String>,
}

impl ExportMessage {
    fn into_parts(self) -> (Message, Vec<String>) {
        let message = Message {
            id: self.id,
            parent_id: self.parent_id,
            role: self.role,
            timestamp: self.timestamp,
            content: self.content,
            thinking: self.thinking,
            metadata: self.metadata,
        };
        (message, self.children)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportBranch {
    pub id: BranchId,
    /// Message ids, root first.
    pub messages: Vec<String>,
    pub is_main: bool,
    pub fork_point: Option<String>,
    pub diverges_at: Option<usize>,
}

/// The structural serialization: enough to rebuild the tree without
/// re-linking parents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub format_version: u32,
    pub conversation: Conversation,
    pub roots: Vec<String>,
    /// Depth-first pre-order.
    pub messages: Vec<ExportMessage>,
    pub branches: Vec<ExportBranch>,
    pub divergences: IndexMap<String, Vec<BranchId>>,
    #[serde(default)]
    pub warnings: Vec<BuildWarning>,
}

impl ExportDocument {
    pub fn new(tree: &ConversationTree, set: &BranchSet) -> Self {
        let messages = tree
            .preorder()
            .into_iter()
            .map(|idx| {
                let node = tree.node(idx);
                let message = node.message();
                ExportMessage {
                    id: message.id.clone(),
                    parent_id: message.parent_id.clone(),
                    role: message.role,
                    timestamp: message.timestamp,
                    content: message.content.clone(),
                    thinking: message.thinking.clone(),
                    metadata: message.metadata.clone(),
                    children: node
                        .children()
                        .iter()
                        .map(|&child| tree.node(child).id().to_string())
                        .collect(),
                }
            })
            .collect();

        let branches = set
            .iter()
            .map(|branch| ExportBranch {
                id: branch.id,
                messages: branch
                    .message_ids(tree)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                is_main: branch.is_main,
                fork_point: branch.fork_point.map(|idx| tree.node(idx).id().to_string()),
                diverges_at: branch.diverges_at,
            })
            .collect();

        ExportDocument {
            format_version: FORMAT_VERSION,
            conversation: tree.conversation().clone(),
            roots: tree
                .roots()
                .iter()
                .map(|&idx| tree.node(idx).id().to_string())
                .collect(),
            messages,
            branches,
            divergences: set.divergences().clone(),
            warnings: tree.warnings().to_vec(),
        }
    }

    pub fn to_json(&self, pretty: bool) -> Result<String> {
        let text = if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        };
        Ok(text)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn render(&self, format: ExportFormat, options: &ExportOptions) -> Result<String> {
        match format {
            ExportFormat::Json => self.to_json(options.pretty),
            ExportFormat::Yaml => self.to_yaml(),
        }
    }

    /// Rebuilds the tree from the serialized links.
    ///
    /// The stored branch list and divergence map must match what the rebuilt
    /// tree enumerates to.
    #[instrument(skip(self), fields(messages = self.messages.len()))]
    pub fn rebuild(&self) -> Result<(ConversationTree, BranchSet)> {
        if self.format_version != FORMAT_VERSION {
            return Err(Error::invalid_export(format!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                self.format_version
            )));
        }

        let entries = self.messages.iter().cloned().map(ExportMessage::into_parts).collect();
        let tree = ConversationTree::assemble(
            self.conversation.clone(),
            entries,
            &self.roots,
            self.warnings.clone(),
        )?;
        let set = BranchSet::enumerate(&tree);

        let expected = ExportDocument::new(&tree, &set);
        if expected.branches != self.branches {
            return Err(Error::invalid_export("branch list does not match the message links"));
        }
        if expected.divergences != self.divergences {
            return Err(Error::invalid_export("divergence map does not match the message links"));
        }

        debug!(branches = set.len(), "rebuilt tree from export");
        Ok((tree, set))
    }

    pub fn to_tree(&self) -> Result<ConversationTree> {
        self.rebuild().map(|(tree, _)| tree)
    }
}

impl Enrichable for ExportDocument {
    fn turns(&self) -> Vec<TurnInfo<'_>> {
        let timestamps: HashMap<&str, Option<DateTime<Utc>>> = self
            .messages
            .iter()
            .map(|m| (m.id.as_str(), m.timestamp))
            .collect();

        self.messages
            .iter()
            .map(|m| TurnInfo {
                id: &m.id,
                role: m.role,
                timestamp: m.timestamp,
                previous: m
                    .parent_id
                    .as_deref()
                    .and_then(|parent| timestamps.get(parent).copied().flatten()),
                content: &m.content,
            })
            .collect()
    }

    fn set_content(&mut self, id: &str, content: Vec<Segment>) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.content = content;
        }
    }
}

/// Serializes a tree and its branches in the requested format.
pub fn export(
    tree: &ConversationTree,
    set: &BranchSet,
    format: ExportFormat,
    options: &ExportOptions,
) -> Result<String> {
    ExportDocument::new(tree, set).render(format, options)
}
