//! Dendrimer reconstructs branching conversation histories.
//!
//! A conversation exported from a chat service is a flat collection of
//! messages linked by parent identifiers. Editing or regenerating a message
//! creates a sibling, so the collection is really a tree. This crate turns
//! that collection into an explicit tree and derives renderings from it:
//!
//! - **MessageStore**: normalizes raw JSON records into [`Message`]s keyed by id
//! - **ConversationTree**: an arena of nodes linked by parent references
//! - **BranchSet**: every root-to-leaf path, numbered `B1`, `B2`, ...
//! - **render**: combined and per-branch Markdown, plus a lossless JSON/YAML export
//! - **Enricher**: substitutes tool placeholders with externally logged tool calls
//!
//! # Example
//!
//! ```
//! use dendrimer_core::render::{ConversationView, RenderOptions, markdown};
//! use dendrimer_core::{BranchSet, ConversationTree, LoadOptions, MessageStore};
//!
//! let input = serde_json::json!([
//!     {"uuid": "m1", "sender": "human", "text": "Hi",
//!      "created_at": "2024-05-01T10:00:00Z"},
//!     {"uuid": "m2", "parent_message_uuid": "m1", "sender": "assistant",
//!      "text": "Hello", "created_at": "2024-05-01T10:00:05Z"},
//! ]);
//!
//! let store = MessageStore::from_value(&input, &LoadOptions::default()).unwrap();
//! let tree = ConversationTree::build(&store).unwrap();
//! let branches = BranchSet::enumerate(&tree);
//! assert_eq!(branches.len(), 1);
//!
//! let view = ConversationView::combined(&tree, &branches);
//! let text = markdown::combined(&view, &RenderOptions::default());
//! assert!(text.contains("### 2. Assistant"));
//! ```

mod branch;
mod enrich;
mod error;
mod message;
pub mod render;
mod segment;
mod store;
mod time;
mod toollog;
mod tree;

pub use branch::{Branch, BranchId, BranchSet, BranchSpan, ParseBranchIdError};
pub use enrich::{
    EnrichReport, Enrichable, Enricher, TurnInfo, UnmatchedPlaceholder, UnusedLogRecord,
};
pub use error::{Error, Result};
pub use message::{Conversation, Message, MessageMetadata, Role};
pub use segment::{ArtifactRef, AttachmentRef, DEFAULT_PLACEHOLDER, Segment, Segmenter};
pub use store::{
    IgnoredBlock, LoadOptions, LoadPolicy, LoadReport, MessageStore, ROOT_SENTINEL, SkippedRecord,
};
pub use time::{format_timestamp, parse_timestamp};
pub use toollog::{InvalidLine, ToolLog, ToolLogRecord, ToolLogReport, ToolStatus};
pub use tree::{BuildWarning, ConversationTree, NodeIndex, TreeNode};
