//! Renderings derived from a tree and its branch set.
//!
//! [`ConversationView`] and [`BranchView`] are the shared intermediate
//! representation; [`markdown`] serializes them as text and [`export`]
//! produces the lossless structural document.

pub mod export;
pub mod markdown;
mod view;

pub use export::{
    ExportBranch, ExportDocument, ExportFormat, ExportMessage, ExportOptions, FORMAT_VERSION,
};
pub use view::{BranchSummary, BranchView, ConversationView, ForkPoint, Thread, ThreadId, Turn};

/// Options shared by the Markdown renderers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Emit conversation/branch metadata sections and per-turn metadata lines.
    pub include_metadata: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            include_metadata: true,
        }
    }
}
