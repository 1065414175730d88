//! Markdown serialization of the view types.
//!
//! A turn renders to the same block in every view, so per-branch transcripts
//! can be located verbatim inside the combined rendering.

use chrono::{DateTime, Utc};

use crate::branch::{BranchId, BranchSpan};
use crate::message::{Conversation, Message};
use crate::segment::Segment;
use crate::time::format_timestamp;

use super::RenderOptions;
use super::view::{BranchSummary, BranchView, ConversationView, Thread, Turn};

const FENCE: &str = "```";

/// Every message once, with divergence banners and labelled forks.
pub fn combined(view: &ConversationView<'_>, options: &RenderOptions) -> String {
    let mut out = format!("# {}\n\n", view.conversation.title);

    if options.include_metadata {
        conversation_metadata(&mut out, view.conversation);
    }

    if view.branches.len() > 1 {
        out.push_str("## Branch Overview\n\n");
        out.push_str(&format!("This conversation has **{} branches**.\n\n", view.branches.len()));
        for summary in &view.branches {
            overview_line(&mut out, summary);
        }
        out.push('\n');
    }

    out.push_str("## Conversation\n\n");
    if view.is_empty() {
        out.push_str("*No messages in conversation*\n");
        return out;
    }

    let many_roots = view.roots().len() > 1;
    let mut root_number = 0;
    for id in view.document_order() {
        let thread = view.thread(id);
        if thread.path.is_empty() {
            root_number += 1;
            if many_roots {
                out.push_str(&format!("**[Root {root_number}]** {}\n\n", span_label(thread.span)));
            }
        } else {
            fork_banner(&mut out, thread);
        }

        for turn in &thread.turns {
            out.push_str(&turn_block(turn, options));
            out.push('\n');
        }

        if let Some(divergence) = thread.divergence() {
            out.push_str(&format!(
                "{}**[Branch Point]** `{}` has {} continuations ({})\n\n",
                quote_prefix(thread.depth),
                divergence.id(),
                thread.forks.len(),
                span_label(thread.span),
            ));
        }
    }

    out
}

/// A single branch as a linear transcript.
pub fn branch(view: &BranchView<'_>, options: &RenderOptions) -> String {
    let summary = &view.summary;
    let mut out = if summary.is_main {
        format!("# {} - Main Branch ({})\n\n", view.conversation.title, summary.id)
    } else {
        format!("# {} - Branch {}\n\n", view.conversation.title, summary.id)
    };

    if options.include_metadata {
        out.push_str("## Metadata\n\n");
        out.push_str(&format!("- **Conversation ID**: `{}`\n", view.conversation.id));
        out.push_str(&format!("- **Branch**: {}\n", summary.id));
        out.push_str(&format!("- **Messages in branch**: {}\n", summary.messages));
        if let Some(fork) = &summary.fork_point {
            out.push_str(&format!("- **Forks from**: `{}` (message {})\n", fork.id, fork.ordinal));
        }
        if let Some(position) = summary.diverges_at {
            out.push_str(&format!("- **Diverges from main at message**: {}\n", position + 1));
        }
        out.push_str(&format!(
            "- **Model**: {}\n",
            view.conversation.model.as_deref().unwrap_or("Unknown")
        ));
        out.push('\n');
    }

    out.push_str("## Messages\n\n");
    for turn in &view.turns {
        out.push_str(&turn_block(turn, options));
        out.push('\n');
    }
    out
}

/// Lists every branch with a link produced by `link`.
pub fn branch_index(view: &ConversationView<'_>, link: impl Fn(BranchId) -> String) -> String {
    let conversation = view.conversation;
    let mut out = format!("# {} - Branch Index\n\n", conversation.title);

    out.push_str("## Overview\n\n");
    out.push_str(&format!("- **Total branches**: {}\n", view.branches.len()));
    out.push_str(&format!("- **Created**: {}\n", timestamp_or_unknown(conversation.created_at)));
    out.push_str(&format!("- **Updated**: {}\n", timestamp_or_unknown(conversation.updated_at)));
    out.push('\n');

    out.push_str("## Branches\n\n");
    for summary in &view.branches {
        let marker = if summary.is_main { "🌟" } else { "🌿" };
        out.push_str(&format!(
            "- {marker} [{}]({}) - {} messages",
            summary.id,
            link(summary.id),
            summary.messages
        ));
        if let Some(fork) = &summary.fork_point {
            out.push_str(&format!(", forks from `{}`", fork.id));
        }
        out.push('\n');
    }
    out
}

/// The block shared by every rendering of a turn.
pub fn turn_block(turn: &Turn<'_>, options: &RenderOptions) -> String {
    let mut out = format!("### {}. {}\n", turn.ordinal, turn.message.role.title());

    if options.include_metadata {
        out.push_str(&format!("\n{}\n", metadata_line(turn.message)));
    }

    let body = segments_to_markdown(&turn.content);
    if !body.is_empty() {
        out.push('\n');
        out.push_str(&body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Writes segments back as Markdown. Text-derived segments reproduce the
/// original text exactly.
pub fn segments_to_markdown(segments: &[Segment]) -> String {
    let mut out = String::new();
    let mut previous: Option<&Segment> = None;

    for segment in segments {
        match segment {
            Segment::Text { text } | Segment::Table { text } => out.push_str(text),
            Segment::Code { info, body } => {
                out.push_str(&format!("{FENCE}{info}\n{body}{FENCE}"));
            }
            Segment::ToolPlaceholder { text, fenced: true } => {
                out.push_str(&format!("{FENCE}\n{text}\n{FENCE}"));
            }
            Segment::ToolPlaceholder { text, fenced: false } => out.push_str(text),
            Segment::Attachment(attachment) => {
                if !matches!(previous, Some(Segment::Attachment(_))) {
                    start_line(&mut out);
                    out.push_str("\n**Attachments:**\n");
                }
                out.push_str(&format!(
                    "- 📎 `{}` ({})\n",
                    attachment.file_name,
                    attachment.file_type.as_deref().unwrap_or("unknown")
                ));
            }
            Segment::Artifact(artifact) => {
                start_line(&mut out);
                out.push_str(&format!(
                    "\n> Artifact: **{}** (`{}`)\n",
                    artifact.title.as_deref().unwrap_or("Untitled"),
                    artifact.id
                ));
            }
            Segment::ToolCall { record, fenced: true } => {
                out.push_str(&format!("\n{}\n", record.to_markdown()));
            }
            Segment::ToolCall { record, fenced: false } => out.push_str(&record.to_markdown()),
        }
        previous = Some(segment);
    }

    out
}

fn start_line(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn metadata_line(message: &Message) -> String {
    let mut parts = vec![format!("Message ID: `{}`", message.id)];
    if let Some(ts) = &message.timestamp {
        parts.push(format_timestamp(ts));
    }
    if let Some(model) = message.model() {
        parts.push(model.to_string());
    }
    format!("*{}*", parts.join(" | "))
}

fn conversation_metadata(out: &mut String, conversation: &Conversation) {
    out.push_str("## Conversation Metadata\n\n");
    out.push_str(&format!("- **ID**: `{}`\n", conversation.id));
    out.push_str(&format!("- **Model**: {}\n", conversation.model.as_deref().unwrap_or("Unknown")));
    out.push_str(&format!("- **Created**: {}\n", timestamp_or_unknown(conversation.created_at)));
    out.push_str(&format!("- **Updated**: {}\n", timestamp_or_unknown(conversation.updated_at)));
    if let Some(summary) = &conversation.summary {
        out.push_str(&format!("- **Summary**: {summary}\n"));
    }
    out.push('\n');
}

fn overview_line(out: &mut String, summary: &BranchSummary) {
    if summary.is_main {
        out.push_str(&format!("- 🌟 **Main** ({}): {} messages", summary.id, summary.messages));
    } else {
        out.push_str(&format!("- 🌿 Branch {}: {} messages", summary.id, summary.messages));
    }
    if let Some(position) = summary.diverges_at {
        out.push_str(&format!(" (diverges at message {})", position + 1));
    }
    out.push('\n');
}

fn fork_banner(out: &mut String, thread: &Thread<'_>) {
    let pad = quote_prefix(thread.depth - 1);
    let label = thread
        .path
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" › ");
    let noun = if thread.span.len() == 1 { "Branch" } else { "Branches" };
    out.push_str(&format!("{pad}---\n{pad}**{noun} {label}**\n\n"));
}

fn span_label(span: BranchSpan) -> String {
    if span.len() == 1 {
        format!("Branch {span}")
    } else {
        format!("Branches {span}")
    }
}

/// One blockquote marker per nesting level.
fn quote_prefix(depth: usize) -> String {
    "> ".repeat(depth)
}

fn timestamp_or_unknown(ts: Option<DateTime<Utc>>) -> String {
    ts.as_ref().map(format_timestamp).unwrap_or_else(|| "Unknown".to_string())
}
