//! Substitution of tool placeholders with logged tool calls.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::message::Role;
use crate::segment::{DEFAULT_PLACEHOLDER, Segment};
use crate::toollog::ToolLogRecord;

/// Read-only description of one turn of an enrichable view.
#[derive(Debug, Clone, Copy)]
pub struct TurnInfo<'a> {
    pub id: &'a str,
    pub role: Role,
    pub timestamp: Option<DateTime<Utc>>,
    /// Timestamp of the preceding turn in the same branch.
    pub previous: Option<DateTime<Utc>>,
    pub content: &'a [Segment],
}

/// A rendered view whose turn content can be replaced.
///
/// Each message id must appear at most once among [`Enrichable::turns`].
pub trait Enrichable: Clone {
    fn turns(&self) -> Vec<TurnInfo<'_>>;

    fn set_content(&mut self, id: &str, content: Vec<Segment>);
}

/// A placeholder no log record was found for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmatchedPlaceholder {
    pub message_id: String,
    /// Index of the segment holding the placeholder within the message content.
    pub segment: usize,
}

/// A log record no placeholder consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct UnusedLogRecord {
    /// Index into the records the enricher was created with.
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub tool: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichReport {
    pub replaced: usize,
    pub unmatched: Vec<UnmatchedPlaceholder>,
    pub unused: Vec<UnusedLogRecord>,
}

impl EnrichReport {
    /// Every placeholder was replaced and every record used.
    pub fn is_complete(&self) -> bool {
        self.unmatched.is_empty() && self.unused.is_empty()
    }
}

/// Matches tool log records to placeholders by time window.
///
/// An assistant turn at `T` with a parent at `P` takes records with
/// `P < timestamp <= T`; without a parent timestamp the window is open below.
/// Turns are served in timestamp order and each record is used at most once.
///
/// Placeholder segments become [`Segment::ToolCall`]s. The placeholder text
/// embedded in a table row or a code block is replaced in place with a
/// one-line summary of the call, keeping the surrounding structure intact.
#[derive(Debug, Clone)]
pub struct Enricher<'r> {
    records: &'r [ToolLogRecord],
    /// Record indices sorted by timestamp, stable.
    order: Vec<usize>,
    placeholder: String,
}

/// Records in one turn's window, handed out in timestamp order.
struct Window<'a, 'r> {
    records: &'r [ToolLogRecord],
    candidates: std::vec::IntoIter<usize>,
    used: &'a mut [bool],
}

impl<'r> Window<'_, 'r> {
    fn take(&mut self) -> Option<&'r ToolLogRecord> {
        let idx = self.candidates.next()?;
        self.used[idx] = true;
        let records = self.records;
        Some(&records[idx])
    }
}

impl<'r> Enricher<'r> {
    pub fn new(records: &'r [ToolLogRecord]) -> Self {
        let mut order: Vec<usize> = (0..records.len()).collect();
        order.sort_by_key(|&idx| records[idx].timestamp);
        Enricher {
            records,
            order,
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
        }
    }

    /// Looks for `placeholder` inside text, table and code segments.
    /// An empty placeholder only matches placeholder segments.
    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }

    /// Returns an enriched copy of `view`; the input is left untouched.
    #[instrument(skip_all, fields(records = self.records.len()))]
    pub fn enrich<V: Enrichable>(&self, view: &V) -> (V, EnrichReport) {
        let mut report = EnrichReport::default();
        let mut used = vec![false; self.records.len()];
        let mut updates: Vec<(String, Vec<Segment>)> = Vec::new();

        let mut turns: Vec<TurnInfo<'_>> = view
            .turns()
            .into_iter()
            .filter(|turn| {
                turn.role == Role::Assistant
                    && turn.content.iter().any(|s| self.holds_placeholder(s))
            })
            .collect();
        turns.sort_by(serve_order);

        for turn in &turns {
            let candidates: Vec<usize> = self
                .order
                .iter()
                .copied()
                .filter(|&idx| !used[idx] && self.in_window(turn, &self.records[idx]))
                .collect();
            let mut window = Window {
                records: self.records,
                candidates: candidates.into_iter(),
                used: &mut used,
            };

            let replaced_before = report.replaced;
            let content = self.substitute(turn, &mut window, &mut report);
            if report.replaced > replaced_before {
                updates.push((turn.id.to_string(), content));
            }
        }

        for &idx in &self.order {
            if !used[idx] {
                let record = &self.records[idx];
                report.unused.push(UnusedLogRecord {
                    index: idx,
                    timestamp: record.timestamp,
                    tool: record.tool.clone(),
                });
            }
        }

        let mut enriched = view.clone();
        for (id, content) in updates {
            enriched.set_content(&id, content);
        }

        debug!(
            replaced = report.replaced,
            unmatched = report.unmatched.len(),
            unused = report.unused.len(),
            "enrichment finished"
        );
        (enriched, report)
    }

    /// Content of `turn` with its placeholders, in document order, replaced
    /// by the records of `window`.
    fn substitute(
        &self,
        turn: &TurnInfo<'_>,
        window: &mut Window<'_, 'r>,
        report: &mut EnrichReport,
    ) -> Vec<Segment> {
        let mut content = Vec::with_capacity(turn.content.len());
        let unmatched = |report: &mut EnrichReport, position: usize| {
            report.unmatched.push(UnmatchedPlaceholder {
                message_id: turn.id.to_string(),
                segment: position,
            });
        };

        for (position, segment) in turn.content.iter().enumerate() {
            match segment {
                Segment::ToolPlaceholder { fenced, .. } => match window.take() {
                    Some(record) => {
                        report.replaced += 1;
                        content.push(Segment::ToolCall {
                            record: record.clone(),
                            fenced: *fenced,
                        });
                    }
                    None => {
                        unmatched(report, position);
                        content.push(segment.clone());
                    }
                },
                Segment::Text { text } if self.embeds(text) => {
                    let mut pieces = text.split(self.placeholder.as_str()).peekable();
                    while let Some(piece) = pieces.next() {
                        if !piece.is_empty() {
                            content.push(Segment::text(piece));
                        }
                        if pieces.peek().is_none() {
                            break;
                        }
                        match window.take() {
                            Some(record) => {
                                report.replaced += 1;
                                content.push(Segment::ToolCall {
                                    record: record.clone(),
                                    fenced: false,
                                });
                            }
                            None => {
                                unmatched(report, position);
                                content.push(Segment::ToolPlaceholder {
                                    text: self.placeholder.clone(),
                                    fenced: false,
                                });
                            }
                        }
                    }
                }
                Segment::Table { text } if self.embeds(text) => {
                    let (text, misses) = self.replace_inline(text, window, report);
                    for _ in 0..misses {
                        unmatched(report, position);
                    }
                    content.push(Segment::Table { text });
                }
                Segment::Code { info, body } if self.embeds(body) => {
                    let (body, misses) = self.replace_inline(body, window, report);
                    for _ in 0..misses {
                        unmatched(report, position);
                    }
                    content.push(Segment::Code {
                        info: info.clone(),
                        body,
                    });
                }
                other => content.push(other.clone()),
            }
        }
        content
    }

    /// Replaces each embedded placeholder with the call's one-line summary.
    /// Returns the new text and the number of placeholders left in it.
    fn replace_inline(
        &self,
        text: &str,
        window: &mut Window<'_, 'r>,
        report: &mut EnrichReport,
    ) -> (String, usize) {
        let mut out = String::with_capacity(text.len());
        let mut misses = 0;
        let mut pieces = text.split(self.placeholder.as_str()).peekable();
        while let Some(piece) = pieces.next() {
            out.push_str(piece);
            if pieces.peek().is_none() {
                break;
            }
            match window.take() {
                Some(record) => {
                    report.replaced += 1;
                    out.push_str(&record.to_inline());
                }
                None => {
                    misses += 1;
                    out.push_str(&self.placeholder);
                }
            }
        }
        (out, misses)
    }

    fn holds_placeholder(&self, segment: &Segment) -> bool {
        match segment {
            Segment::ToolPlaceholder { .. } => true,
            Segment::Text { text } | Segment::Table { text } => self.embeds(text),
            Segment::Code { body, .. } => self.embeds(body),
            _ => false,
        }
    }

    fn embeds(&self, text: &str) -> bool {
        !self.placeholder.is_empty() && text.contains(self.placeholder.as_str())
    }

    fn in_window(&self, turn: &TurnInfo<'_>, record: &ToolLogRecord) -> bool {
        let Some(upper) = turn.timestamp else {
            return false;
        };
        let above_lower = match turn.previous {
            Some(lower) => record.timestamp > lower,
            None => true,
        };
        above_lower && record.timestamp <= upper
    }
}

/// Timestamp ascending (missing last), then id.
fn serve_order(a: &TurnInfo<'_>, b: &TurnInfo<'_>) -> Ordering {
    a.timestamp
        .is_none()
        .cmp(&b.timestamp.is_none())
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.id.cmp(b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchSet;
    use crate::message::{Conversation, Message};
    use crate::render::{ConversationView, ExportDocument};
    use crate::segment::{DEFAULT_PLACEHOLDER, Segmenter};
    use crate::store::MessageStore;
    use crate::toollog::ToolStatus;
    use crate::tree::ConversationTree;
    use chrono::TimeZone;
    use serde_json::Map;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(secs: i64, tool: &str) -> ToolLogRecord {
        ToolLogRecord {
            timestamp: at(secs),
            tool: tool.to_string(),
            params: Map::new(),
            status: ToolStatus::Success,
            result: None,
            error: None,
            conversation_id: None,
            execution_time_ms: None,
            model: None,
            session_id: None,
        }
    }

    fn message(id: &str, parent: Option<&str>, role: Role, secs: Option<i64>, text: &str) -> Message {
        Message {
            content: Segmenter::default().segment(text),
            ..Message::text(id, parent, role, secs.map(at), "")
        }
    }

    fn tree(messages: Vec<Message>) -> ConversationTree {
        let store = MessageStore::from_messages(Conversation::default(), messages).unwrap();
        ConversationTree::build(&store).unwrap()
    }

    fn tools(content: &[Segment]) -> Vec<String> {
        content
            .iter()
            .filter_map(|s| match s {
                Segment::ToolCall { record, .. } => Some(record.tool.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn records_fill_the_window_of_the_later_turn() {
        let placeholder = format!("Working.\n{DEFAULT_PLACEHOLDER}\n");
        let tree = tree(vec![
            message("h1", None, Role::Human, Some(0), "go"),
            message("a1", Some("h1"), Role::Assistant, Some(10), &placeholder),
            message("h2", Some("a1"), Role::Human, Some(20), "again"),
            message("a2", Some("h2"), Role::Assistant, Some(30), &placeholder),
        ]);
        let doc = ExportDocument::new(&tree, &BranchSet::enumerate(&tree));

        let records = [record(25, "late"), record(5, "early")];
        let (enriched, report) = Enricher::new(&records).enrich(&doc);

        assert_eq!(tools(&enriched.messages[1].content), ["early"]);
        assert_eq!(tools(&enriched.messages[3].content), ["late"]);
        assert_eq!(report.replaced, 2);
        assert!(report.is_complete());
        assert_eq!(doc.messages[1].content, Segmenter::default().segment(&placeholder));
    }

    #[test]
    fn record_between_turns_goes_to_the_later_one() {
        let placeholder = DEFAULT_PLACEHOLDER.to_string();
        let tree = tree(vec![
            message("a1", None, Role::Assistant, Some(10), &placeholder),
            message("h", Some("a1"), Role::Human, Some(15), "next"),
            message("a2", Some("h"), Role::Assistant, Some(20), &placeholder),
        ]);
        let set = BranchSet::enumerate(&tree);
        let view = ConversationView::combined(&tree, &set);

        let records = [record(17, "between")];
        let (enriched, report) = Enricher::new(&records).enrich(&view);

        let a1 = enriched.iter_turns().find(|t| t.id() == "a1").unwrap();
        let a2 = enriched.iter_turns().find(|t| t.id() == "a2").unwrap();
        assert!(tools(&a1.content).is_empty());
        assert_eq!(tools(&a2.content), ["between"]);
        assert_eq!(
            report.unmatched,
            [UnmatchedPlaceholder {
                message_id: "a1".to_string(),
                segment: 0
            }]
        );
    }

    #[test]
    fn records_are_used_once_and_leftovers_reported() {
        let two = format!("{DEFAULT_PLACEHOLDER} and {DEFAULT_PLACEHOLDER}");
        let tree = tree(vec![
            message("h", None, Role::Human, Some(0), "q"),
            message("a", Some("h"), Role::Assistant, Some(10), &two),
            message("b", Some("h"), Role::Assistant, Some(11), &two),
        ]);
        let doc = ExportDocument::new(&tree, &BranchSet::enumerate(&tree));

        let records = [record(1, "one"), record(2, "two"), record(3, "three"), record(40, "after")];
        let (enriched, report) = Enricher::new(&records).enrich(&doc);

        let a = enriched.messages.iter().find(|m| m.id == "a").unwrap();
        let b = enriched.messages.iter().find(|m| m.id == "b").unwrap();
        assert_eq!(tools(&a.content), ["one", "two"]);
        assert_eq!(tools(&b.content), ["three"]);
        assert_eq!(report.unmatched.len(), 1);
        assert_eq!(report.unused.len(), 1);
        assert_eq!(report.unused[0].tool, "after");
    }

    #[test]
    fn turn_without_timestamp_matches_nothing() {
        let tree = tree(vec![message("a", None, Role::Assistant, None, DEFAULT_PLACEHOLDER)]);
        let doc = ExportDocument::new(&tree, &BranchSet::enumerate(&tree));

        let records = [record(0, "any")];
        let (enriched, report) = Enricher::new(&records).enrich(&doc);
        assert_eq!(enriched, doc);
        assert_eq!(report.unmatched.len(), 1);
        assert_eq!(report.unused.len(), 1);
    }

    #[test]
    fn views_without_placeholders_are_unchanged() {
        let tree = tree(vec![
            message("h", None, Role::Human, Some(0), "hello"),
            message("a", Some("h"), Role::Assistant, Some(1), "```rust\nfn x() {}\n```"),
        ]);
        let set = BranchSet::enumerate(&tree);
        let view = ConversationView::combined(&tree, &set);

        let records = [record(1, "unused")];
        let (enriched, report) = Enricher::new(&records).enrich(&view);
        assert_eq!(enriched, view);
        assert_eq!(report.replaced, 0);

        let (again, _) = Enricher::new(&records).enrich(&enriched);
        assert_eq!(again, enriched);
    }

    #[test]
    fn placeholders_in_tables_and_code_are_replaced_inline() {
        let table = format!("| tool | {DEFAULT_PLACEHOLDER} |\n");
        let code = format!("```text\n{DEFAULT_PLACEHOLDER}\n```");
        let tree = tree(vec![
            message("h", None, Role::Human, Some(0), "q"),
            message("a1", Some("h"), Role::Assistant, Some(10), &table),
            message("h2", Some("a1"), Role::Human, Some(20), "more"),
            message("a2", Some("h2"), Role::Assistant, Some(30), &code),
        ]);
        let doc = ExportDocument::new(&tree, &BranchSet::enumerate(&tree));

        let records = [record(5, "search"), record(25, "fetch")];
        let (enriched, report) = Enricher::new(&records).enrich(&doc);

        assert_eq!(report.replaced, 2);
        assert!(report.is_complete());
        assert_eq!(
            enriched.messages[1].content,
            [Segment::Table {
                text: "| tool | ✓ Tool: search |\n".to_string()
            }]
        );
        assert_eq!(
            enriched.messages[3].content,
            [Segment::Code {
                info: "text".to_string(),
                body: "✓ Tool: fetch\n".to_string()
            }]
        );
    }

    #[test]
    fn embedded_placeholders_without_records_are_reported() {
        let text = format!("intro\n```text\n{DEFAULT_PLACEHOLDER}\n{DEFAULT_PLACEHOLDER}\n```");
        let tree = tree(vec![message("a", None, Role::Assistant, Some(10), &text)]);
        let doc = ExportDocument::new(&tree, &BranchSet::enumerate(&tree));

        let records = [record(5, "only")];
        let (enriched, report) = Enricher::new(&records).enrich(&doc);

        assert_eq!(report.replaced, 1);
        assert_eq!(
            report.unmatched,
            [UnmatchedPlaceholder {
                message_id: "a".to_string(),
                segment: 1
            }]
        );
        match &enriched.messages[0].content[1] {
            Segment::Code { body, .. } => {
                assert_eq!(body, &format!("✓ Tool: only\n{DEFAULT_PLACEHOLDER}\n"));
            }
            other => panic!("expected code, got {other:?}"),
        }
    }

    #[test]
    fn custom_placeholder_in_text_is_split_out() {
        let tree = tree(vec![message("a", None, Role::Assistant, Some(10), "before [tool] after")]);
        let doc = ExportDocument::new(&tree, &BranchSet::enumerate(&tree));

        let records = [record(1, "calc")];
        let (enriched, report) = Enricher::new(&records)
            .with_placeholder("[tool]")
            .enrich(&doc);

        assert_eq!(report.replaced, 1);
        let content = &enriched.messages[0].content;
        assert_eq!(content.len(), 3);
        assert_eq!(content[0], Segment::text("before "));
        assert_eq!(tools(content), ["calc"]);
        assert_eq!(content[2], Segment::text(" after"));
    }
}
