//! Typed content segments and the lossless text segmenter.

use serde::{Deserialize, Serialize};

use crate::toollog::ToolLogRecord;

/// Text the source service shows where it does not expose tool-call data.
pub const DEFAULT_PLACEHOLDER: &str = "This block is not supported on your current device yet.";

const FENCE: &str = "```";

/// Reference to a file attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    #[serde(default, alias = "file_uuid", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub file_name: String,
    #[serde(default, alias = "file_kind", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_content: Option<String>,
}

/// Reference to an artifact the assistant produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One typed piece of a message's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text {
        text: String,
    },
    /// Fenced code block. `info` is everything after the opening fence.
    Code {
        info: String,
        body: String,
    },
    /// Consecutive pipe-table lines, verbatim.
    Table {
        text: String,
    },
    Attachment(AttachmentRef),
    ToolPlaceholder {
        text: String,
        /// Whether the placeholder sat alone inside an anonymous code fence.
        fenced: bool,
    },
    Artifact(ArtifactRef),
    /// A placeholder substituted with a logged tool call.
    ToolCall {
        record: ToolLogRecord,
        fenced: bool,
    },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text { text: text.into() }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Segment::ToolPlaceholder { .. })
    }

    /// Language tag of a code segment (first word of the info string).
    pub fn language(&self) -> Option<&str> {
        match self {
            Segment::Code { info, .. } => info.split_whitespace().next(),
            _ => None,
        }
    }
}

/// Splits message text into typed segments.
///
/// Segmenting is lossless: writing the segments back in order reproduces
/// the input exactly. Code fences must open with a line starting with
/// three backticks and close with a line that is exactly three backticks;
/// an unclosed fence stays prose.
#[derive(Debug, Clone, Copy)]
pub struct Segmenter<'p> {
    placeholder: &'p str,
}

impl Default for Segmenter<'static> {
    fn default() -> Self {
        Segmenter::new(DEFAULT_PLACEHOLDER)
    }
}

impl<'p> Segmenter<'p> {
    pub fn new(placeholder: &'p str) -> Self {
        Segmenter { placeholder }
    }

    pub fn segment(&self, text: &str) -> Vec<Segment> {
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let mut segments = Vec::new();
        let mut prose = String::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            let bare = strip_eol(line);

            if let Some(info) = bare.strip_prefix(FENCE) {
                let closing = if info.contains('`') {
                    None
                } else {
                    (i + 1..lines.len()).find(|&j| strip_eol(lines[j]) == FENCE)
                };
                if let Some(close) = closing {
                    self.flush_prose(&mut prose, &mut segments);
                    let body = lines[i + 1..close].concat();
                    segments.push(self.code_segment(info, body));
                    if lines[close].ends_with('\n') {
                        prose.push('\n');
                    }
                    i = close + 1;
                    continue;
                }
            }

            if is_table_line(bare) {
                let end = (i..lines.len())
                    .find(|&j| !is_table_line(strip_eol(lines[j])))
                    .unwrap_or(lines.len());
                self.flush_prose(&mut prose, &mut segments);
                segments.push(Segment::Table {
                    text: lines[i..end].concat(),
                });
                i = end;
                continue;
            }

            prose.push_str(line);
            i += 1;
        }

        self.flush_prose(&mut prose, &mut segments);
        segments
    }

    fn code_segment(&self, info: &str, body: String) -> Segment {
        let fenced_placeholder = !self.placeholder.is_empty()
            && info.is_empty()
            && body.strip_suffix('\n') == Some(self.placeholder);
        if fenced_placeholder {
            Segment::ToolPlaceholder {
                text: self.placeholder.to_string(),
                fenced: true,
            }
        } else {
            Segment::Code {
                info: info.to_string(),
                body,
            }
        }
    }

    fn flush_prose(&self, prose: &mut String, segments: &mut Vec<Segment>) {
        if prose.is_empty() {
            return;
        }
        let text = std::mem::take(prose);
        if self.placeholder.is_empty() {
            segments.push(Segment::Text { text });
            return;
        }

        let mut pieces = text.split(self.placeholder).peekable();
        while let Some(piece) = pieces.next() {
            if !piece.is_empty() {
                segments.push(Segment::text(piece));
            }
            if pieces.peek().is_some() {
                segments.push(Segment::ToolPlaceholder {
                    text: self.placeholder.to_string(),
                    fenced: false,
                });
            }
        }
    }
}

fn strip_eol(line: &str) -> &str {
    line.strip_suffix('\n').unwrap_or(line)
}

fn is_table_line(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::markdown::segments_to_markdown;

    fn roundtrip(text: &str) {
        let segments = Segmenter::default().segment(text);
        assert_eq!(segments_to_markdown(&segments), text, "{segments:?}");
    }

    #[test]
    fn plain_text_is_one_segment() {
        let segments = Segmenter::default().segment("Hello\nworld");
        assert_eq!(segments, vec![Segment::text("Hello\nworld")]);
    }

    #[test]
    fn code_block_keeps_language_and_whitespace() {
        let text = "Try this:\n```rust title=main.rs\nfn main() {\n    println!(\"hi\");\n}\n```\nDone.";
        let segments = Segmenter::default().segment(text);

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].language(), Some("rust"));
        match &segments[1] {
            Segment::Code { info, body } => {
                assert_eq!(info, "rust title=main.rs");
                assert_eq!(body, "fn main() {\n    println!(\"hi\");\n}\n");
            }
            other => panic!("expected code, got {other:?}"),
        }
        assert_eq!(segments[2], Segment::text("\nDone."));
        roundtrip(text);
    }

    #[test]
    fn unclosed_fence_stays_prose() {
        let text = "```python\nprint(1)\n";
        assert_eq!(
            Segmenter::default().segment(text),
            vec![Segment::text(text)]
        );
    }

    #[test]
    fn table_lines_are_grouped() {
        let text = "Results:\n| a | b |\n|:--|--:|\n| 1 | 2 |\nafter";
        let segments = Segmenter::default().segment(text);

        assert_eq!(segments.len(), 3);
        assert_eq!(
            segments[1],
            Segment::Table {
                text: "| a | b |\n|:--|--:|\n| 1 | 2 |\n".to_string()
            }
        );
        roundtrip(text);
    }

    #[test]
    fn bare_and_fenced_placeholders() {
        let text = format!(
            "Looking it up.\n```\n{DEFAULT_PLACEHOLDER}\n```\nThen {DEFAULT_PLACEHOLDER} again."
        );
        let segments = Segmenter::default().segment(&text);

        let placeholders: Vec<_> = segments
            .iter()
            .filter_map(|s| match s {
                Segment::ToolPlaceholder { fenced, .. } => Some(*fenced),
                _ => None,
            })
            .collect();
        assert_eq!(placeholders, vec![true, false]);
        roundtrip(&text);
    }

    #[test]
    fn placeholder_inside_other_code_is_left_alone() {
        let text = format!("```text\n{DEFAULT_PLACEHOLDER}\n```");
        let segments = Segmenter::default().segment(&text);
        assert!(matches!(segments[0], Segment::Code { .. }));
    }

    #[test]
    fn empty_placeholder_disables_detection() {
        let segments = Segmenter::new("").segment("abc");
        assert_eq!(segments, vec![Segment::text("abc")]);
    }

    #[test]
    fn mixed_content_roundtrips() {
        roundtrip("");
        roundtrip("\n\n");
        roundtrip("a\n```\n```\nb\n");
        roundtrip("```js\nx\n```");
        roundtrip("| only | table |");
        roundtrip("text\r\n```sh\r\nls\r\n```\r\n");
        roundtrip("````\nnested ``` fence\n````\n");
    }
}
