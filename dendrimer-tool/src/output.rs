//! File layout for exports.

use std::fs;
use std::path::{Path, PathBuf};

use dendrimer_core::render::{
    BranchView, ConversationView, ExportDocument, ExportFormat, ExportOptions, RenderOptions,
    markdown,
};
use dendrimer_core::{BranchId, BranchSet, ConversationTree};
use tracing::debug;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::DmrError;

/// Characters that are invalid in file names on at least one common platform.
const INVALID_CHARS: &str = "<>:\"/\\|?*";
const MAX_STEM_GRAPHEMES: usize = 100;
const FALLBACK_STEM: &str = "conversation";

/// What the `export` command writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Structural export, `{stem}.json`.
    Json,
    /// Structural export, `{stem}.yaml`.
    Yaml,
    /// Combined Markdown, `{stem}.md`.
    Markdown,
    /// One Markdown file per branch plus `index.md`, in `{stem}_branches/`.
    Split,
    All,
}

impl OutputFormat {
    /// The layouts `All` stands for, in write order.
    const EVERY: [OutputFormat; 4] = [
        OutputFormat::Json,
        OutputFormat::Yaml,
        OutputFormat::Markdown,
        OutputFormat::Split,
    ];
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "yaml" | "yml" => Ok(OutputFormat::Yaml),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            "split" => Ok(OutputFormat::Split),
            "all" => Ok(OutputFormat::All),
            _ => Err(format!("unknown format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Yaml => write!(f, "yaml"),
            OutputFormat::Markdown => write!(f, "markdown"),
            OutputFormat::Split => write!(f, "split"),
            OutputFormat::All => write!(f, "all"),
        }
    }
}

/// Truncate a string to at most `max_graphemes` grapheme clusters.
fn truncate_str(s: &str, max_graphemes: usize) -> &str {
    match s.grapheme_indices(true).nth(max_graphemes) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Turns a conversation title or id into a portable file stem.
///
/// Reserved characters, whitespace and control characters become `_`.
pub fn sanitize_file_stem(name: &str) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| {
            if INVALID_CHARS.contains(c) || c.is_whitespace() || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    match truncate_str(&replaced, MAX_STEM_GRAPHEMES) {
        "" => FALLBACK_STEM.to_string(),
        stem => stem.to_string(),
    }
}

fn branch_file_name(title_stem: &str, id: BranchId) -> String {
    format!("{title_stem}_{id}.md")
}

pub fn write_file(path: &Path, content: &str) -> Result<(), DmrError> {
    fs::write(path, content).map_err(|source| DmrError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), bytes = content.len(), "wrote file");
    Ok(())
}

/// Writes the renderings of one tree into an output directory.
pub struct Exporter<'a> {
    pub tree: &'a ConversationTree,
    pub set: &'a BranchSet,
    pub render: RenderOptions,
    pub export: ExportOptions,
}

impl Exporter<'_> {
    /// Writes `format` into `dir` and returns the created files in order.
    pub fn write(
        &self,
        format: OutputFormat,
        dir: &Path,
        stem: &str,
    ) -> Result<Vec<PathBuf>, DmrError> {
        fs::create_dir_all(dir)?;

        let mut created = Vec::new();
        self.write_into(format, dir, stem, &mut created)?;
        Ok(created)
    }

    fn write_into(
        &self,
        format: OutputFormat,
        dir: &Path,
        stem: &str,
        created: &mut Vec<PathBuf>,
    ) -> Result<(), DmrError> {
        match format {
            OutputFormat::Json => {
                created.push(self.write_structural(ExportFormat::Json, dir, stem)?);
            }
            OutputFormat::Yaml => {
                created.push(self.write_structural(ExportFormat::Yaml, dir, stem)?);
            }
            OutputFormat::Markdown => {
                let path = dir.join(format!("{stem}.md"));
                let view = ConversationView::combined(self.tree, self.set);
                write_file(&path, &markdown::combined(&view, &self.render))?;
                created.push(path);
            }
            OutputFormat::Split => {
                created.extend(self.write_split(&dir.join(format!("{stem}_branches")))?);
            }
            OutputFormat::All => {
                for format in OutputFormat::EVERY {
                    self.write_into(format, dir, stem, created)?;
                }
            }
        }
        Ok(())
    }

    fn write_structural(
        &self,
        format: ExportFormat,
        dir: &Path,
        stem: &str,
    ) -> Result<PathBuf, DmrError> {
        let extension = match format {
            ExportFormat::Json => "json",
            ExportFormat::Yaml => "yaml",
        };
        let path = dir.join(format!("{stem}.{extension}"));
        let content = ExportDocument::new(self.tree, self.set).render(format, &self.export)?;
        write_file(&path, &content)?;
        Ok(path)
    }

    fn write_split(&self, dir: &Path) -> Result<Vec<PathBuf>, DmrError> {
        fs::create_dir_all(dir)?;
        let title = sanitize_file_stem(&self.tree.conversation().title);

        let mut created = Vec::new();
        for view in BranchView::all(self.tree, self.set) {
            let path = dir.join(branch_file_name(&title, view.summary.id));
            write_file(&path, &markdown::branch(&view, &self.render))?;
            created.push(path);
        }

        let combined = ConversationView::combined(self.tree, self.set);
        let index = markdown::branch_index(&combined, |id| branch_file_name(&title, id));
        let index_path = dir.join("index.md");
        write_file(&index_path, &index)?;
        created.push(index_path);

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dendrimer_core::{LoadOptions, MessageStore};

    fn fixture() -> ConversationTree {
        let input = serde_json::json!({
            "uuid": "conv-1",
            "name": "Trip: plans?",
            "chat_messages": [
                {"uuid": "m1", "sender": "human", "text": "Hi",
                 "created_at": "2024-05-01T10:00:00Z"},
                {"uuid": "m2", "parent_message_uuid": "m1", "sender": "assistant",
                 "text": "Hello", "created_at": "2024-05-01T10:00:01Z"},
                {"uuid": "m3", "parent_message_uuid": "m2", "sender": "human",
                 "text": "A", "created_at": "2024-05-01T10:00:02Z"},
                {"uuid": "m4", "parent_message_uuid": "m2", "sender": "human",
                 "text": "B", "created_at": "2024-05-01T10:00:03Z"},
            ],
        });
        let store = MessageStore::from_value(&input, &LoadOptions::default()).unwrap();
        ConversationTree::build(&store).unwrap()
    }

    fn file_names(paths: &[PathBuf], root: &Path) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_file_stem("a<b>c:d\"e/f\\g|h?i*j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize_file_stem("  Trip plans  "), "Trip_plans");
        assert_eq!(sanitize_file_stem("   "), FALLBACK_STEM);
    }

    #[test]
    fn sanitize_truncates_on_grapheme_boundaries() {
        let long = "é".repeat(150);
        assert_eq!(sanitize_file_stem(&long).chars().count(), MAX_STEM_GRAPHEMES);

        let flags = "🇵🇹".repeat(120);
        let stem = sanitize_file_stem(&flags);
        assert_eq!(stem.graphemes(true).count(), MAX_STEM_GRAPHEMES);
        assert!(stem.graphemes(true).all(|g| g == "🇵🇹"));
    }

    #[test]
    fn format_names() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("yml".parse::<OutputFormat>().unwrap(), OutputFormat::Yaml);
        assert_eq!("md".parse::<OutputFormat>().unwrap(), OutputFormat::Markdown);
        assert!("pdf".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Split.to_string(), "split");
    }

    #[test]
    fn all_writes_every_layout() {
        let tree = fixture();
        let set = BranchSet::enumerate(&tree);
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter {
            tree: &tree,
            set: &set,
            render: RenderOptions::default(),
            export: ExportOptions::default(),
        };

        let created = exporter.write(OutputFormat::All, dir.path(), "conv-1").unwrap();
        assert_eq!(
            file_names(&created, dir.path()),
            [
                "conv-1.json",
                "conv-1.yaml",
                "conv-1.md",
                "conv-1_branches/Trip__plans__B1.md",
                "conv-1_branches/Trip__plans__B2.md",
                "conv-1_branches/index.md",
            ]
        );

        let json = fs::read_to_string(dir.path().join("conv-1.json")).unwrap();
        let (rebuilt, _) = ExportDocument::from_json(&json).unwrap().rebuild().unwrap();
        assert_eq!(rebuilt.len(), tree.len());

        let index = fs::read_to_string(dir.path().join("conv-1_branches/index.md")).unwrap();
        assert!(index.contains("[B2](Trip__plans__B2.md)"));

        let b2 = fs::read_to_string(dir.path().join("conv-1_branches/Trip__plans__B2.md")).unwrap();
        assert!(b2.starts_with("# Trip: plans? - Branch B2\n"));
    }

    #[test]
    fn metadata_can_be_left_out() {
        let tree = fixture();
        let set = BranchSet::enumerate(&tree);
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter {
            tree: &tree,
            set: &set,
            render: RenderOptions {
                include_metadata: false,
            },
            export: ExportOptions::default(),
        };

        let created = exporter.write(OutputFormat::Markdown, dir.path(), "c").unwrap();
        let text = fs::read_to_string(&created[0]).unwrap();
        assert!(!text.contains("## Conversation Metadata"));
        assert!(!text.contains("*Message ID:"));
    }
}
