//! `dmr`: reconstructs branching conversations and exports them.

mod config;
mod error;
mod output;

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use dendrimer_core::render::{
    BranchView, ConversationView, ExportDocument, ExportOptions, RenderOptions, markdown,
};
use dendrimer_core::{
    BranchId, BranchSet, ConversationTree, EnrichReport, Enricher, LoadOptions, MessageStore,
    ToolLog,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{
    Config, load_config, resolve_include_metadata, resolve_load_options, resolve_output_dir,
};
use crate::error::DmrError;
use crate::output::{Exporter, OutputFormat, sanitize_file_stem, write_file};

#[derive(Parser)]
#[command(name = "dmr")]
#[command(about = "Reconstruct and export branching conversations", long_about = None)]
struct Cli {
    /// Log debug output to stderr (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Export a conversation to Markdown, JSON or YAML
    Export {
        /// Conversation JSON as downloaded from the chat service
        input: PathBuf,

        /// Output format: json, yaml, markdown, split or all
        #[arg(short, long, default_value = "markdown")]
        format: OutputFormat,

        /// Output directory (default: config `output_dir`, then ./exports)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Leave conversation and message metadata out of Markdown
        #[arg(long)]
        no_metadata: bool,

        /// Skip records with missing fields instead of failing
        #[arg(long)]
        skip_malformed: bool,

        /// Write single-line JSON
        #[arg(long)]
        compact: bool,
    },

    /// Replace tool placeholders in an export with calls from a tool log
    InjectToolLogs {
        /// Structural export produced by `dmr export -f json` (or yaml)
        #[arg(short, long)]
        conversation: PathBuf,

        /// Tool call log, one JSON record per line
        #[arg(short, long)]
        logs: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Output format: markdown or json
        #[arg(short, long, default_value = "markdown")]
        format: InjectFormat,

        /// Render a single branch, e.g. B2 (markdown only)
        #[arg(short, long)]
        branch: Option<BranchId>,
    },

    /// List the branches of a conversation
    Branches {
        /// Conversation JSON as downloaded from the chat service
        input: PathBuf,

        /// Skip records with missing fields instead of failing
        #[arg(long)]
        skip_malformed: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InjectFormat {
    Markdown,
    Json,
}

impl std::str::FromStr for InjectFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "markdown" | "md" => Ok(InjectFormat::Markdown),
            "json" => Ok(InjectFormat::Json),
            _ => Err(format!("unknown format: {}", s)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config();

    match cli.command {
        Command::Export {
            input,
            format,
            output,
            no_metadata,
            skip_malformed,
            compact,
        } => {
            let options = resolve_load_options(&config, skip_malformed);
            let (tree, set) = load_conversation(&input, &options)?;

            let exporter = Exporter {
                tree: &tree,
                set: &set,
                render: RenderOptions {
                    include_metadata: resolve_include_metadata(&config, no_metadata),
                },
                export: ExportOptions { pretty: !compact },
            };
            let dir = resolve_output_dir(&config, output);
            let stem = file_stem(&tree, &input);

            for path in exporter.write(format, &dir, &stem)? {
                println!("Wrote {}", path.display());
            }
        }
        Command::InjectToolLogs {
            conversation,
            logs,
            output,
            format,
            branch,
        } => {
            let report = inject_tool_logs(&config, &conversation, &logs, &output, format, branch)?;
            println!(
                "Replaced {} placeholder(s); {} unmatched, {} unused log record(s)",
                report.replaced,
                report.unmatched.len(),
                report.unused.len()
            );
            println!("Wrote {}", output.display());
        }
        Command::Branches {
            input,
            skip_malformed,
        } => {
            let options = resolve_load_options(&config, skip_malformed);
            let (tree, set) = load_conversation(&input, &options)?;
            print!("{}", branch_listing(&tree, &set));
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_file(path: &Path) -> Result<String, DmrError> {
    fs::read_to_string(path).map_err(|source| DmrError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn load_conversation(
    path: &Path,
    options: &LoadOptions,
) -> Result<(ConversationTree, BranchSet), DmrError> {
    let store = MessageStore::from_json_str(&read_file(path)?, options)?;

    let report = store.report();
    if !report.is_clean() {
        warn!(
            skipped = report.skipped.len(),
            bad_timestamps = report.bad_timestamps.len(),
            ignored_blocks = report.ignored_blocks.len(),
            duplicates = report.duplicates.len(),
            orphaned = report.orphaned.len(),
            "conversation loaded with problems"
        );
    }

    let tree = ConversationTree::build(&store)?;
    let set = BranchSet::enumerate(&tree);
    debug!(messages = tree.len(), branches = set.len(), "conversation loaded");
    Ok((tree, set))
}

/// Conversation id, or the input file name when the export has none.
fn file_stem(tree: &ConversationTree, input: &Path) -> String {
    let id = &tree.conversation().id;
    if !id.is_empty() {
        return sanitize_file_stem(id);
    }
    let name = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    sanitize_file_stem(&name)
}

fn read_export(path: &Path) -> Result<ExportDocument, DmrError> {
    let text = read_file(path)?;
    let is_yaml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    let doc = if is_yaml {
        ExportDocument::from_yaml(&text)?
    } else {
        ExportDocument::from_json(&text)?
    };
    Ok(doc)
}

fn inject_tool_logs(
    config: &Config,
    conversation: &Path,
    logs: &Path,
    output: &Path,
    format: InjectFormat,
    branch: Option<BranchId>,
) -> Result<EnrichReport, DmrError> {
    let doc = read_export(conversation)?;

    let mut log = ToolLog::from_jsonl(&read_file(logs)?);
    if !doc.conversation.id.is_empty() {
        log = log.for_conversation(&doc.conversation.id);
    }
    debug!(records = log.len(), "tool log loaded");
    let placeholder = resolve_load_options(config, false).placeholder;
    let enricher = Enricher::new(log.records()).with_placeholder(placeholder);

    let (content, report) = match format {
        InjectFormat::Json => {
            if branch.is_some() {
                warn!("--branch only applies to markdown output, ignoring");
            }
            let (enriched, report) = enricher.enrich(&doc);
            (enriched.to_json(true)?, report)
        }
        InjectFormat::Markdown => {
            let (tree, set) = doc.rebuild()?;
            let options = RenderOptions {
                include_metadata: resolve_include_metadata(config, false),
            };
            match branch {
                Some(id) => {
                    let view =
                        BranchView::branch(&tree, &set, id).ok_or(DmrError::UnknownBranch(id))?;
                    let (enriched, report) = enricher.enrich(&view);
                    (markdown::branch(&enriched, &options), report)
                }
                None => {
                    let view = ConversationView::combined(&tree, &set);
                    let (enriched, report) = enricher.enrich(&view);
                    (markdown::combined(&enriched, &options), report)
                }
            }
        }
    };

    for unmatched in &report.unmatched {
        warn!(
            message_id = %unmatched.message_id,
            segment = unmatched.segment,
            "no tool call found for placeholder"
        );
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    write_file(output, &content)?;
    Ok(report)
}

fn branch_listing(tree: &ConversationTree, set: &BranchSet) -> String {
    let mut out = format!(
        "{}: {} message(s), {} branch(es)\n",
        tree.conversation().title,
        tree.len(),
        set.len()
    );

    for branch in set.iter() {
        let mut line = format!(
            "{:<5} {:<5} {:>4} messages  leaf {}",
            branch.id.to_string(),
            if branch.is_main { "main" } else { "" },
            branch.len,
            tree.node(branch.leaf).id(),
        );
        if let Some(fork) = branch.fork_point {
            line.push_str(&format!(
                "  forks from {} (message {})",
                tree.node(fork).id(),
                tree.depth(fork) + 1
            ));
        }
        if let Some(position) = branch.diverges_at {
            line.push_str(&format!("  diverges at message {}", position + 1));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }

    if !set.divergences().is_empty() {
        out.push_str("\nDivergence points:\n");
        for (id, branches) in set.divergences() {
            let labels: Vec<String> = branches.iter().map(ToString::to_string).collect();
            out.push_str(&format!("  {id}: {}\n", labels.join(", ")));
        }
    }

    for warning in tree.warnings() {
        out.push_str(&format!("warning: {warning}\n"));
    }
    out
}
