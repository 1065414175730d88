use std::borrow::Cow;

use chrono::{DateTime, Utc};

use crate::branch::{Branch, BranchId, BranchSet, BranchSpan};
use crate::enrich::{Enrichable, TurnInfo};
use crate::message::{Conversation, Message};
use crate::segment::Segment;
use crate::tree::{ConversationTree, NodeIndex};

/// One message as it appears in a rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn<'t> {
    /// 1-based position in every branch containing the message.
    pub ordinal: usize,
    pub node: NodeIndex,
    pub message: &'t Message,
    /// Timestamp of the parent message.
    pub previous: Option<DateTime<Utc>>,
    /// Borrowed from the message until enrichment replaces it.
    pub content: Cow<'t, [Segment]>,
}

impl<'t> Turn<'t> {
    fn new(tree: &'t ConversationTree, node: NodeIndex, ordinal: usize) -> Self {
        let message = tree.node(node).message();
        Turn {
            ordinal,
            node,
            message,
            previous: tree
                .parent(node)
                .and_then(|parent| tree.node(parent).message().timestamp),
            content: Cow::Borrowed(message.content.as_slice()),
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    fn info(&self) -> TurnInfo<'_> {
        TurnInfo {
            id: &self.message.id,
            role: self.message.role,
            timestamp: self.message.timestamp,
            previous: self.previous,
            content: &self.content,
        }
    }
}

/// Index of a [`Thread`] within a [`ConversationView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(usize);

/// A run of turns without branching, followed by the forks below its last turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread<'t> {
    /// Number of enclosing forks.
    pub depth: usize,
    /// Branches passing through this thread.
    pub span: BranchSpan,
    /// Spans of the enclosing forks, outermost first; empty for a root.
    pub path: Vec<BranchSpan>,
    pub turns: Vec<Turn<'t>>,
    pub forks: Vec<ThreadId>,
}

impl Thread<'_> {
    /// The turn the forks branch from.
    pub fn divergence(&self) -> Option<&Turn<'_>> {
        if self.forks.is_empty() {
            None
        } else {
            self.turns.last()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkPoint {
    pub id: String,
    pub ordinal: usize,
}

/// Per-branch facts shown in overviews and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSummary {
    pub id: BranchId,
    pub messages: usize,
    pub is_main: bool,
    pub fork_point: Option<ForkPoint>,
    pub diverges_at: Option<usize>,
}

impl BranchSummary {
    fn new(tree: &ConversationTree, branch: &Branch) -> Self {
        BranchSummary {
            id: branch.id,
            messages: branch.len,
            is_main: branch.is_main,
            fork_point: branch.fork_point.map(|idx| ForkPoint {
                id: tree.node(idx).id().to_string(),
                ordinal: tree.depth(idx) + 1,
            }),
            diverges_at: branch.diverges_at,
        }
    }
}

/// The merged multi-branch view: every message once, forks labelled with
/// the branches below them.
///
/// Threads are kept in an arena so arbitrarily deep fork nesting needs no
/// recursion to build, walk or drop.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView<'t> {
    pub conversation: &'t Conversation,
    pub branches: Vec<BranchSummary>,
    threads: Vec<Thread<'t>>,
    roots: Vec<ThreadId>,
}

impl<'t> ConversationView<'t> {
    pub fn combined(tree: &'t ConversationTree, set: &BranchSet) -> Self {
        let mut threads: Vec<Thread<'t>> = Vec::new();
        let mut roots = Vec::with_capacity(tree.roots().len());
        let mut pending = Vec::new();

        for &root in tree.roots() {
            let id = ThreadId(threads.len());
            threads.push(Thread {
                depth: 0,
                span: set.span(root),
                path: Vec::new(),
                turns: Vec::new(),
                forks: Vec::new(),
            });
            roots.push(id);
            pending.push((id, root, 1));
        }

        while let Some((id, start, first_ordinal)) = pending.pop() {
            let mut turns = Vec::new();
            let mut current = start;
            let mut ordinal = first_ordinal;
            loop {
                turns.push(Turn::new(tree, current, ordinal));
                match tree.node(current).children() {
                    [only] => {
                        current = *only;
                        ordinal += 1;
                    }
                    _ => break,
                }
            }

            let mut forks = Vec::new();
            let children = tree.node(current).children();
            if children.len() > 1 {
                let depth = threads[id.0].depth + 1;
                for &child in children {
                    let span = set.span(child);
                    let mut path = threads[id.0].path.clone();
                    path.push(span);

                    let fork = ThreadId(threads.len());
                    threads.push(Thread {
                        depth,
                        span,
                        path,
                        turns: Vec::new(),
                        forks: Vec::new(),
                    });
                    forks.push(fork);
                    pending.push((fork, child, ordinal + 1));
                }
            }

            let thread = &mut threads[id.0];
            thread.turns = turns;
            thread.forks = forks;
        }

        ConversationView {
            conversation: tree.conversation(),
            branches: set.iter().map(|b| BranchSummary::new(tree, b)).collect(),
            threads,
            roots,
        }
    }

    pub fn roots(&self) -> &[ThreadId] {
        &self.roots
    }

    pub fn thread(&self, id: ThreadId) -> &Thread<'t> {
        &self.threads[id.0]
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Threads in the order they are rendered: each thread, then its forks.
    pub fn document_order(&self) -> Vec<ThreadId> {
        let mut order = Vec::with_capacity(self.threads.len());
        let mut stack: Vec<ThreadId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.threads[id.0].forks.iter().rev().copied());
        }
        order
    }

    /// Every turn, each message exactly once.
    pub fn iter_turns(&self) -> impl Iterator<Item = &Turn<'t>> {
        self.threads.iter().flat_map(|thread| thread.turns.iter())
    }
}

impl Enrichable for ConversationView<'_> {
    fn turns(&self) -> Vec<TurnInfo<'_>> {
        self.threads
            .iter()
            .flat_map(|thread| thread.turns.iter())
            .map(Turn::info)
            .collect()
    }

    fn set_content(&mut self, id: &str, content: Vec<Segment>) {
        for turn in self.threads.iter_mut().flat_map(|t| t.turns.iter_mut()) {
            if turn.message.id == id {
                turn.content = Cow::Owned(content);
                return;
            }
        }
    }
}

/// One branch as a linear transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchView<'t> {
    pub conversation: &'t Conversation,
    pub summary: BranchSummary,
    pub turns: Vec<Turn<'t>>,
}

impl<'t> BranchView<'t> {
    /// `None` if the set has no branch with that id.
    pub fn branch(tree: &'t ConversationTree, set: &BranchSet, id: BranchId) -> Option<Self> {
        let branch = set.get(id)?;
        let turns = branch
            .path(tree)
            .into_iter()
            .enumerate()
            .map(|(pos, node)| Turn::new(tree, node, pos + 1))
            .collect();

        Some(BranchView {
            conversation: tree.conversation(),
            summary: BranchSummary::new(tree, branch),
            turns,
        })
    }

    /// Views of every branch in enumeration order.
    pub fn all(tree: &'t ConversationTree, set: &BranchSet) -> Vec<Self> {
        set.iter()
            .filter_map(|branch| BranchView::branch(tree, set, branch.id))
            .collect()
    }
}

impl Enrichable for BranchView<'_> {
    fn turns(&self) -> Vec<TurnInfo<'_>> {
        self.turns.iter().map(Turn::info).collect()
    }

    fn set_content(&mut self, id: &str, content: Vec<Segment>) {
        if let Some(turn) = self.turns.iter_mut().find(|turn| turn.message.id == id) {
            turn.content = Cow::Owned(content);
        }
    }
}
