//! Root-to-leaf paths through a [`ConversationTree`].

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::tree::{ConversationTree, NodeIndex};

/// Stable branch identifier, displayed as `B1`, `B2`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchId(u32);

impl BranchId {
    /// Branch ids are 1-based; `0` is rejected.
    pub fn new(number: u32) -> Option<Self> {
        (number > 0).then_some(BranchId(number))
    }

    pub fn number(self) -> u32 {
        self.0
    }

    pub fn is_main(self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Error parsing a [`BranchId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid branch id: {0:?}")]
pub struct ParseBranchIdError(String);

impl FromStr for BranchId {
    type Err = ParseBranchIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('B')
            .and_then(|n| n.parse::<u32>().ok())
            .and_then(BranchId::new)
            .ok_or_else(|| ParseBranchIdError(s.to_string()))
    }
}

impl TryFrom<String> for BranchId {
    type Error = ParseBranchIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BranchId> for String {
    fn from(id: BranchId) -> Self {
        id.to_string()
    }
}

/// Contiguous range of branch ids whose paths contain a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchSpan {
    first: BranchId,
    last: BranchId,
}

impl BranchSpan {
    pub fn first(&self) -> BranchId {
        self.first
    }

    pub fn last(&self) -> BranchId {
        self.last
    }

    pub fn contains(&self, id: BranchId) -> bool {
        self.first <= id && id <= self.last
    }

    pub fn len(&self) -> usize {
        (self.last.0 + 1).saturating_sub(self.first.0) as usize
    }

    /// Spans produced by [`BranchSet::enumerate`] hold at least one branch.
    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    pub fn ids(self) -> impl Iterator<Item = BranchId> {
        (self.first.0..=self.last.0).map(BranchId)
    }
}

impl fmt::Display for BranchSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

/// One root-to-leaf path.
///
/// The prefix is not stored: it is recovered through the tree's ancestor
/// index from `leaf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub id: BranchId,
    pub leaf: NodeIndex,
    pub root: NodeIndex,
    /// Number of messages on the path.
    pub len: usize,
    /// The first branch overall.
    pub is_main: bool,
    /// Divergence node where this branch leaves the branch enumerated just
    /// before it; `None` for the first branch of each root.
    pub fork_point: Option<NodeIndex>,
    /// Position of the first message that differs from `B1`; `None` for `B1`
    /// itself and for branches under other roots.
    pub diverges_at: Option<usize>,
}

impl Branch {
    /// Nodes of the path, root first.
    pub fn path(&self, tree: &ConversationTree) -> Vec<NodeIndex> {
        tree.path_to(self.leaf)
    }

    pub fn message_ids<'t>(&self, tree: &'t ConversationTree) -> Vec<&'t str> {
        self.path(tree)
            .into_iter()
            .map(|idx| tree.node(idx).id())
            .collect()
    }
}

/// All branches of a tree plus the per-node spans and divergence map.
#[derive(Debug, Clone, Default)]
pub struct BranchSet {
    branches: Vec<Branch>,
    /// Indexed by node.
    spans: Vec<BranchSpan>,
    divergences: IndexMap<String, Vec<BranchId>>,
}

impl BranchSet {
    /// Enumerates branches depth-first, left to right, numbering leaves in
    /// discovery order.
    #[instrument(skip(tree), fields(nodes = tree.len()))]
    pub fn enumerate(tree: &ConversationTree) -> Self {
        let preorder = tree.preorder();

        let mut leaf_ids = vec![0u32; tree.len()];
        let mut next = 0;
        for &idx in &preorder {
            if tree.node(idx).is_leaf() {
                next += 1;
                leaf_ids[idx.index()] = next;
            }
        }

        // Children precede parents in reverse pre-order.
        let mut bounds = vec![(0u32, 0u32); tree.len()];
        for &idx in preorder.iter().rev() {
            let children = tree.node(idx).children();
            bounds[idx.index()] = match (children.first(), children.last()) {
                (Some(first), Some(last)) => (bounds[first.index()].0, bounds[last.index()].1),
                _ => (leaf_ids[idx.index()], leaf_ids[idx.index()]),
            };
        }
        let spans: Vec<BranchSpan> = bounds
            .into_iter()
            .map(|(first, last)| BranchSpan {
                first: BranchId(first),
                last: BranchId(last),
            })
            .collect();

        let first_leaf = preorder.iter().copied().find(|&idx| tree.node(idx).is_leaf());
        let mut on_main = vec![false; tree.len()];
        for idx in std::iter::successors(first_leaf, |&idx| tree.parent(idx)) {
            on_main[idx.index()] = true;
        }

        // Parents precede children in pre-order. `anchor` is the deepest strict
        // ancestor on the main branch. The first leaf under a non-first child
        // forks from that child's parent.
        let mut depth = vec![0usize; tree.len()];
        let mut roots: Vec<Option<NodeIndex>> = vec![None; tree.len()];
        let mut anchor: Vec<Option<NodeIndex>> = vec![None; tree.len()];
        let mut fork_points: Vec<Option<NodeIndex>> = vec![None; next as usize + 1];
        for &idx in &preorder {
            match tree.parent(idx) {
                Some(parent) => {
                    depth[idx.index()] = depth[parent.index()] + 1;
                    roots[idx.index()] = roots[parent.index()];
                    anchor[idx.index()] = if on_main[parent.index()] {
                        Some(parent)
                    } else {
                        anchor[parent.index()]
                    };
                }
                None => roots[idx.index()] = Some(idx),
            }
            for &child in tree.node(idx).children().iter().skip(1) {
                fork_points[spans[child.index()].first.0 as usize] = Some(idx);
            }
        }

        let branches: Vec<Branch> = preorder
            .iter()
            .copied()
            .filter(|&idx| tree.node(idx).is_leaf())
            .map(|leaf| {
                let id = BranchId(leaf_ids[leaf.index()]);
                let diverges_at = if id.is_main() {
                    None
                } else {
                    anchor[leaf.index()].map(|lca| depth[lca.index()] + 1)
                };
                Branch {
                    id,
                    leaf,
                    root: roots[leaf.index()].unwrap_or(leaf),
                    len: depth[leaf.index()] + 1,
                    is_main: id.is_main(),
                    fork_point: fork_points[id.0 as usize],
                    diverges_at,
                }
            })
            .collect();

        let divergences = preorder
            .iter()
            .filter(|&&idx| tree.node(idx).is_divergence())
            .map(|&idx| (tree.node(idx).id().to_string(), spans[idx.index()].ids().collect()))
            .collect();

        debug!(branches = branches.len(), "enumerated branches");
        BranchSet {
            branches,
            spans,
            divergences,
        }
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Branch> {
        self.branches.iter()
    }

    pub fn get(&self, id: BranchId) -> Option<&Branch> {
        self.branches.get(id.0 as usize - 1)
    }

    pub fn main(&self) -> Option<&Branch> {
        self.branches.first()
    }

    /// Branches whose paths contain the node.
    pub fn span(&self, idx: NodeIndex) -> BranchSpan {
        self.spans[idx.index()]
    }

    /// Divergence node id to the ids of every branch through it, in
    /// pre-order of the nodes.
    pub fn divergences(&self) -> &IndexMap<String, Vec<BranchId>> {
        &self.divergences
    }
}
