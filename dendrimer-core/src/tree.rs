//! Arena tree of messages linked through parent references.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::message::{Conversation, Message};
use crate::store::MessageStore;

/// Position of a node in the tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A message and its ordered children.
#[derive(Debug, Clone)]
pub struct TreeNode {
    message: Message,
    /// Sorted by timestamp (missing last), then id.
    children: Vec<NodeIndex>,
}

impl TreeNode {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether the conversation branches at this node.
    pub fn is_divergence(&self) -> bool {
        self.children.len() > 1
    }
}

/// Non-fatal structural findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildWarning {
    /// The parent is referenced but absent; the node became a root.
    DanglingParent { id: String, parent_id: String },
}

impl fmt::Display for BuildWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildWarning::DanglingParent { id, parent_id } => {
                write!(f, "message {id} references missing parent {parent_id}")
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

/// The full forest of conversation states.
///
/// Nodes live in an arena indexed by [`NodeIndex`]. The ancestor index is a
/// separate table, so nodes never point back at their parents.
#[derive(Debug, Clone)]
pub struct ConversationTree {
    conversation: Conversation,
    nodes: Vec<TreeNode>,
    /// Ancestor index, parallel to `nodes`.
    parents: Vec<Option<NodeIndex>>,
    lookup: HashMap<String, NodeIndex>,
    /// Sorted the same way as children.
    roots: Vec<NodeIndex>,
    warnings: Vec<BuildWarning>,
}

impl ConversationTree {
    /// Links the messages of a store into a forest.
    ///
    /// Fails with [`Error::CycleDetected`] if parent links loop; no partial
    /// tree is returned.
    #[instrument(skip(store), fields(conversation = %store.conversation().id, messages = store.len()))]
    pub fn build(store: &MessageStore) -> Result<Self> {
        // Pass 1: one node per message, no links.
        let messages: Vec<Message> = store.iter().cloned().collect();
        let lookup: HashMap<String, NodeIndex> = messages
            .iter()
            .enumerate()
            .map(|(idx, message)| (message.id.clone(), NodeIndex(idx)))
            .collect();

        // Pass 2: resolve parent references.
        let mut warnings = Vec::new();
        let parents: Vec<Option<NodeIndex>> = messages
            .iter()
            .map(|message| {
                let parent_id = message.parent_id.as_deref()?;
                let parent = lookup.get(parent_id).copied();
                if parent.is_none() {
                    warn!(id = %message.id, parent_id, "dangling parent, treating as root");
                    warnings.push(BuildWarning::DanglingParent {
                        id: message.id.clone(),
                        parent_id: parent_id.to_string(),
                    });
                }
                parent
            })
            .collect();

        if let Some(cycle) = find_cycle(&parents) {
            let mut ids: Vec<String> = cycle
                .into_iter()
                .map(|idx| messages[idx.0].id.clone())
                .collect();
            if let Some(first) = ids.iter().enumerate().min_by(|a, b| a.1.cmp(b.1)).map(|(i, _)| i) {
                ids.rotate_left(first);
            }
            return Err(Error::CycleDetected { ids });
        }

        let mut children = vec![Vec::new(); messages.len()];
        let mut roots = Vec::new();
        for (idx, parent) in parents.iter().enumerate() {
            match parent {
                Some(parent) => children[parent.0].push(NodeIndex(idx)),
                None => roots.push(NodeIndex(idx)),
            }
        }
        let by_time = |a: &NodeIndex, b: &NodeIndex| messages[a.0].chronological_cmp(&messages[b.0]);
        roots.sort_by(by_time);
        for list in &mut children {
            list.sort_by(by_time);
        }

        let nodes: Vec<TreeNode> = messages
            .into_iter()
            .zip(children)
            .map(|(message, children)| TreeNode { message, children })
            .collect();

        debug!(nodes = nodes.len(), roots = roots.len(), warnings = warnings.len(), "built conversation tree");
        Ok(ConversationTree {
            conversation: store.conversation().clone(),
            nodes,
            parents,
            lookup,
            roots,
            warnings,
        })
    }

    /// Rebuilds a tree from explicit links, trusting their order.
    ///
    /// Every referenced id must exist, every node must be reached exactly once
    /// from `roots`, and a child's `parent_id` must name the node listing it.
    pub(crate) fn assemble(
        conversation: Conversation,
        entries: Vec<(Message, Vec<String>)>,
        root_ids: &[String],
        warnings: Vec<BuildWarning>,
    ) -> Result<Self> {
        let mut lookup = HashMap::with_capacity(entries.len());
        for (idx, (message, _)) in entries.iter().enumerate() {
            if lookup.insert(message.id.clone(), NodeIndex(idx)).is_some() {
                return Err(Error::invalid_export(format!("message {} is listed twice", message.id)));
            }
        }
        let resolve = |id: &str| {
            lookup
                .get(id)
                .copied()
                .ok_or_else(|| Error::invalid_export(format!("unknown message {id}")))
        };

        let roots = root_ids.iter().map(|id| resolve(id.as_str())).collect::<Result<Vec<_>>>()?;
        let mut nodes = Vec::with_capacity(entries.len());
        for (message, child_ids) in entries {
            let children = child_ids.iter().map(|id| resolve(id.as_str())).collect::<Result<Vec<_>>>()?;
            nodes.push(TreeNode { message, children });
        }

        let mut parents = vec![None; nodes.len()];
        let mut seen = vec![false; nodes.len()];
        let mut stack: Vec<NodeIndex> = roots.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            if std::mem::replace(&mut seen[idx.0], true) {
                return Err(Error::invalid_export(format!(
                    "message {} is reachable more than once",
                    nodes[idx.0].id()
                )));
            }
            for &child in nodes[idx.0].children.iter().rev() {
                if nodes[child.0].message.parent_id.as_deref() != Some(nodes[idx.0].id()) {
                    return Err(Error::invalid_export(format!(
                        "message {} is listed under {} but names a different parent",
                        nodes[child.0].id(),
                        nodes[idx.0].id()
                    )));
                }
                parents[child.0] = Some(idx);
                stack.push(child);
            }
        }
        if let Some(missing) = seen.iter().position(|seen| !seen) {
            return Err(Error::invalid_export(format!(
                "message {} is not reachable from any root",
                nodes[missing].id()
            )));
        }

        Ok(ConversationTree {
            conversation,
            nodes,
            parents,
            lookup,
            roots,
            warnings,
        })
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    pub fn node(&self, idx: NodeIndex) -> &TreeNode {
        &self.nodes[idx.0]
    }

    pub fn get(&self, id: &str) -> Option<NodeIndex> {
        self.lookup.get(id).copied()
    }

    pub fn parent(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.parents[idx.0]
    }

    pub fn warnings(&self) -> &[BuildWarning] {
        &self.warnings
    }

    /// Number of ancestors of the node.
    pub fn depth(&self, idx: NodeIndex) -> usize {
        std::iter::successors(self.parent(idx), |&p| self.parent(p)).count()
    }

    /// The node and its ancestors, root first.
    pub fn path_to(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut path: Vec<NodeIndex> =
            std::iter::successors(Some(idx), |&p| self.parent(p)).collect();
        path.reverse();
        path
    }

    /// Depth-first pre-order over all roots, children left to right.
    pub fn preorder(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeIndex> = self.roots.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            order.push(idx);
            stack.extend(self.nodes[idx.0].children.iter().rev().copied());
        }
        order
    }

    /// Leaves in pre-order.
    pub fn leaves(&self) -> Vec<NodeIndex> {
        self.preorder()
            .into_iter()
            .filter(|&idx| self.node(idx).is_leaf())
            .collect()
    }
}

/// Follows parent links from every node; returns the nodes of the first loop.
fn find_cycle(parents: &[Option<NodeIndex>]) -> Option<Vec<NodeIndex>> {
    let mut marks = vec![Mark::Unvisited; parents.len()];

    for start in 0..parents.len() {
        let mut path = Vec::new();
        let mut current = Some(NodeIndex(start));
        while let Some(idx) = current {
            if marks[idx.0] != Mark::Unvisited {
                break;
            }
            marks[idx.0] = Mark::Active;
            path.push(idx);
            current = parents[idx.0];
        }

        if let Some(idx) = current {
            if marks[idx.0] == Mark::Active {
                let entry = path.iter().position(|&p| p == idx).unwrap_or(0);
                return Some(path.split_off(entry));
            }
        }
        for idx in path {
            marks[idx.0] = Mark::Done;
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap())
    }

    fn msg(id: &str, parent: Option<&str>, ts: Option<DateTime<Utc>>) -> Message {
        Message::text(id, parent, Role::Human, ts, id)
    }

    fn build(messages: Vec<Message>) -> Result<ConversationTree> {
        let store = MessageStore::from_messages(Conversation::default(), messages)?;
        ConversationTree::build(&store)
    }

    fn ids(tree: &ConversationTree, indices: &[NodeIndex]) -> Vec<String> {
        indices.iter().map(|&i| tree.node(i).id().to_string()).collect()
    }

    #[test]
    fn children_sorted_by_time_then_id() {
        let tree = build(vec![
            msg("c", Some("r"), None),
            msg("b", Some("r"), at(2)),
            msg("a", Some("r"), at(2)),
            msg("z", Some("r"), at(1)),
            msg("r", None, at(0)),
        ])
        .unwrap();

        let root = tree.roots()[0];
        assert_eq!(tree.node(root).id(), "r");
        assert_eq!(ids(&tree, tree.node(root).children()), ["z", "a", "b", "c"]);
        assert!(tree.node(root).is_divergence());
    }

    #[test]
    fn ancestor_index_and_paths() {
        let tree = build(vec![
            msg("m1", None, at(0)),
            msg("m2", Some("m1"), at(1)),
            msg("m3", Some("m2"), at(2)),
        ])
        .unwrap();

        let leaf = tree.get("m3").unwrap();
        assert_eq!(ids(&tree, &tree.path_to(leaf)), ["m1", "m2", "m3"]);
        assert_eq!(tree.depth(leaf), 2);
        assert_eq!(tree.parent(tree.get("m1").unwrap()), None);
        assert_eq!(ids(&tree, &tree.leaves()), ["m3"]);
    }

    #[test]
    fn dangling_parent_becomes_root() {
        let tree = build(vec![
            msg("a", None, at(0)),
            msg("orphan", Some("gone"), at(1)),
        ])
        .unwrap();

        assert_eq!(ids(&tree, tree.roots()), ["a", "orphan"]);
        assert_eq!(
            tree.warnings(),
            [BuildWarning::DanglingParent {
                id: "orphan".to_string(),
                parent_id: "gone".to_string()
            }]
        );
    }

    #[test]
    fn cycle_is_rejected() {
        let err = build(vec![
            msg("root", None, at(0)),
            msg("x", Some("z"), at(1)),
            msg("y", Some("x"), at(2)),
            msg("z", Some("y"), at(3)),
            msg("tail", Some("x"), at(4)),
        ])
        .unwrap_err();

        match err {
            Error::CycleDetected { ids } => assert_eq!(ids, ["x", "z", "y"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_parent_is_a_cycle() {
        let err = build(vec![msg("me", Some("me"), at(0))]).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { ids } if ids == ["me"]));
    }

    #[test]
    fn preorder_walks_forest() {
        let tree = build(vec![
            msg("r2", None, at(10)),
            msg("r1", None, at(0)),
            msg("b", Some("r1"), at(2)),
            msg("a", Some("r1"), at(1)),
            msg("a1", Some("a"), at(3)),
        ])
        .unwrap();

        assert_eq!(ids(&tree, &tree.preorder()), ["r1", "a", "a1", "b", "r2"]);
    }

    #[test]
    fn empty_store_builds_empty_tree() {
        let tree = build(Vec::new()).unwrap();
        assert!(tree.is_empty());
        assert!(tree.roots().is_empty());
    }

    #[test]
    fn assemble_validates_links() {
        let conversation = Conversation::default();
        let root = msg("r", None, at(0));
        let child = msg("c", Some("r"), at(1));

        let ok = ConversationTree::assemble(
            conversation.clone(),
            vec![(root.clone(), vec!["c".to_string()]), (child.clone(), vec![])],
            &["r".to_string()],
            Vec::new(),
        )
        .unwrap();
        assert_eq!(ok.parent(ok.get("c").unwrap()), ok.get("r"));

        let unreachable = ConversationTree::assemble(
            conversation.clone(),
            vec![(root.clone(), vec![]), (child.clone(), vec![])],
            &["r".to_string()],
            Vec::new(),
        );
        assert!(matches!(unreachable, Err(Error::InvalidExport { .. })));

        let wrong_parent = ConversationTree::assemble(
            conversation,
            vec![
                (root, vec!["c".to_string()]),
                (msg("c", Some("elsewhere"), at(1)), vec![]),
            ],
            &["r".to_string()],
            Vec::new(),
        );
        assert!(matches!(wrong_parent, Err(Error::InvalidExport { .. })));
    }
}
