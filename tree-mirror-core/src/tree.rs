//! Path tree builder: turns a flat listing into nested directory/file nodes.
//!
//! Children live in an owned map keyed by segment name, so a node owns its
//! subtree outright and no back-references are needed. Iteration order for
//! rendering comes from [`TreeNode::sorted_children`], never from discovery
//! order.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::RootFilter;
use crate::contract::{EntryKind, PathEntry};
use crate::error::Warning;

/// One path segment of the mirrored tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub name: String,
    /// Full repository path, as listed by the source (used for links).
    pub full_path: String,
    pub is_file: bool,
    pub children: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    pub fn directory(name: impl Into<String>, full_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            full_path: full_path.into(),
            is_file: false,
            children: BTreeMap::new(),
        }
    }

    pub fn file(name: impl Into<String>, full_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            full_path: full_path.into(),
            is_file: true,
            children: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> EntryKind {
        if self.is_file {
            EntryKind::File
        } else {
            EntryKind::Directory
        }
    }

    /// Inserts `child` under its name, replacing any previous child.
    pub fn insert_child(&mut self, child: TreeNode) -> &mut TreeNode {
        match self.children.entry(child.name.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(child);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(child),
        }
    }

    /// Children in rendering order: case-insensitive by name, files and
    /// directories mixed, exact name as tie-breaker.
    pub fn sorted_children(&self) -> Vec<&TreeNode> {
        let mut children: Vec<&TreeNode> = self.children.values().collect();
        children.sort_by(|a, b| compare_names(&a.name, &b.name));
        children
    }

    /// Number of file leaves in this subtree.
    pub fn file_count(&self) -> usize {
        if self.is_file {
            return 1;
        }
        self.children.values().map(TreeNode::file_count).sum()
    }
}

pub(crate) fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

/// Result of [`build`]: the synthetic root plus any collision warnings.
#[derive(Debug, Clone)]
pub struct BuiltTree {
    /// Stands for the root folder; its children are the first level below it.
    pub root: TreeNode,
    pub warnings: Vec<Warning>,
}

/// Builds the tree from `entries`, keeping only paths under `root_filter`.
///
/// A segment already present with the other kind is overwritten (last write
/// wins) and reported as a [`Warning::Collision`].
pub fn build(entries: &[PathEntry], root_filter: &RootFilter) -> BuiltTree {
    let root_path = root_filter.prefix().trim_end_matches('/').to_string();
    let mut root = TreeNode::directory(root_filter.label(), root_path);
    let mut warnings = Vec::new();
    let mut retained = 0usize;

    for entry in entries {
        let Some(relative) = root_filter.strip(&entry.path) else {
            continue;
        };
        let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            continue;
        };
        retained += 1;

        let base_len = entry.path.len() - relative.len();
        let mut full_path = entry.path[..base_len].trim_end_matches('/').to_string();
        let mut node = &mut root;
        for segment in parents {
            push_segment(&mut full_path, segment);
            node = descend(node, segment, &full_path, &mut warnings);
        }
        push_segment(&mut full_path, last);

        let existing = node.children.get(*last).map(TreeNode::kind);
        match (existing, entry.kind) {
            (Some(EntryKind::Directory), EntryKind::Directory) => {}
            (Some(EntryKind::File), EntryKind::File) => {
                debug!(path = %entry.path, "Duplicate file entry ignored");
            }
            (existing, kind) => {
                if let Some(existing) = existing {
                    warnings.push(collision(&full_path, existing, kind));
                }
                let leaf = match kind {
                    EntryKind::File => TreeNode::file(*last, full_path),
                    EntryKind::Directory => TreeNode::directory(*last, full_path),
                };
                node.insert_child(leaf);
            }
        }
    }

    info!(
        entries = entries.len(),
        retained,
        files = root.file_count(),
        collisions = warnings.len(),
        "Built path tree"
    );
    BuiltTree { root, warnings }
}

fn push_segment(path: &mut String, segment: &str) {
    if !path.is_empty() {
        path.push('/');
    }
    path.push_str(segment);
}

/// Returns the directory child `segment`, creating it (or replacing a file
/// of the same name) when needed.
fn descend<'t>(
    node: &'t mut TreeNode,
    segment: &str,
    full_path: &str,
    warnings: &mut Vec<Warning>,
) -> &'t mut TreeNode {
    let child = node
        .children
        .entry(segment.to_string())
        .or_insert_with(|| TreeNode::directory(segment, full_path));
    if child.is_file {
        warnings.push(collision(full_path, EntryKind::File, EntryKind::Directory));
        *child = TreeNode::directory(segment, full_path);
    }
    child
}

fn collision(path: &str, existing: EntryKind, replacement: EntryKind) -> Warning {
    warn!(
        path,
        %existing,
        %replacement,
        "Path used as both file and directory, keeping the later entry"
    );
    Warning::Collision {
        path: path.to_string(),
        existing,
        replacement,
    }
}
