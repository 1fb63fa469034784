//! Partition policy: decides which tree nodes become destinations.
//!
//! Depth 1 (the folders directly under the root folder) always maps to
//! channels. With [`DepthScheme::ChannelAndThread`] the folders one level
//! deeper become threads of their channel, and the channel itself only
//! carries the files that sit directly inside it. Files lying directly in the
//! root folder are gathered into a root destination with an empty key, so
//! every retained file lands in exactly one destination.

use std::collections::BTreeSet;
use tracing::{debug, error, info};

use crate::config::DepthScheme;
use crate::contract::DestinationKind;
use crate::error::StructuralError;
use crate::tree::TreeNode;

/// How much of a destination's node is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Everything beneath the node, nested directories included.
    Subtree,
    /// Only the files sitting directly in the node.
    DirectFiles,
}

/// The channel a thread belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub key: String,
    pub display_name: String,
}

/// Where a destination lives on the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Channel,
    Thread { channel: ChannelRef },
}

/// A posting target derived from a tree node, not yet rendered.
#[derive(Debug, Clone)]
pub struct Destination<'t> {
    /// `/`-joined segments below the root folder; empty for the root destination.
    pub key: String,
    pub display_name: String,
    pub placement: Placement,
    pub scope: Scope,
    pub node: &'t TreeNode,
}

impl Destination<'_> {
    pub fn kind(&self) -> DestinationKind {
        match self.placement {
            Placement::Channel => DestinationKind::Channel,
            Placement::Thread { .. } => DestinationKind::Thread,
        }
    }

    /// Key of the channel that has to exist before this destination can be posted to.
    pub fn channel_key(&self) -> &str {
        match &self.placement {
            Placement::Channel => &self.key,
            Placement::Thread { channel } => &channel.key,
        }
    }

    /// Label for logs and reports; the root destination has an empty key.
    pub fn label(&self) -> &str {
        if self.key.is_empty() {
            &self.display_name
        } else {
            &self.key
        }
    }
}

/// Splits the tree under `root` into destinations, sorted by key.
pub fn partition(root: &TreeNode, depth: DepthScheme) -> Result<Vec<Destination<'_>>, StructuralError> {
    let mut destinations = Vec::new();

    if has_direct_files(root) {
        destinations.push(Destination {
            key: String::new(),
            display_name: root.name.clone(),
            placement: Placement::Channel,
            scope: Scope::DirectFiles,
            node: root,
        });
    }

    for channel in directories(root) {
        match depth {
            DepthScheme::Channel => destinations.push(Destination {
                key: channel.name.clone(),
                display_name: channel.name.clone(),
                placement: Placement::Channel,
                scope: Scope::Subtree,
                node: channel,
            }),
            DepthScheme::ChannelAndThread => {
                if has_direct_files(channel) {
                    destinations.push(Destination {
                        key: channel.name.clone(),
                        display_name: channel.name.clone(),
                        placement: Placement::Channel,
                        scope: Scope::DirectFiles,
                        node: channel,
                    });
                }
                let channel_ref = ChannelRef {
                    key: channel.name.clone(),
                    display_name: channel.name.clone(),
                };
                for thread in directories(channel) {
                    destinations.push(Destination {
                        key: format!("{}/{}", channel.name, thread.name),
                        display_name: thread.name.clone(),
                        placement: Placement::Thread {
                            channel: channel_ref.clone(),
                        },
                        scope: Scope::Subtree,
                        node: thread,
                    });
                }
            }
        }
    }

    let mut seen = BTreeSet::new();
    for destination in &destinations {
        if !seen.insert(destination.key.as_str()) {
            error!(key = %destination.key, "Two folders map to the same destination key");
            return Err(StructuralError::DuplicateKey {
                key: destination.key.clone(),
            });
        }
        debug!(key = %destination.key, kind = ?destination.kind(), scope = ?destination.scope, "Partitioned destination");
    }

    destinations.sort_by(|a, b| a.key.cmp(&b.key));
    info!(destinations = destinations.len(), ?depth, "Partitioned tree");
    Ok(destinations)
}

fn has_direct_files(node: &TreeNode) -> bool {
    node.children.values().any(|child| child.is_file)
}

fn directories(node: &TreeNode) -> impl Iterator<Item = &TreeNode> {
    node.sorted_children().into_iter().filter(|child| !child.is_file)
}
