//! # contract: interfaces to the outside world
//!
//! This module defines the three collaborator traits the mirror pipeline calls
//! into, together with the plain data passed across them:
//!
//! - [`TreeFetcher`]: one-shot recursive listing of a repository tree.
//! - [`DestinationResolver`]: idempotent lookup-or-create of a channel/thread.
//! - [`ChunkPoster`]: append one message to a resolved destination.
//!
//! ## Interface & Extensibility
//! - All methods are async and return results; resolve/post failures are boxed
//!   ([`CollaboratorError`]) since implementors wrap arbitrary HTTP clients.
//! - The core implements none of these traits. The binary crate ships a GitHub
//!   fetcher, a Discord client and a dry-run printer.
//!
//! ## Mocking & Testing
//! - The traits are annotated for `mockall` so tests can generate deterministic
//!   mocks (`MockTreeFetcher`, `MockDestinationResolver`, `MockChunkPoster`).
//!   Mocks are exported behind the default `test-export-mocks` feature so the
//!   binary crate's tests can use them too.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::{CollaboratorError, FetchError};

/// Kind of a listed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::File => f.write_str("file"),
            EntryKind::Directory => f.write_str("directory"),
        }
    }
}

/// One row of the source listing. `path` uses `/` as separator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub path: String,
    pub kind: EntryKind,
}

impl PathEntry {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
        }
    }
}

/// Identifies the tree to list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSource {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

/// What kind of destination the resolver should look up or create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Channel,
    Thread,
}

/// Opaque identifier of a resolved channel or thread (e.g. a snowflake id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DestinationHandle(pub String);

impl std::fmt::Display for DestinationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request passed to [`DestinationResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRequest {
    /// Stable key, unique within a run (`Channel` or `Channel/Thread`).
    pub key: String,
    /// Human-readable name to look up or create.
    pub display_name: String,
    pub kind_hint: DestinationKind,
    /// Handle of the owning channel, set for threads only.
    pub parent: Option<DestinationHandle>,
}

/// Answer of the resolver: whether the destination existed and its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistenceRecord {
    pub key: String,
    pub already_exists: bool,
    pub handle: DestinationHandle,
}

/// Acknowledgement of a posted chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    pub message_id: Option<String>,
}

/// Lists the full tree of a repository, recursively, in one call.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait TreeFetcher: Send + Sync {
    async fn fetch_tree(&self, source: &TreeSource) -> Result<Vec<PathEntry>, FetchError>;
}

/// Looks up a channel/thread and creates it when missing.
///
/// Must be safe to call repeatedly with the same key.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn resolve(
        &self,
        request: &DestinationRequest,
    ) -> Result<ExistenceRecord, CollaboratorError>;
}

/// Appends one message to a destination. No batching.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ChunkPoster: Send + Sync {
    async fn post_chunk(
        &self,
        handle: &DestinationHandle,
        text: &str,
    ) -> Result<Ack, CollaboratorError>;
}
