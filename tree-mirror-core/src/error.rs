//! Error and warning types shared by the mirror pipeline.
//!
//! Fatal errors ([`FetchError`], [`StructuralError`]) abort a run before any
//! destination is touched. Everything else is either a per-destination
//! failure, recorded in the report, or a [`Warning`] surfaced to the operator.

use serde::Serialize;
use thiserror::Error;

use crate::contract::EntryKind;

/// Error returned by collaborator implementations (resolve/post).
///
/// Collaborators wrap arbitrary clients, so their failures stay boxed.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// The tree listing could not be obtained.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("tree request failed: {0}")]
    Transport(String),

    #[error("tree request returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("tree response could not be decoded: {0}")]
    Decode(String),
}

/// The partition produced an impossible layout.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StructuralError {
    #[error("destination key {key:?} produced by more than one folder")]
    DuplicateKey { key: String },
}

/// Invalid mirror configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_chunk_size must be greater than zero")]
    ZeroChunkSize,

    #[error("max_concurrent_calls must be greater than zero")]
    ZeroConcurrency,

    #[error("retry.max_attempts must be greater than zero")]
    ZeroAttempts,
}

/// Fatal outcome of a mirror run.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Non-fatal observations collected during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Warning {
    /// A node was replaced by a node of the other kind at the same path.
    Collision {
        path: String,
        existing: EntryKind,
        replacement: EntryKind,
    },
    /// A single rendered line exceeded the chunk limit and was sent whole.
    OversizedLine {
        destination: String,
        line_index: usize,
        length: usize,
        max_size: usize,
    },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::Collision {
                path,
                existing,
                replacement,
            } => write!(f, "{path}: {existing} replaced by {replacement}"),
            Warning::OversizedLine {
                destination,
                line_index,
                length,
                max_size,
            } => write!(
                f,
                "{destination}: line {line_index} is {length} characters (limit {max_size}), sent unsplit"
            ),
        }
    }
}
