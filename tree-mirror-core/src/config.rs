use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Discord's documented per-message character limit.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 2000;

/// Which tree levels become destinations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthScheme {
    /// Every first-level folder is a channel holding its whole subtree.
    #[default]
    Channel,
    /// First-level folders are channels, second-level folders are threads.
    ChannelAndThread,
}

/// Bounded retry for resolve/post calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        std::time::Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

/// Path prefix selecting the mirrored part of the repository.
///
/// Matching is ASCII case-insensitive. A non-empty prefix always ends in `/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct RootFilter {
    prefix: String,
}

impl RootFilter {
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self { prefix }
    }

    /// Filter that keeps every path.
    pub fn everything() -> Self {
        Self::new("")
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the part of `path` below the root folder, or `None` when the
    /// path lies outside it.
    pub fn strip<'p>(&self, path: &'p str) -> Option<&'p str> {
        let head = path.get(..self.prefix.len())?;
        if head.eq_ignore_ascii_case(&self.prefix) {
            path.get(self.prefix.len()..)
        } else {
            None
        }
    }

    /// Display label of the root folder (its last segment).
    pub fn label(&self) -> &str {
        self.prefix
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("root")
    }
}

impl From<String> for RootFilter {
    fn from(value: String) -> Self {
        RootFilter::new(&value)
    }
}

impl From<RootFilter> for String {
    fn from(value: RootFilter) -> Self {
        value.prefix
    }
}

/// Everything the pipeline needs besides the collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub root: RootFilter,
    /// Base URL the percent-encoded repository path is appended to.
    pub link_base: String,
    #[serde(default)]
    pub depth: DepthScheme,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_chunk_size() -> usize {
    DEFAULT_MAX_CHUNK_SIZE
}

fn default_max_concurrent_calls() -> usize {
    4
}

impl MirrorConfig {
    pub fn new(root: RootFilter, link_base: impl Into<String>, depth: DepthScheme) -> Self {
        Self {
            root,
            link_base: link_base.into(),
            depth,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_concurrent_calls: default_max_concurrent_calls(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunk_limit()?;
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }

    pub fn chunk_limit(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.max_chunk_size).ok_or(ConfigError::ZeroChunkSize)
    }

    pub fn trace_loaded(&self) {
        info!(
            root = self.root.prefix(),
            link_base = %self.link_base,
            depth = ?self.depth,
            max_chunk_size = self.max_chunk_size,
            max_concurrent_calls = self.max_concurrent_calls,
            "Loaded MirrorConfig"
        );
        debug!(?self, "MirrorConfig loaded (full debug)");
    }
}
