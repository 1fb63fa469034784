//! GitHub tree fetcher: lists a branch recursively through the git trees API.
//!
//! - Construct with [`GitHubClient::new`]; the optional token (`GITHUB_TOKEN`,
//!   injected by `load_config`) raises the API rate limit.
//! - Implements [`TreeFetcher`] from the core crate; the mirror pipeline never
//!   sees HTTP details.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use tree_mirror_core::contract::{PathEntry, TreeFetcher, TreeSource};
use tree_mirror_core::error::FetchError;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

impl GitHubClient {
    pub fn new(api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn tree_url(&self, source: &TreeSource) -> String {
        format!(
            "{}/repos/{}/{}/git/trees/{}?recursive=1",
            self.api_base, source.owner, source.repo, source.branch
        )
    }
}

/// Maps git tree items to listing entries. Submodules (`commit`) are skipped.
fn to_entries(items: Vec<TreeItem>) -> Vec<PathEntry> {
    items
        .into_iter()
        .filter_map(|item| match item.kind.as_str() {
            "blob" => Some(PathEntry::file(item.path)),
            "tree" => Some(PathEntry::directory(item.path)),
            other => {
                tracing::debug!(path = %item.path, kind = other, "Skipping tree item");
                None
            }
        })
        .collect()
}

#[async_trait]
impl TreeFetcher for GitHubClient {
    async fn fetch_tree(&self, source: &TreeSource) -> Result<Vec<PathEntry>, FetchError> {
        let url = self.tree_url(source);
        tracing::info!(%url, "Requesting repository tree");

        let mut request = self
            .http
            .get(&url)
            .header(USER_AGENT, "tree-mirror")
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = ?e, %url, "Transport error fetching tree");
            FetchError::Transport(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), %url, "GitHub returned an error status");
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let tree: TreeResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        if tree.truncated {
            tracing::warn!(
                items = tree.tree.len(),
                "GitHub truncated the tree listing; the mirror will be incomplete"
            );
        }
        Ok(to_entries(tree.tree))
    }
}
