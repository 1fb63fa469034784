/// `load_config` module: Loads a static YAML config, injects secrets from the environment and
/// adapts it into the core [`MirrorConfig`] plus the collaborator settings of the CLI.
///
/// This module is the only place where untrusted YAML is parsed and mapped to strongly-typed structs.
///
/// # Responsibilities
/// - Parse the user-supplied YAML file into type-safe Rust structs
/// - Fill in defaults (link base, chunk size, concurrency, retry, API base URLs)
/// - Fall back to `GITHUB_REPOSITORY` / `GITHUB_REF` when the file names no source,
///   the way a CI job provides them
/// - Inject `DISCORD_TOKEN` and `GITHUB_TOKEN` from the environment; they never live in the file
/// - Validate the mirror settings so a bad file fails before any network call
///
/// # Errors
/// All errors in this module use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};
use tree_mirror_core::config::{DepthScheme, MirrorConfig, RetryPolicy, RootFilter};
use tree_mirror_core::contract::TreeSource;

#[derive(Debug)]
pub struct CliConfig {
    pub source: TreeSource,
    pub mirror: MirrorConfig,
    /// Wall-clock limit for the whole run; remaining work is cancelled.
    pub timeout: Option<Duration>,
    pub discord: DiscordSection,
    pub github: GitHubSection,
    /// `DISCORD_TOKEN`; only required when actually posting.
    pub discord_token: Option<String>,
    /// `GITHUB_TOKEN`; optional.
    pub github_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MirrorSection {
    #[serde(default = "RootFilter::everything")]
    pub root: RootFilter,
    #[serde(default)]
    pub link_base: Option<String>,
    #[serde(default)]
    pub depth: DepthScheme,
    #[serde(default)]
    pub max_chunk_size: Option<usize>,
    #[serde(default)]
    pub max_concurrent_calls: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordSection {
    pub guild_id: u64,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_discord_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubSection {
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_base: default_github_api_base(),
        }
    }
}

fn default_category() -> String {
    "archive".to_string()
}

fn default_discord_api_base() -> String {
    crate::discord::DEFAULT_API_BASE.to_string()
}

fn default_github_api_base() -> String {
    crate::github::DEFAULT_API_BASE.to_string()
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    source: Option<TreeSource>,
    mirror: MirrorSection,
    discord: DiscordSection,
    #[serde(default)]
    github: GitHubSection,
}

/// Derives the source from the variables a GitHub Actions job sets:
/// `GITHUB_REPOSITORY` (`owner/repo`) and `GITHUB_REF` (`refs/heads/<branch>`).
pub fn source_from_env() -> Result<TreeSource> {
    let repository = env::var("GITHUB_REPOSITORY")
        .context("config has no `source` section and GITHUB_REPOSITORY is not set")?;
    let reference =
        env::var("GITHUB_REF").context("config has no `source` section and GITHUB_REF is not set")?;

    let (owner, repo) = repository
        .split_once('/')
        .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty())
        .ok_or_else(|| anyhow!("GITHUB_REPOSITORY must look like owner/repo, got {repository:?}"))?;
    let branch = reference
        .rsplit('/')
        .next()
        .filter(|branch| !branch.is_empty())
        .ok_or_else(|| anyhow!("GITHUB_REF has no branch segment: {reference:?}"))?;

    Ok(TreeSource {
        owner: owner.to_string(),
        repo: repo.to_string(),
        branch: branch.to_string(),
    })
}

fn secret(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Loads a static YAML config file (no secrets) and injects the secrets from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let raw: RawConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    let source = match raw.source {
        Some(source) => source,
        None => source_from_env()?,
    };

    let section = raw.mirror;
    let link_base = section.link_base.unwrap_or_else(|| {
        format!(
            "https://github.com/{}/{}/blob/{}",
            source.owner, source.repo, source.branch
        )
    });
    let mut mirror = MirrorConfig::new(section.root, link_base, section.depth);
    if let Some(max_chunk_size) = section.max_chunk_size {
        mirror.max_chunk_size = max_chunk_size;
    }
    if let Some(max_concurrent_calls) = section.max_concurrent_calls {
        mirror.max_concurrent_calls = max_concurrent_calls;
    }
    if let Some(retry) = section.retry {
        mirror.retry = retry;
    }
    mirror
        .validate()
        .map_err(|e| anyhow!("Invalid mirror configuration: {e}"))?;
    mirror.trace_loaded();

    let config = CliConfig {
        source,
        mirror,
        timeout: section.timeout_secs.map(Duration::from_secs),
        discord: raw.discord,
        github: raw.github,
        discord_token: secret("DISCORD_TOKEN"),
        github_token: secret("GITHUB_TOKEN"),
    };
    info!(
        owner = %config.source.owner,
        repo = %config.source.repo,
        branch = %config.source.branch,
        discord_token_set = config.discord_token.is_some(),
        github_token_set = config.github_token.is_some(),
        "Configuration loaded"
    );
    Ok(config)
}
