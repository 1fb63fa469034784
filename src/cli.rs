///
/// This module implements the CLI interface for tree-mirror: command parsing, collaborator
/// wiring and the async entrypoint used by `main` and the integration tests.
///
/// All mirroring logic (tree building, partitioning, rendering, chunking, the driver) lives in
/// the [`tree-mirror-core`] crate. This module is strictly CLI glue.
///
/// ## How To Use
/// - Command-line users: `tree-mirror sync --config mirror.yaml [--dry-run]`.
/// - Programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// [`tree-mirror-core`]: ../../tree-mirror-core/
use crate::discord::DiscordClient;
use crate::dryrun::DryRun;
use crate::github::GitHubClient;
use crate::load_config::load_config;
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tree_mirror_core::mirror::run_mirror;

/// CLI for tree-mirror: mirror a GitHub file tree into Discord channels and threads.
#[derive(Parser)]
#[clap(
    name = "tree-mirror",
    version,
    about = "Mirror a GitHub repository's file tree into Discord channels and threads"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch the tree and post its listing to the configured Discord guild
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Print the chunks to stdout instead of posting them
        #[clap(long)]
        dry_run: bool,
    },
}

/// Cancels `cancel` on Ctrl-C or when `timeout` elapses, whichever comes first.
/// Stops watching once `done` is cancelled.
fn spawn_cancel_triggers(cancel: CancellationToken, done: CancellationToken, timeout: Option<Duration>) {
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = done.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupt received, cancelling remaining work");
                cancel.cancel();
            }
            _ = deadline => {
                tracing::warn!(?timeout, "Run timed out, cancelling remaining work");
                cancel.cancel();
            }
        }
    });
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync { config, dry_run } => {
            let config = load_config(config)?;
            tracing::info!(command = "sync", dry_run, "Starting mirror run");

            let fetcher = GitHubClient::new(&config.github.api_base, config.github_token.clone());
            let cancel = CancellationToken::new();
            let done = CancellationToken::new();
            spawn_cancel_triggers(cancel.clone(), done.clone(), config.timeout);
            let _stop_triggers = done.drop_guard();

            let result = if dry_run {
                let dry = DryRun::stdout();
                run_mirror(&config.source, &config.mirror, &fetcher, &dry, &dry, &cancel).await
            } else {
                let token = config
                    .discord_token
                    .as_deref()
                    .ok_or_else(|| anyhow!("DISCORD_TOKEN must be set to post to Discord (or pass --dry-run)"))?;
                let discord = DiscordClient::new(
                    &config.discord.api_base,
                    token,
                    config.discord.guild_id.to_string(),
                    &config.discord.category,
                );
                run_mirror(&config.source, &config.mirror, &fetcher, &discord, &discord, &cancel).await
            };

            match result {
                Ok(report) => {
                    println!("{report}");
                    if report.has_failures() {
                        tracing::warn!(command = "sync", "Mirror finished with failed destinations or chunks");
                    } else {
                        tracing::info!(command = "sync", "Mirror complete");
                    }
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(command = "sync", error = %e, "Mirror run failed");
                    Err(anyhow::Error::new(e).context("Mirror run failed"))
                }
            }
        }
    }
}
