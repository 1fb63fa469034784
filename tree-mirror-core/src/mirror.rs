//! High-level pipeline: orchestrates fetch → build → partition → render → split → post.
//!
//! This module provides the top-level orchestration for mirroring a repository
//! tree into chat destinations. It:
//!   - Fetches the tree listing through a [`TreeFetcher`] (fatal on failure)
//!   - Builds and partitions the tree (fatal on a structural error)
//!   - Renders and splits every destination up front, before any side effect
//!   - Resolves channels, then their threads, through a [`DestinationResolver`]
//!   - Posts each destination's chunks, in order, through a [`ChunkPoster`]
//!   - Returns a [`MirrorReport`] of what succeeded, what failed and why
//!
//! # Concurrency
//! Channel groups (a channel and its threads) run concurrently. Every resolve
//! and post call holds a permit of one shared semaphore, so at most
//! `max_concurrent_calls` calls are outstanding; the rest wait. Chunks of one
//! destination are posted strictly one after the other.
//!
//! # Failure isolation
//! Resolve/post failures are retried with bounded backoff, then recorded on
//! the destination. They never abort sibling destinations.
//!
//! # Cancellation
//! Once the [`CancellationToken`] fires, a post already in flight completes
//! but no further chunk is submitted and no failed call is retried, even one
//! waiting out its backoff or a permit; affected destinations are reported as
//! cancelled.

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::num::NonZeroUsize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MirrorConfig, RetryPolicy};
use crate::contract::{
    ChunkPoster, DestinationHandle, DestinationKind, DestinationRequest, DestinationResolver,
    ExistenceRecord, PathEntry, TreeFetcher, TreeSource,
};
use crate::error::{CollaboratorError, MirrorError, Warning};
use crate::partition::{partition, ChannelRef, Destination, Placement};
use crate::render::render;
use crate::split::{split, Chunk};
use crate::tree::build;

/// How a destination ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationOutcome {
    /// Resolved and every chunk posted.
    Complete,
    /// Resolved, but at least one chunk failed to post.
    Partial,
    /// The channel or thread could not be looked up or created.
    ResolveFailed,
    /// The run was cancelled before every chunk was submitted.
    Cancelled,
}

/// Per-destination line of the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationReport {
    pub key: String,
    pub display_name: String,
    pub kind: DestinationKind,
    /// `Some(true)` when the resolver had to create the destination.
    pub created: Option<bool>,
    pub total_chunks: usize,
    pub posted_chunks: usize,
    pub failed_chunks: Vec<usize>,
    pub outcome: DestinationOutcome,
    pub error: Option<String>,
}

impl DestinationReport {
    fn label(&self) -> &str {
        if self.key.is_empty() {
            &self.display_name
        } else {
            &self.key
        }
    }
}

/// Output of a mirror run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorReport {
    pub destinations: Vec<DestinationReport>,
    pub warnings: Vec<Warning>,
}

impl MirrorReport {
    fn with_outcome(&self, outcome: DestinationOutcome) -> impl Iterator<Item = &DestinationReport> {
        self.destinations
            .iter()
            .filter(move |d| d.outcome == outcome)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &DestinationReport> {
        self.with_outcome(DestinationOutcome::Complete)
    }

    pub fn partially_failed(&self) -> impl Iterator<Item = &DestinationReport> {
        self.with_outcome(DestinationOutcome::Partial)
    }

    pub fn resolve_failed(&self) -> impl Iterator<Item = &DestinationReport> {
        self.with_outcome(DestinationOutcome::ResolveFailed)
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &DestinationReport> {
        self.with_outcome(DestinationOutcome::Cancelled)
    }

    pub fn has_failures(&self) -> bool {
        self.destinations
            .iter()
            .any(|d| d.outcome != DestinationOutcome::Complete)
    }

    pub fn destination(&self, key: &str) -> Option<&DestinationReport> {
        self.destinations.iter().find(|d| d.key == key)
    }
}

impl std::fmt::Display for MirrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Mirror summary: {} destinations, {} complete, {} partial, {} failed, {} cancelled",
            self.destinations.len(),
            self.succeeded().count(),
            self.partially_failed().count(),
            self.resolve_failed().count(),
            self.cancelled().count(),
        )?;
        for d in &self.destinations {
            match d.outcome {
                DestinationOutcome::Complete => {
                    writeln!(f, "  ok        {} ({} chunks)", d.label(), d.posted_chunks)?
                }
                DestinationOutcome::Partial => writeln!(
                    f,
                    "  partial   {}: failed chunks {:?} of {}",
                    d.label(),
                    d.failed_chunks,
                    d.total_chunks
                )?,
                DestinationOutcome::ResolveFailed => writeln!(
                    f,
                    "  failed    {}: {}",
                    d.label(),
                    d.error.as_deref().unwrap_or("resolve failed")
                )?,
                DestinationOutcome::Cancelled => writeln!(
                    f,
                    "  cancelled {}: {}/{} chunks posted",
                    d.label(),
                    d.posted_chunks,
                    d.total_chunks
                )?,
            }
        }
        if !self.warnings.is_empty() {
            writeln!(f, "Warnings:")?;
            for warning in &self.warnings {
                writeln!(f, "  {warning}")?;
            }
        }
        Ok(())
    }
}

/// Fetches the tree for `source`, then mirrors it. A fetch failure aborts the run.
pub async fn run_mirror<F, R, P>(
    source: &TreeSource,
    config: &MirrorConfig,
    fetcher: &F,
    resolver: &R,
    poster: &P,
    cancel: &CancellationToken,
) -> Result<MirrorReport, MirrorError>
where
    F: TreeFetcher + ?Sized,
    R: DestinationResolver + ?Sized,
    P: ChunkPoster + ?Sized,
{
    info!(owner = %source.owner, repo = %source.repo, branch = %source.branch, "[MIRROR] Fetching tree");
    let entries = match fetcher.fetch_tree(source).await {
        Ok(entries) => {
            info!(entries = entries.len(), "[MIRROR] Tree fetched");
            entries
        }
        Err(e) => {
            error!(error = %e, "[MIRROR][ERROR] Tree fetch failed, aborting run");
            return Err(e.into());
        }
    };
    mirror_entries(&entries, config, resolver, poster, cancel).await
}

/// Mirrors an already fetched listing.
///
/// Structural and configuration errors are returned before any collaborator
/// is called.
pub async fn mirror_entries<R, P>(
    entries: &[PathEntry],
    config: &MirrorConfig,
    resolver: &R,
    poster: &P,
    cancel: &CancellationToken,
) -> Result<MirrorReport, MirrorError>
where
    R: DestinationResolver + ?Sized,
    P: ChunkPoster + ?Sized,
{
    config.validate()?;
    let limit = config.chunk_limit()?;

    let built = build(entries, &config.root);
    let destinations = partition(&built.root, config.depth)?;

    let mut warnings = built.warnings;
    let prepared: Vec<Prepared> = destinations
        .iter()
        .map(|d| prepare(d, &config.link_base, limit, &mut warnings))
        .collect();
    let groups = group_by_channel(prepared);
    info!(
        groups = groups.len(),
        destinations = destinations.len(),
        "[MIRROR] Starting destination processing"
    );

    let driver = Driver {
        resolver,
        poster,
        gate: Semaphore::new(config.max_concurrent_calls),
        retry: config.retry,
        cancel,
    };
    let mut reports: Vec<DestinationReport> = join_all(groups.into_iter().map(|g| driver.drive_group(g)))
        .await
        .into_iter()
        .flatten()
        .collect();
    reports.sort_by(|a, b| a.key.cmp(&b.key));

    let report = MirrorReport {
        destinations: reports,
        warnings,
    };
    info!(
        complete = report.succeeded().count(),
        partial = report.partially_failed().count(),
        failed = report.resolve_failed().count(),
        cancelled = report.cancelled().count(),
        warnings = report.warnings.len(),
        "[MIRROR] Run finished"
    );
    match serde_json::to_string(&report) {
        Ok(json) => debug!(json = %json, "[MIRROR][DEBUG] Report as JSON"),
        Err(e) => error!(error = ?e, "[MIRROR][DEBUG] Failed to serialize report as JSON"),
    }
    Ok(report)
}

/// A destination rendered and split, ready to post.
#[derive(Debug, Clone)]
struct Prepared {
    key: String,
    display_name: String,
    kind: DestinationKind,
    channel: ChannelRef,
    chunks: Vec<Chunk>,
}

fn prepare(
    destination: &Destination<'_>,
    link_base: &str,
    limit: NonZeroUsize,
    warnings: &mut Vec<Warning>,
) -> Prepared {
    let rendered = render(destination, link_base);
    let split = split(&rendered, limit);
    for line in &split.oversized {
        warn!(
            destination = destination.label(),
            line_index = line.line_index,
            length = line.length,
            max_size = limit.get(),
            "Rendered line exceeds chunk limit, sending it unsplit"
        );
        warnings.push(Warning::OversizedLine {
            destination: destination.label().to_string(),
            line_index: line.line_index,
            length: line.length,
            max_size: limit.get(),
        });
    }
    debug!(
        destination = destination.label(),
        bytes = rendered.len(),
        chunks = split.chunks.len(),
        "Rendered destination"
    );
    Prepared {
        key: destination.key.clone(),
        display_name: destination.display_name.clone(),
        kind: destination.kind(),
        channel: match &destination.placement {
            Placement::Channel => ChannelRef {
                key: destination.key.clone(),
                display_name: destination.display_name.clone(),
            },
            Placement::Thread { channel } => channel.clone(),
        },
        chunks: split.into_chunks(&destination.key),
    }
}

/// A channel and everything posted under it.
#[derive(Debug)]
struct ChannelGroup {
    channel: ChannelRef,
    own: Option<Prepared>,
    threads: Vec<Prepared>,
}

fn group_by_channel(prepared: Vec<Prepared>) -> Vec<ChannelGroup> {
    let mut groups: BTreeMap<String, ChannelGroup> = BTreeMap::new();
    for destination in prepared {
        let group = groups
            .entry(destination.channel.key.clone())
            .or_insert_with(|| ChannelGroup {
                channel: destination.channel.clone(),
                own: None,
                threads: Vec::new(),
            });
        match destination.kind {
            DestinationKind::Channel => group.own = Some(destination),
            DestinationKind::Thread => group.threads.push(destination),
        }
    }
    groups.into_values().collect()
}

struct Driver<'a, R: ?Sized, P: ?Sized> {
    resolver: &'a R,
    poster: &'a P,
    gate: Semaphore,
    retry: RetryPolicy,
    cancel: &'a CancellationToken,
}

impl<R, P> Driver<'_, R, P>
where
    R: DestinationResolver + ?Sized,
    P: ChunkPoster + ?Sized,
{
    async fn drive_group(&self, group: ChannelGroup) -> Vec<DestinationReport> {
        let members: Vec<Prepared> = group.own.into_iter().chain(group.threads).collect();

        if self.cancel.is_cancelled() {
            info!(channel = %group.channel.key, "[MIRROR] Cancelled before channel was resolved");
            return members.iter().map(cancelled_before_start).collect();
        }

        let request = DestinationRequest {
            key: group.channel.key.clone(),
            display_name: group.channel.display_name.clone(),
            kind_hint: DestinationKind::Channel,
            parent: None,
        };
        let channel = match self
            .with_retry("resolve", &request.key, || self.resolver.resolve(&request))
            .await
        {
            Ok(record) => {
                info!(
                    channel = %request.key,
                    handle = %record.handle,
                    already_exists = record.already_exists,
                    "[MIRROR] Channel resolved"
                );
                record
            }
            Err(CallError::Cancelled { .. }) => {
                info!(channel = %request.key, "[MIRROR] Cancelled while resolving channel");
                return members.iter().map(cancelled_before_start).collect();
            }
            Err(CallError::Failed(e)) => {
                error!(channel = %request.key, error = %e, "[MIRROR][ERROR] Channel resolve failed");
                return members
                    .iter()
                    .map(|d| resolve_failed(d, &format!("channel {:?}: {e}", request.display_name)))
                    .collect();
            }
        };

        join_all(members.into_iter().map(|d| self.drive_destination(d, &channel))).await
    }

    async fn drive_destination(&self, destination: Prepared, channel: &ExistenceRecord) -> DestinationReport {
        let record = match destination.kind {
            DestinationKind::Channel => channel.clone(),
            DestinationKind::Thread => {
                if self.cancel.is_cancelled() {
                    return cancelled_before_start(&destination);
                }
                let request = DestinationRequest {
                    key: destination.key.clone(),
                    display_name: destination.display_name.clone(),
                    kind_hint: DestinationKind::Thread,
                    parent: Some(channel.handle.clone()),
                };
                match self
                    .with_retry("resolve", &request.key, || self.resolver.resolve(&request))
                    .await
                {
                    Ok(record) => {
                        info!(
                            thread = %request.key,
                            handle = %record.handle,
                            already_exists = record.already_exists,
                            "[MIRROR] Thread resolved"
                        );
                        record
                    }
                    Err(CallError::Cancelled { .. }) => {
                        info!(thread = %request.key, "[MIRROR] Cancelled while resolving thread");
                        return cancelled_before_start(&destination);
                    }
                    Err(CallError::Failed(e)) => {
                        error!(thread = %request.key, error = %e, "[MIRROR][ERROR] Thread resolve failed");
                        return resolve_failed(&destination, &e.to_string());
                    }
                }
            }
        };
        self.post_chunks(destination, record).await
    }

    async fn post_chunks(&self, destination: Prepared, record: ExistenceRecord) -> DestinationReport {
        let total = destination.chunks.len();
        let mut posted = 0usize;
        let mut failed = Vec::new();
        let mut cancelled = false;

        for chunk in &destination.chunks {
            if self.cancel.is_cancelled() {
                warn!(
                    destination = %destination.key,
                    posted,
                    remaining = total - chunk.sequence_index,
                    "[MIRROR] Run cancelled, remaining chunks not submitted"
                );
                cancelled = true;
                break;
            }
            let handle: &DestinationHandle = &record.handle;
            match self
                .with_retry("post", &destination.key, || {
                    self.poster.post_chunk(handle, &chunk.text)
                })
                .await
            {
                Ok(ack) => {
                    posted += 1;
                    debug!(
                        destination = %destination.key,
                        sequence_index = chunk.sequence_index,
                        message_id = ?ack.message_id,
                        "[MIRROR][POST] Chunk posted"
                    );
                }
                Err(CallError::Cancelled { last_error }) => {
                    if let Some(e) = last_error {
                        error!(
                            destination = %destination.key,
                            sequence_index = chunk.sequence_index,
                            error = %e,
                            "[MIRROR][ERROR][POST] Chunk post failed, run cancelled before retry"
                        );
                        failed.push(chunk.sequence_index);
                    }
                    warn!(
                        destination = %destination.key,
                        posted,
                        remaining = total - chunk.sequence_index,
                        "[MIRROR] Run cancelled, remaining chunks not submitted"
                    );
                    cancelled = true;
                    break;
                }
                Err(CallError::Failed(e)) => {
                    error!(
                        destination = %destination.key,
                        sequence_index = chunk.sequence_index,
                        error = %e,
                        "[MIRROR][ERROR][POST] Chunk post failed"
                    );
                    failed.push(chunk.sequence_index);
                }
            }
        }

        let outcome = if cancelled {
            DestinationOutcome::Cancelled
        } else if failed.is_empty() {
            DestinationOutcome::Complete
        } else {
            DestinationOutcome::Partial
        };
        info!(destination = %destination.key, posted, total, ?outcome, "[MIRROR] Destination done");
        DestinationReport {
            key: destination.key,
            display_name: destination.display_name,
            kind: destination.kind,
            created: Some(!record.already_exists),
            total_chunks: total,
            posted_chunks: posted,
            failed_chunks: failed,
            outcome,
            error: None,
        }
    }

    /// Runs `call` under a semaphore permit, retrying with exponential backoff.
    /// The permit is released while sleeping between attempts. Once the run is
    /// cancelled no new attempt starts, whether waiting for a permit or backing off.
    async fn with_retry<T, C, Fut>(&self, operation: &str, key: &str, mut call: C) -> Result<T, CallError>
    where
        C: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let mut attempt = 1u32;
        let mut last_error = None;
        loop {
            let result = {
                let _permit = tokio::select! {
                    permit = self.gate.acquire() => permit.map_err(|e| CallError::Failed(Box::new(e)))?,
                    _ = self.cancel.cancelled() => return Err(CallError::Cancelled { last_error }),
                };
                if self.cancel.is_cancelled() {
                    return Err(CallError::Cancelled { last_error });
                }
                call().await
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if self.cancel.is_cancelled() => {
                    return Err(CallError::Cancelled { last_error: Some(e) })
                }
                Err(e) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        operation,
                        key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "[MIRROR] Call failed, retrying"
                    );
                    last_error = Some(e);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(CallError::Cancelled { last_error });
                        }
                    }
                    attempt += 1;
                }
                Err(e) => return Err(CallError::Failed(e)),
            }
        }
    }
}

/// Why [`Driver::with_retry`] gave up.
#[derive(Debug)]
enum CallError {
    /// Every attempt failed; carries the last error.
    Failed(CollaboratorError),
    /// The run was cancelled. `last_error` is set when an attempt had already failed.
    Cancelled { last_error: Option<CollaboratorError> },
}

fn cancelled_before_start(destination: &Prepared) -> DestinationReport {
    DestinationReport {
        key: destination.key.clone(),
        display_name: destination.display_name.clone(),
        kind: destination.kind,
        created: None,
        total_chunks: destination.chunks.len(),
        posted_chunks: 0,
        failed_chunks: Vec::new(),
        outcome: DestinationOutcome::Cancelled,
        error: None,
    }
}

fn resolve_failed(destination: &Prepared, error: &str) -> DestinationReport {
    DestinationReport {
        key: destination.key.clone(),
        display_name: destination.display_name.clone(),
        kind: destination.kind,
        created: None,
        total_chunks: destination.chunks.len(),
        posted_chunks: 0,
        failed_chunks: Vec::new(),
        outcome: DestinationOutcome::ResolveFailed,
        error: Some(error.to_string()),
    }
}
