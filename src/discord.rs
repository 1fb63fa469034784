#![doc = "Discord REST client: resolves channels and threads under the mirror category and posts chunks to them."]
//
//! # Discord integration (CLI <-> Core)
//!
//! [`DiscordClient`] implements both [`DestinationResolver`] and [`ChunkPoster`]
//! from the core crate against the Discord REST API, authenticating with a bot
//! token (`DISCORD_TOKEN`).
//!
//! - Channels live under one category of the guild (created on first use).
//! - Threads are public threads under their channel.
//! - Names are normalised the way Discord normalises text channel names, so a
//!   second run finds what the first one created.
//! - Two destination keys that normalise to the same name under the same
//!   parent (`C++` and `C#`, `Math` and `math`) are never merged: the first key
//!   to resolve owns the name and the other one fails to resolve.
//!
//! Any non-success status (including 429 rate limits) is returned as an error;
//! the core driver owns the retry policy.

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tokio::sync::OnceCell;
use tree_mirror_core::contract::{
    Ack, ChunkPoster, DestinationHandle, DestinationKind, DestinationRequest,
    DestinationResolver, ExistenceRecord,
};
use tree_mirror_core::error::CollaboratorError;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

const GUILD_TEXT: u8 = 0;
const GUILD_CATEGORY: u8 = 4;
const PUBLIC_THREAD: u8 = 11;
const MAX_NAME_LEN: usize = 100;

/// Lowercases `name` and collapses every run of characters outside
/// `[a-z0-9_-]` into a single `-`. Never returns an empty string.
pub fn normalize_name(name: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^a-z0-9_-]+").expect("static pattern"));

    let lowered = name.to_lowercase();
    let replaced = invalid.replace_all(&lowered, "-");
    let normalized: String = replaced
        .trim_matches('-')
        .chars()
        .take(MAX_NAME_LEN)
        .collect();
    if normalized.is_empty() {
        "untitled".to_string()
    } else {
        normalized
    }
}

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    parent_id: Option<String>,
}

impl Channel {
    fn matches(&self, kind: u8, name: &str, parent: Option<&str>) -> bool {
        self.kind == kind && self.name.as_deref() == Some(name) && self.parent_id.as_deref() == parent
    }
}

#[derive(Debug, Deserialize)]
struct ActiveThreads {
    threads: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
struct Message {
    id: String,
}

pub struct DiscordClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    guild_id: String,
    category_name: String,
    category_id: OnceCell<String>,
    /// Destination key owning each normalised name, per parent channel.
    claims: Mutex<HashMap<(Option<String>, String), String>>,
}

impl DiscordClient {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        guild_id: impl Into<String>,
        category_name: impl Into<String>,
    ) -> Self {
        let client = Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            guild_id: guild_id.into(),
            category_name: category_name.into(),
            category_id: OnceCell::new(),
            claims: Mutex::new(HashMap::new()),
        };
        tracing::info!(
            guild_id = %client.guild_id,
            category = %client.category_name,
            "Initialized DiscordClient"
        );
        client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CollaboratorError> {
        let response = request
            .header(AUTHORIZATION, format!("Bot {}", self.token))
            .header(USER_AGENT, "tree-mirror (https://github.com/tree-mirror/tree-mirror, 0.1)")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), %body, "Discord API returned an error status");
            return Err(format!("Discord API error {}: {}", status.as_u16(), body).into());
        }
        Ok(response.json::<T>().await?)
    }

    async fn guild_channels(&self) -> Result<Vec<Channel>, CollaboratorError> {
        let url = self.url(&format!("/guilds/{}/channels", self.guild_id));
        self.send(self.http.get(url)).await
    }

    async fn create_guild_channel(
        &self,
        name: &str,
        kind: u8,
        parent_id: Option<&str>,
    ) -> Result<Channel, CollaboratorError> {
        let url = self.url(&format!("/guilds/{}/channels", self.guild_id));
        let body = match parent_id {
            Some(parent) => json!({ "name": name, "type": kind, "parent_id": parent }),
            None => json!({ "name": name, "type": kind }),
        };
        self.send(self.http.post(url).json(&body)).await
    }

    /// Id of the mirror category. Looked up (or created) once per client.
    async fn category(&self) -> Result<&str, CollaboratorError> {
        let id = self
            .category_id
            .get_or_try_init(|| self.find_or_create_category())
            .await?;
        Ok(id.as_str())
    }

    async fn find_or_create_category(&self) -> Result<String, CollaboratorError> {
        let channels = self.guild_channels().await?;
        if let Some(existing) = channels
            .iter()
            .find(|c| c.matches(GUILD_CATEGORY, &self.category_name, None))
        {
            tracing::info!(category_id = %existing.id, "Found mirror category");
            return Ok(existing.id.clone());
        }
        let created = self
            .create_guild_channel(&self.category_name, GUILD_CATEGORY, None)
            .await?;
        tracing::info!(category_id = %created.id, "Created mirror category");
        Ok(created.id)
    }

    /// Reserves `name` under `parent` for `key`. Claiming again with the same
    /// key succeeds, so a retried resolve is not rejected.
    fn claim(&self, parent: Option<&str>, name: &str, key: &str) -> Result<(), CollaboratorError> {
        let mut claims = self
            .claims
            .lock()
            .map_err(|_| "Discord name registry lock poisoned")?;
        let owner = claims
            .entry((parent.map(str::to_string), name.to_string()))
            .or_insert_with(|| key.to_string());
        if owner.as_str() == key {
            return Ok(());
        }
        tracing::error!(key, owner = %owner, name, "Discord name already taken by another folder");
        Err(format!("{key:?} and {owner:?} both map to Discord name {name:?}; rename one of them").into())
    }

    async fn resolve_channel(&self, name: &str) -> Result<(bool, String), CollaboratorError> {
        let category = self.category().await?;
        let channels = self.guild_channels().await?;
        if let Some(existing) = channels
            .iter()
            .find(|c| c.matches(GUILD_TEXT, name, Some(category)))
        {
            return Ok((true, existing.id.clone()));
        }
        let created = self
            .create_guild_channel(name, GUILD_TEXT, Some(category))
            .await?;
        Ok((false, created.id))
    }

    async fn resolve_thread(&self, parent: &str, name: &str) -> Result<(bool, String), CollaboratorError> {
        let url = self.url(&format!("/guilds/{}/threads/active", self.guild_id));
        let active: ActiveThreads = self.send(self.http.get(url)).await?;
        if let Some(existing) = active
            .threads
            .iter()
            .find(|t| t.matches(PUBLIC_THREAD, name, Some(parent)))
        {
            return Ok((true, existing.id.clone()));
        }
        let url = self.url(&format!("/channels/{parent}/threads"));
        let created: Channel = self
            .send(
                self.http
                    .post(url)
                    .json(&json!({ "name": name, "type": PUBLIC_THREAD })),
            )
            .await?;
        Ok((false, created.id))
    }
}

#[async_trait]
impl DestinationResolver for DiscordClient {
    async fn resolve(
        &self,
        request: &DestinationRequest,
    ) -> Result<ExistenceRecord, CollaboratorError> {
        let name = normalize_name(&request.display_name);
        let (already_exists, id) = match (request.kind_hint, &request.parent) {
            (DestinationKind::Thread, Some(parent)) => {
                self.claim(Some(&parent.0), &name, &request.key)?;
                self.resolve_thread(&parent.0, &name).await?
            }
            (DestinationKind::Thread, None) => {
                return Err(format!("thread {:?} has no parent channel", request.key).into())
            }
            (DestinationKind::Channel, _) => {
                self.claim(None, &name, &request.key)?;
                self.resolve_channel(&name).await?
            }
        };
        tracing::info!(
            key = %request.key,
            %name,
            id = %id,
            already_exists,
            "Resolved Discord destination"
        );
        Ok(ExistenceRecord {
            key: request.key.clone(),
            already_exists,
            handle: DestinationHandle(id),
        })
    }
}

#[async_trait]
impl ChunkPoster for DiscordClient {
    async fn post_chunk(
        &self,
        handle: &DestinationHandle,
        text: &str,
    ) -> Result<Ack, CollaboratorError> {
        let url = self.url(&format!("/channels/{handle}/messages"));
        let body = json!({ "content": text, "allowed_mentions": { "parse": [] } });
        let message: Message = self.send(self.http.post(url).json(&body)).await?;
        tracing::debug!(channel = %handle, message_id = %message.id, "Posted chunk");
        Ok(Ack {
            message_id: Some(message.id),
        })
    }
}
