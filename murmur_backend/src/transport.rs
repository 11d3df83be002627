//! Chat-platform transport.
//!
//! The daemon never holds a platform socket itself. A bridge process owns the
//! platform session, pushes inbound events to `POST /v1/events/messages`, and
//! exposes a small JSON API for everything the responder needs to do in a
//! channel: typing indicators, sends, threaded replies and history fetches.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;
use crate::http_client::build_http_client_with_timeout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub channel_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub guild_name: Option<String>,
}

impl ChannelInfo {
    /// `#general in Some Server`, or just `#general` outside a guild.
    pub fn display_location(&self) -> String {
        match &self.guild_name {
            Some(guild) => format!("#{} in {}", self.name, guild),
            None => format!("#{}", self.name),
        }
    }
}

/// A message read back from channel history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedMessage {
    pub id: String,
    pub author_id: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub text: String,
    pub timestamp_ms: i64,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Platform user id of the automated participant.
    fn self_id(&self) -> &str;

    async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo>;

    async fn send_typing(&self, channel_id: &str) -> Result<()>;

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<()>;

    async fn reply_to(&self, channel_id: &str, message_id: &str, text: &str) -> Result<()>;

    /// Up to `limit` most recent messages, oldest first.
    async fn fetch_recent(&self, channel_id: &str, limit: usize) -> Result<Vec<FetchedMessage>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelfInfo {
    user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingMessage<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<&'a str>,
}

/// HTTP client for the platform bridge.
pub struct BridgeTransport {
    base_url: String,
    token: Option<String>,
    self_id: String,
    client: reqwest::Client,
}

impl BridgeTransport {
    /// Asks the bridge who we are; fails when the bridge is unreachable.
    pub async fn connect(config: &BridgeConfig) -> Result<Self> {
        let mut transport = Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.trim().is_empty()),
            self_id: String::new(),
            client: build_http_client_with_timeout(Some(std::time::Duration::from_secs(30))),
        };

        let me: SelfInfo = transport
            .authorized(transport.client.get(transport.url("/v1/self")))
            .send()
            .await
            .context("Failed to reach chat bridge")?
            .error_for_status()
            .context("Chat bridge rejected self lookup")?
            .json()
            .await
            .context("Failed to parse bridge self info")?;

        tracing::info!("Connected to chat bridge at {} as {}", transport.base_url, me.user_id);
        transport.self_id = me.user_id;
        Ok(transport)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_message(&self, channel_id: &str, body: &OutgoingMessage<'_>) -> Result<()> {
        let response = self
            .authorized(
                self.client
                    .post(self.url(&format!("/v1/channels/{}/messages", channel_id)))
                    .json(body),
            )
            .send()
            .await
            .context("Failed to send message through bridge")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Bridge returned error {}: {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for BridgeTransport {
    fn self_id(&self) -> &str {
        &self.self_id
    }

    async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        self.authorized(
            self.client
                .get(self.url(&format!("/v1/channels/{}", channel_id))),
        )
        .send()
        .await
        .context("Failed to fetch channel info")?
        .error_for_status()?
        .json()
        .await
        .context("Failed to parse channel info")
    }

    async fn send_typing(&self, channel_id: &str) -> Result<()> {
        self.authorized(
            self.client
                .post(self.url(&format!("/v1/channels/{}/typing", channel_id))),
        )
        .send()
        .await
        .context("Failed to send typing indicator")?
        .error_for_status()?;
        Ok(())
    }

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
        self.post_message(
            channel_id,
            &OutgoingMessage {
                text,
                reply_to_message_id: None,
            },
        )
        .await
    }

    async fn reply_to(&self, channel_id: &str, message_id: &str, text: &str) -> Result<()> {
        self.post_message(
            channel_id,
            &OutgoingMessage {
                text,
                reply_to_message_id: Some(message_id),
            },
        )
        .await
    }

    async fn fetch_recent(&self, channel_id: &str, limit: usize) -> Result<Vec<FetchedMessage>> {
        let mut messages: Vec<FetchedMessage> = self
            .authorized(
                self.client
                    .get(self.url(&format!("/v1/channels/{}/messages", channel_id)))
                    .query(&[("limit", limit)]),
            )
            .send()
            .await
            .context("Failed to fetch channel history")?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse channel history")?;

        messages.sort_by_key(|m| m.timestamp_ms);
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }
}
