use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use murmur_backend::conversation::ConversationSnapshot;
use murmur_backend::message::InboundMessage;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8797";

#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub self_id: String,
    pub active_conversations: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: Value,
}

impl EventEnvelope {
    /// `12:00:01 reply_sent channel_id=c1 reply_count=2`
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} {}",
            self.emitted_at.format("%H:%M:%S"),
            self.event_type
        );
        if let Some(fields) = self.payload.as_object() {
            for (key, value) in fields {
                line.push_str(&format!(" {}={}", key, json_value_to_short_string(value)));
            }
        }
        line
    }
}

#[derive(Debug, Deserialize)]
struct RouteResponse {
    outcome: String,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("MURMUR_BACKEND_URL")
            .unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
        let token = std::env::var("MURMUR_BACKEND_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        let normalized_base = normalize_base_url(&base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        Self {
            http: reqwest::Client::new(),
            base_url: normalized_base,
            ws_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        self.request(reqwest::Method::GET, "/v1/health")
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/health failed")?
            .json::<HealthStatus>()
            .await
            .context("Failed to decode health response")
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSnapshot>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/conversations")
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/conversations failed")?;

        let body = response
            .text()
            .await
            .context("Failed to read conversation list payload")?;
        serde_json::from_str::<Vec<ConversationSnapshot>>(&body).context(format!(
            "Failed to decode conversation list. Payload preview: {}",
            body.chars().take(500).collect::<String>()
        ))
    }

    /// `None` when the channel has no active conversation.
    pub async fn get_conversation(&self, channel_id: &str) -> Result<Option<ConversationSnapshot>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/conversations/{}", channel_id),
            )
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let snapshot = response
            .error_for_status()
            .context("GET /v1/conversations/:channel_id failed")?
            .json::<ConversationSnapshot>()
            .await
            .context("Failed to decode conversation")?;
        Ok(Some(snapshot))
    }

    /// False when there was nothing to disengage.
    pub async fn disengage(&self, channel_id: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/v1/conversations/{}/disengage", channel_id),
            )
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response
            .error_for_status()
            .context("POST /v1/conversations/:channel_id/disengage failed")?;
        Ok(true)
    }

    /// Pushes a synthetic inbound event; returns how the daemon routed it.
    pub async fn inject(&self, message: &InboundMessage) -> Result<String> {
        let response = self
            .request(reqwest::Method::POST, "/v1/events/messages")
            .json(message)
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/events/messages failed")?
            .json::<RouteResponse>()
            .await
            .context("Failed to decode routing response")?;
        Ok(response.outcome)
    }

    pub async fn watch_events_forever<F>(&self, mut on_event: F)
    where
        F: FnMut(EventEnvelope),
    {
        loop {
            match self.watch_events_once(&mut on_event).await {
                Ok(()) => {
                    tracing::info!("Event stream disconnected; reconnecting in 2s");
                }
                Err(error) => {
                    tracing::warn!("Event stream failed: {:#}; reconnecting in 2s", error);
                }
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn watch_events_once<F>(&self, on_event: &mut F) -> Result<()>
    where
        F: FnMut(EventEnvelope),
    {
        let ws_endpoint = format!("{}/v1/ws/events", self.ws_url);
        let mut request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to connect websocket event stream")?;
        let (_write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            match message.context("Websocket read error")? {
                Message::Text(text) => on_event(parse_event_envelope(&text)?),
                Message::Binary(bytes) => {
                    if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                        on_event(parse_event_envelope(&text)?);
                    }
                }
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

fn parse_event_envelope(text: &str) -> Result<EventEnvelope> {
    serde_json::from_str(text).context("Failed to decode API event envelope")
}

fn json_value_to_short_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_BACKEND_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("http://x:1/"), "http://x:1");
        assert_eq!(normalize_base_url(""), DEFAULT_BACKEND_URL);
    }

    #[test]
    fn maps_http_to_ws_url() {
        assert_eq!(
            normalize_ws_url("http://127.0.0.1:8797"),
            "ws://127.0.0.1:8797"
        );
        assert_eq!(normalize_ws_url("https://example.com"), "wss://example.com");
    }

    #[test]
    fn api_client_trims_trailing_slash() {
        let client = ApiClient::new("http://127.0.0.1:8797/".to_string(), None);
        assert_eq!(client.base_url(), "http://127.0.0.1:8797");
    }

    #[test]
    fn event_envelope_renders_a_summary_line() {
        let envelope = parse_event_envelope(
            r#"{"event_type":"disengaged","emitted_at":"2026-02-18T06:17:38Z","payload":{"channel_id":"c1","reason":"idle_timeout"}}"#,
        )
        .unwrap();
        assert_eq!(
            envelope.summary_line(),
            "06:17:38 disengaged channel_id=c1 reason=idle_timeout"
        );
    }

    #[test]
    fn conversation_snapshot_decodes_from_daemon_json() {
        let payload = serde_json::json!([{
            "channel_id": "c1",
            "guild_id": "g1",
            "state": "engaged",
            "trigger_message": {
                "id": "m1", "author_id": "alice", "author_name": "Alice", "text": "hi",
                "timestamp_ms": 0, "mentions": ["bot"], "reply_to": null
            },
            "initiator_id": "alice",
            "participants": [{"user_id": "alice", "display_name": "Alice", "message_ids": ["m1"]}],
            "message_buffer": [],
            "extensions_used": 0,
            "max_extensions": 3,
            "reading_window_ms": 3000,
            "reading_deadline_ms": 3000,
            "reply_count": 1,
            "started_at_ms": 0,
            "last_response_at_ms": 3500,
            "responding": false,
            "has_idle_timer": true,
            "has_monitor": true
        }]);
        let decoded: Vec<ConversationSnapshot> = serde_json::from_value(payload).unwrap();
        assert_eq!(decoded[0].reply_count, 1);
        assert_eq!(decoded[0].participants[0].display_name, "Alice");
    }
}
