use serde::{Deserialize, Serialize};

/// Inbound chat event as delivered by the platform bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(default)]
    pub text: String,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub mentioned_user_ids: Vec<String>,
    #[serde(default)]
    pub replied_to_message_id: Option<String>,
    pub channel_id: String,
    #[serde(default)]
    pub is_direct_message: bool,
    #[serde(default)]
    pub guild_id: Option<String>,
}

impl InboundMessage {
    pub fn mentions(&self, user_id: &str) -> bool {
        self.mentioned_user_ids.iter().any(|id| id == user_id)
    }
}

/// The part of an inbound message a conversation record keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub text: String,
    pub timestamp_ms: i64,
    pub mentions: Vec<String>,
    pub reply_to: Option<String>,
}

impl MessageSnapshot {
    pub fn mentions(&self, user_id: &str) -> bool {
        self.mentions.iter().any(|id| id == user_id)
    }
}

impl From<&InboundMessage> for MessageSnapshot {
    fn from(msg: &InboundMessage) -> Self {
        Self {
            id: msg.id.clone(),
            author_id: msg.author_id.clone(),
            author_name: msg.author_name.clone(),
            text: msg.text.clone(),
            timestamp_ms: msg.timestamp_ms,
            mentions: msg.mentioned_user_ids.clone(),
            reply_to: msg.replied_to_message_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// A role-tagged history line handed to the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: ChatRole,
    pub content: String,
    pub author_id: String,
    pub author_name: String,
    pub message_id: String,
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_event_accepts_bridge_json_shape() {
        let raw = r#"{
            "id": "m1",
            "authorId": "u1",
            "authorName": "alice",
            "text": "hey <@bot>",
            "timestampMs": 1700000000000,
            "mentionedUserIds": ["bot"],
            "repliedToMessageId": null,
            "channelId": "c1",
            "isDirectMessage": false,
            "guildId": "g1"
        }"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.mentions("bot"));
        assert_eq!(msg.guild_id.as_deref(), Some("g1"));

        let snapshot = MessageSnapshot::from(&msg);
        assert_eq!(snapshot.id, "m1");
        assert_eq!(snapshot.reply_to, None);
        assert!(snapshot.mentions("bot"));
    }

    #[test]
    fn optional_fields_default_when_missing() {
        let raw = r#"{
            "id": "m2",
            "authorId": "u2",
            "authorName": "bob",
            "timestampMs": 5,
            "channelId": "dm-1"
        }"#;
        let msg: InboundMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.text.is_empty());
        assert!(msg.mentioned_user_ids.is_empty());
        assert!(!msg.is_direct_message);
        assert!(msg.guild_id.is_none());
    }
}
