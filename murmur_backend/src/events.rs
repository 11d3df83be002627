use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisengageReason {
    IdleTimeout,
    ReplyCap,
    EmptyReply,
    ResponderFailed,
    NoContext,
    Operator,
}

/// Lifecycle notifications published by the engagement core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EngagementEvent {
    ConversationStarted {
        channel_id: String,
        initiator_id: String,
        reading_window_ms: u64,
    },
    ReplySent {
        channel_id: String,
        reply_count: u32,
        gif: bool,
    },
    Disengaged {
        channel_id: String,
        reason: DisengageReason,
    },
    ChannelRevived {
        guild_id: String,
        channel_id: String,
    },
    DirectReply {
        channel_id: String,
        author_id: String,
    },
    Error {
        channel_id: Option<String>,
        message: String,
    },
}

impl EngagementEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngagementEvent::ConversationStarted { .. } => "conversation_started",
            EngagementEvent::ReplySent { .. } => "reply_sent",
            EngagementEvent::Disengaged { .. } => "disengaged",
            EngagementEvent::ChannelRevived { .. } => "channel_revived",
            EngagementEvent::DirectReply { .. } => "direct_reply",
            EngagementEvent::Error { .. } => "error",
        }
    }
}
