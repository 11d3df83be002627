//! The boundary between the engagement core and whatever actually produces
//! and delivers a reply.

pub mod chat;
pub mod prompt;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::message::{ContextMessage, InboundMessage};

pub use chat::ChatResponder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPurpose {
    /// First reply after a reading window closed.
    Opening,
    /// Follow-up reply while engaged.
    Continuation,
    /// Unprompted message into a quiet channel.
    Revival,
    /// One-on-one conversation.
    Direct,
}

#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub purpose: RoundPurpose,
    /// Time-ordered, role-tagged history. Empty for revival and direct rounds,
    /// which read history from the channel themselves.
    pub history: Vec<ContextMessage>,
    pub participants: Vec<String>,
    pub initiator_id: Option<String>,
    pub reply_target: Option<String>,
    pub trigger: Option<InboundMessage>,
}

impl ChannelContext {
    pub fn revival(guild_id: &str, channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            guild_id: Some(guild_id.to_string()),
            purpose: RoundPurpose::Revival,
            history: Vec::new(),
            participants: Vec::new(),
            initiator_id: None,
            reply_target: None,
            trigger: None,
        }
    }

    pub fn direct(message: &InboundMessage) -> Self {
        Self {
            channel_id: message.channel_id.clone(),
            guild_id: None,
            purpose: RoundPurpose::Direct,
            history: Vec::new(),
            participants: vec![message.author_id.clone()],
            initiator_id: Some(message.author_id.clone()),
            reply_target: None,
            trigger: Some(message.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplyOutcome {
    /// Something was delivered to the channel.
    Sent { gif: bool },
    /// The model had nothing to say; nothing was delivered.
    Empty,
}

/// Produces and delivers one reply. `Err` means a collaborator failed, which
/// the caller handles differently from `Ok(ReplyOutcome::Empty)`.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, context: &ChannelContext) -> Result<ReplyOutcome>;
}
