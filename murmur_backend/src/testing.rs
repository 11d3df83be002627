//! In-memory collaborators shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::llm_client::{ChatModel, Message};
use crate::message::InboundMessage;
use crate::responder::{ChannelContext, ReplyOutcome, Responder};
use crate::transport::{ChannelInfo, ChatTransport, FetchedMessage};

pub const SELF_ID: &str = "bot";

pub fn inbound(id: &str, author: &str, channel: &str, ts: i64) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        author_id: author.to_string(),
        author_name: author.to_string(),
        text: format!("message {id}"),
        timestamp_ms: ts,
        mentioned_user_ids: Vec::new(),
        replied_to_message_id: None,
        channel_id: channel.to_string(),
        is_direct_message: false,
        guild_id: Some("g1".to_string()),
    }
}

pub fn mention(id: &str, author: &str, channel: &str, ts: i64) -> InboundMessage {
    let mut msg = inbound(id, author, channel, ts);
    msg.mentioned_user_ids.push(SELF_ID.to_string());
    msg
}

pub fn direct(id: &str, author: &str, ts: i64) -> InboundMessage {
    let mut msg = inbound(id, author, &format!("dm-{author}"), ts);
    msg.is_direct_message = true;
    msg.guild_id = None;
    msg
}

/// Model that replays canned replies in order; the last one repeats.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    pub calls: Mutex<Vec<(String, Vec<Message>)>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<&str, &str>>) -> Self {
        Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, system: &str, messages: &[Message]) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((system.to_string(), messages.to_vec()));
        let mut replies = self.replies.lock().unwrap();
        let next = if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        };
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(String::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Typing(String),
    Message { channel_id: String, text: String },
    Reply { channel_id: String, message_id: String, text: String },
}

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<Sent>>,
    pub history: Mutex<HashMap<String, Vec<FetchedMessage>>>,
    pub fail_replies: bool,
    pub fail_sends: bool,
}

impl RecordingTransport {
    pub fn deliveries(&self) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !matches!(s, Sent::Typing(_)))
            .cloned()
            .collect()
    }

    pub fn set_history(&self, channel_id: &str, messages: Vec<FetchedMessage>) {
        self.history
            .lock()
            .unwrap()
            .insert(channel_id.to_string(), messages);
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    fn self_id(&self) -> &str {
        SELF_ID
    }

    async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        Ok(ChannelInfo {
            channel_id: channel_id.to_string(),
            name: format!("name-{channel_id}"),
            topic: None,
            guild_id: Some("g1".to_string()),
            guild_name: Some("Hangout".to_string()),
        })
    }

    async fn send_typing(&self, channel_id: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push(Sent::Typing(channel_id.to_string()));
        Ok(())
    }

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
        if self.fail_sends {
            anyhow::bail!("send refused");
        }
        self.sent.lock().unwrap().push(Sent::Message {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn reply_to(&self, channel_id: &str, message_id: &str, text: &str) -> Result<()> {
        if self.fail_replies {
            anyhow::bail!("reply target gone");
        }
        self.sent.lock().unwrap().push(Sent::Reply {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn fetch_recent(&self, channel_id: &str, limit: usize) -> Result<Vec<FetchedMessage>> {
        let history = self.history.lock().unwrap();
        let messages = history.get(channel_id).cloned().unwrap_or_default();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }
}

/// Responder that records every context it is handed and answers from a script.
pub struct ScriptedResponder {
    outcomes: Mutex<VecDeque<Result<ReplyOutcome, String>>>,
    pub contexts: Mutex<Vec<ChannelContext>>,
    delay: Mutex<Duration>,
}

impl ScriptedResponder {
    pub fn new(outcomes: Vec<Result<ReplyOutcome, &str>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().map(|o| o.map_err(str::to_string)).collect()),
            contexts: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn call_count(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    /// Every later reply takes this long to come back.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Responder for ScriptedResponder {
    async fn respond(&self, context: &ChannelContext) -> Result<ReplyOutcome> {
        self.contexts.lock().unwrap().push(context.clone());
        let next = {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.pop_front()
            } else {
                outcomes.front().cloned()
            }
        };
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match next {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(ReplyOutcome::Empty),
        }
    }
}
