//! Drives reply rounds: the opening reply once a reading window closes, the
//! follow-ups while engaged, unprompted revivals and one-on-one replies.
//!
//! Every guild round runs with the channel already claimed in the store, and
//! every exit path either moves the record to Engaged or deletes it.

pub mod dead_channel;
mod monitor;
pub mod reading;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngagementConfig;
use crate::conversation::{Claim, ConversationStore};
use crate::events::{DisengageReason, EngagementEvent};
use crate::message::InboundMessage;
use crate::responder::{ChannelContext, ReplyOutcome, Responder, RoundPurpose};
use crate::task::ScheduledTask;

pub use dead_channel::{ActivitySource, DeadChannelScanner};

pub struct EngagementEngine {
    store: Arc<ConversationStore>,
    responder: Arc<dyn Responder>,
    events: Option<flume::Sender<EngagementEvent>>,
    self_id: String,
    check_interval: Duration,
    max_monitor: Duration,
    next_monitor_id: AtomicU64,
}

impl EngagementEngine {
    pub fn new(
        store: Arc<ConversationStore>,
        responder: Arc<dyn Responder>,
        self_id: impl Into<String>,
        engagement: &EngagementConfig,
    ) -> Self {
        Self {
            store,
            responder,
            events: None,
            self_id: self_id.into(),
            check_interval: engagement.check_interval(),
            max_monitor: engagement.max_monitor(),
            next_monitor_id: AtomicU64::new(1),
        }
    }

    pub fn with_events(mut self, events: flume::Sender<EngagementEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    fn emit(&self, event: EngagementEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn guild_context(&self, claim: &Claim, purpose: RoundPurpose) -> Option<ChannelContext> {
        let view = self.store.claimed_context(claim, &self.self_id)?;

        Some(ChannelContext {
            channel_id: claim.channel_id().to_string(),
            guild_id: view.guild_id,
            purpose,
            history: view.messages,
            participants: view.participants,
            initiator_id: Some(view.initiator_id),
            reply_target: Some(view.reply_target),
            trigger: None,
        })
    }

    /// Runs one reply round on the record `claim` was taken on. Once that
    /// record is gone the round's outcome is dropped.
    pub(crate) async fn run_claimed_round(self: &Arc<Self>, claim: Claim, purpose: RoundPurpose) {
        let channel_id = claim.channel_id();
        let Some(context) = self.guild_context(&claim, purpose) else {
            tracing::debug!("Conversation in {} ended before its {:?} round", channel_id, purpose);
            return;
        };
        if context.history.is_empty() {
            self.store.release(&claim, DisengageReason::NoContext);
            return;
        }

        match self.responder.respond(&context).await {
            Ok(ReplyOutcome::Sent { gif }) => {
                let Some(reply_count) = self.store.transition_to_engaged(&claim) else {
                    tracing::debug!("Conversation in {} ended while replying", channel_id);
                    return;
                };
                tracing::debug!("Reply {} sent in {}", reply_count, channel_id);
                self.emit(EngagementEvent::ReplySent {
                    channel_id: channel_id.to_string(),
                    reply_count,
                    gif,
                });
                self.start_monitor(&claim);
            }
            Ok(ReplyOutcome::Empty) => {
                tracing::debug!("Nothing to say in {}", channel_id);
                self.store.release(&claim, DisengageReason::EmptyReply);
            }
            Err(e) => {
                tracing::warn!("Reply round in {} failed: {:#}", channel_id, e);
                self.emit(EngagementEvent::Error {
                    channel_id: Some(channel_id.to_string()),
                    message: e.to_string(),
                });
                self.store.release(&claim, DisengageReason::ResponderFailed);
            }
        }
    }

    /// Starts watching an engaged channel for follow-up activity. The store
    /// owns the task, so a monitor already attached to the channel is aborted.
    fn start_monitor(self: &Arc<Self>, claim: &Claim) {
        let monitor_id = self.next_monitor_id.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::clone(self);
        let channel = claim.channel_id().to_string();
        let task = ScheduledTask::spawn(async move {
            monitor::run(engine, channel, monitor_id).await;
        });

        if !self.store.attach_monitor(claim, monitor_id, task) {
            tracing::debug!("No conversation in {} to monitor", claim.channel_id());
        }
    }

    /// One-on-one reply. Never touches the conversation store.
    pub async fn run_direct(&self, message: &InboundMessage) -> Option<ReplyOutcome> {
        let context = ChannelContext::direct(message);
        match self.responder.respond(&context).await {
            Ok(outcome) => {
                if let ReplyOutcome::Sent { .. } = outcome {
                    self.emit(EngagementEvent::DirectReply {
                        channel_id: message.channel_id.clone(),
                        author_id: message.author_id.clone(),
                    });
                }
                Some(outcome)
            }
            Err(e) => {
                tracing::warn!("Direct reply to {} failed: {:#}", message.author_id, e);
                self.emit(EngagementEvent::Error {
                    channel_id: Some(message.channel_id.clone()),
                    message: e.to_string(),
                });
                None
            }
        }
    }

    /// Unprompted message into a quiet channel. Returns whether anything was sent.
    pub async fn revive(&self, guild_id: &str, channel_id: &str) -> bool {
        let context = ChannelContext::revival(guild_id, channel_id);
        match self.responder.respond(&context).await {
            Ok(ReplyOutcome::Sent { .. }) => {
                tracing::info!("Revived quiet channel {} in {}", channel_id, guild_id);
                self.emit(EngagementEvent::ChannelRevived {
                    guild_id: guild_id.to_string(),
                    channel_id: channel_id.to_string(),
                });
                true
            }
            Ok(ReplyOutcome::Empty) => false,
            Err(e) => {
                tracing::warn!("Reviving {} failed: {:#}", channel_id, e);
                self.emit(EngagementEvent::Error {
                    channel_id: Some(channel_id.to_string()),
                    message: e.to_string(),
                });
                false
            }
        }
    }
}
