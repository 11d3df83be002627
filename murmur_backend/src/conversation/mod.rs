//! Per-channel conversation lifecycle.
//!
//! A channel with no record is idle. A record moves Reading -> Responding ->
//! Engaged and is deleted outright when the exchange ends; a later message
//! creates a brand-new record. The `responding` flag is the single claim that
//! keeps two schedulers from replying in the same channel at once.

pub mod targeting;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::ServerChatConfig;
use crate::events::{DisengageReason, EngagementEvent};
use crate::message::{InboundMessage, MessageSnapshot};
use crate::task::ScheduledTask;

pub use targeting::ConversationView;

/// Reading-window extension per new message, as a fraction of the minimum window.
const EXTENSION_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Reading,
    Responding,
    Engaged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub reading_min_ms: u64,
    pub reading_max_ms: u64,
    pub max_extensions: u32,
    pub extend_on_activity: bool,
    pub idle_timeout: Duration,
    pub max_replies: u32,
}

impl From<&ServerChatConfig> for ConversationSettings {
    fn from(config: &ServerChatConfig) -> Self {
        Self {
            reading_min_ms: config.reading_period.min_ms,
            reading_max_ms: config.reading_period.max_ms,
            max_extensions: config.reading_period.max_extensions,
            extend_on_activity: config.reading_period.extend_on_activity,
            idle_timeout: config.engagement.idle_timeout(),
            max_replies: config.engagement.max_replies,
        }
    }
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self::from(&ServerChatConfig::default())
    }
}

impl ConversationSettings {
    fn draw_reading_window_ms(&self) -> u64 {
        if self.reading_max_ms <= self.reading_min_ms {
            return self.reading_min_ms;
        }
        rand::rng().random_range(self.reading_min_ms..=self.reading_max_ms)
    }

    fn extension_ms(&self) -> i64 {
        (self.reading_min_ms as f64 * EXTENSION_FRACTION) as i64
    }
}

struct ConversationRecord {
    record_id: u64,
    channel_id: String,
    guild_id: Option<String>,
    state: ConversationState,
    trigger_message: MessageSnapshot,
    initiator_id: String,
    participants: Vec<Participant>,
    message_buffer: Vec<MessageSnapshot>,
    extensions_used: u32,
    max_extensions: u32,
    reading_window_ms: u64,
    reading_deadline_ms: i64,
    reply_count: u32,
    started_at_ms: i64,
    last_response_at_ms: Option<i64>,
    responding: bool,
    idle_epoch: u64,
    idle_timer: Option<ScheduledTask>,
    monitor: Option<(u64, ScheduledTask)>,
}

impl ConversationRecord {
    /// Appends unless the id is already buffered; returns whether it was new.
    fn push_message(&mut self, snapshot: MessageSnapshot) -> bool {
        if self.message_buffer.iter().any(|m| m.id == snapshot.id) {
            return false;
        }

        match self
            .participants
            .iter_mut()
            .find(|p| p.user_id == snapshot.author_id)
        {
            Some(participant) => participant.message_ids.push(snapshot.id.clone()),
            None => self.participants.push(Participant {
                user_id: snapshot.author_id.clone(),
                display_name: snapshot.author_name.clone(),
                message_ids: vec![snapshot.id.clone()],
            }),
        }

        self.message_buffer.push(snapshot);
        true
    }

    fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            channel_id: self.channel_id.clone(),
            guild_id: self.guild_id.clone(),
            state: self.state,
            trigger_message: self.trigger_message.clone(),
            initiator_id: self.initiator_id.clone(),
            participants: self.participants.clone(),
            message_buffer: self.message_buffer.clone(),
            extensions_used: self.extensions_used,
            max_extensions: self.max_extensions,
            reading_window_ms: self.reading_window_ms,
            reading_deadline_ms: self.reading_deadline_ms,
            reply_count: self.reply_count,
            started_at_ms: self.started_at_ms,
            last_response_at_ms: self.last_response_at_ms,
            responding: self.responding,
            has_idle_timer: self.idle_timer.is_some(),
            has_monitor: self.monitor.is_some(),
        }
    }
}

/// Held by a reply round for as long as it owns a channel. A claim names the
/// record it was taken on, so a round that outlives its conversation cannot
/// touch a newer one in the same channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    channel_id: String,
    record_id: u64,
}

impl Claim {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

/// Read-only copy of a conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub state: ConversationState,
    pub trigger_message: MessageSnapshot,
    pub initiator_id: String,
    pub participants: Vec<Participant>,
    pub message_buffer: Vec<MessageSnapshot>,
    pub extensions_used: u32,
    pub max_extensions: u32,
    pub reading_window_ms: u64,
    pub reading_deadline_ms: i64,
    pub reply_count: u32,
    pub started_at_ms: i64,
    pub last_response_at_ms: Option<i64>,
    pub responding: bool,
    pub has_idle_timer: bool,
    pub has_monitor: bool,
}

pub struct ConversationStore {
    records: Mutex<HashMap<String, ConversationRecord>>,
    settings: ConversationSettings,
    clock: Arc<dyn Clock>,
    events: Option<flume::Sender<EngagementEvent>>,
    next_record_id: AtomicU64,
}

impl ConversationStore {
    pub fn new(settings: ConversationSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            settings,
            clock,
            events: None,
            next_record_id: AtomicU64::new(1),
        }
    }

    pub fn with_events(mut self, events: flume::Sender<EngagementEvent>) -> Self {
        self.events = Some(events);
        self
    }

    // Poisoning is ignored: no critical section leaves a record half-written.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ConversationRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: EngagementEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn get(&self, channel_id: &str) -> Option<ConversationSnapshot> {
        self.lock().get(channel_id).map(ConversationRecord::snapshot)
    }

    pub fn list(&self) -> Vec<ConversationSnapshot> {
        let mut all: Vec<ConversationSnapshot> =
            self.lock().values().map(ConversationRecord::snapshot).collect();
        all.sort_by_key(|c| c.started_at_ms);
        all
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens a conversation in the reading state, or folds the message into the
    /// channel's existing conversation.
    pub fn start(self: &Arc<Self>, trigger: &InboundMessage) -> ConversationSnapshot {
        let mut records = self.lock();

        if records.contains_key(&trigger.channel_id) {
            drop(records);
            self.buffer(trigger);
            let mut records = self.lock();
            if let Some(existing) = records.get_mut(&trigger.channel_id) {
                return existing.snapshot();
            }
            // Disengaged between the two locks; fall through to a fresh record.
            drop(records);
            return self.start(trigger);
        }

        let now = self.clock.now_ms();
        let window_ms = self.settings.draw_reading_window_ms();
        let snapshot = MessageSnapshot::from(trigger);

        let mut record = ConversationRecord {
            record_id: self.next_record_id.fetch_add(1, Ordering::Relaxed),
            channel_id: trigger.channel_id.clone(),
            guild_id: trigger.guild_id.clone(),
            state: ConversationState::Reading,
            trigger_message: snapshot.clone(),
            initiator_id: trigger.author_id.clone(),
            participants: Vec::new(),
            message_buffer: Vec::new(),
            extensions_used: 0,
            max_extensions: self.settings.max_extensions,
            reading_window_ms: window_ms,
            reading_deadline_ms: now + window_ms as i64,
            reply_count: 0,
            started_at_ms: now,
            last_response_at_ms: None,
            responding: false,
            idle_epoch: 0,
            idle_timer: None,
            monitor: None,
        };
        record.push_message(snapshot);

        let view = record.snapshot();
        records.insert(trigger.channel_id.clone(), record);
        drop(records);

        tracing::debug!(
            "Conversation started in {} by {} (reading for {}ms)",
            trigger.channel_id,
            trigger.author_id,
            window_ms
        );
        self.emit(EngagementEvent::ConversationStarted {
            channel_id: trigger.channel_id.clone(),
            initiator_id: trigger.author_id.clone(),
            reading_window_ms: window_ms,
        });
        view
    }

    /// Adds a message to an active conversation. Returns false when the channel is idle.
    pub fn buffer(self: &Arc<Self>, message: &InboundMessage) -> bool {
        let now = self.clock.now_ms();
        let mut records = self.lock();
        let Some(record) = records.get_mut(&message.channel_id) else {
            return false;
        };

        record.push_message(MessageSnapshot::from(message));

        match record.state {
            ConversationState::Reading => {
                if self.settings.extend_on_activity
                    && record.extensions_used < record.max_extensions
                {
                    // Pushes out from "now", so a late message can move the
                    // deadline by less than a full extension, never backwards.
                    let candidate = now + self.settings.extension_ms();
                    record.reading_deadline_ms = record.reading_deadline_ms.max(candidate);
                    record.extensions_used += 1;
                }
            }
            ConversationState::Engaged => self.arm_idle_timer(record),
            ConversationState::Responding => {}
        }

        true
    }

    pub fn is_relevant(&self, channel_id: &str, message: &InboundMessage, self_id: &str) -> bool {
        let records = self.lock();
        let Some(record) = records.get(channel_id) else {
            return false;
        };

        if message.mentions(self_id) {
            return true;
        }

        if record.has_participant(&message.author_id) {
            return true;
        }

        message
            .replied_to_message_id
            .as_deref()
            .map(|target| record.message_buffer.iter().any(|m| m.id == target))
            .unwrap_or(false)
    }

    /// Claims the channel for a reply and moves it to Responding. `None` when
    /// there is no conversation or a reply is already in flight.
    pub fn transition_to_responding(&self, channel_id: &str) -> Option<Claim> {
        let mut records = self.lock();
        let record = records.get_mut(channel_id)?;
        if record.responding {
            return None;
        }
        record.state = ConversationState::Responding;
        record.responding = true;
        Some(Claim {
            channel_id: record.channel_id.clone(),
            record_id: record.record_id,
        })
    }

    /// Claims the channel without changing its phase.
    pub fn try_claim(&self, channel_id: &str) -> Option<Claim> {
        let mut records = self.lock();
        let record = records.get_mut(channel_id)?;
        if record.responding {
            return None;
        }
        record.responding = true;
        Some(Claim {
            channel_id: record.channel_id.clone(),
            record_id: record.record_id,
        })
    }

    fn claimed<'a>(
        records: &'a mut HashMap<String, ConversationRecord>,
        claim: &Claim,
    ) -> Option<&'a mut ConversationRecord> {
        records
            .get_mut(&claim.channel_id)
            .filter(|r| r.record_id == claim.record_id && r.responding)
    }

    /// Records a delivered reply and (re)starts the idle timeout. `None` when
    /// the claimed record is gone, even if the channel has a newer one.
    pub fn transition_to_engaged(self: &Arc<Self>, claim: &Claim) -> Option<u32> {
        let now = self.clock.now_ms();
        let mut records = self.lock();
        let record = Self::claimed(&mut records, claim)?;

        record.state = ConversationState::Engaged;
        record.reply_count += 1;
        record.last_response_at_ms = Some(now);
        record.responding = false;
        self.arm_idle_timer(record);

        Some(record.reply_count)
    }

    pub fn mark_response_done(&self, claim: &Claim) {
        if let Some(record) = Self::claimed(&mut self.lock(), claim) {
            record.responding = false;
        }
    }

    /// Ends the conversation a claim was taken on. A newer record in the same
    /// channel is left alone.
    pub fn release(&self, claim: &Claim, reason: DisengageReason) -> bool {
        let removed = {
            let mut records = self.lock();
            if Self::claimed(&mut records, claim).is_none() {
                return false;
            }
            records.remove(&claim.channel_id)
        };
        match removed {
            Some(record) => {
                self.finish(record, reason);
                true
            }
            None => false,
        }
    }

    /// Deletes the record. Its idle timer and engagement monitor go with it.
    pub fn disengage(&self, channel_id: &str, reason: DisengageReason) -> bool {
        let removed = self.lock().remove(channel_id);
        match removed {
            Some(record) => {
                self.finish(record, reason);
                true
            }
            None => false,
        }
    }

    fn finish(&self, record: ConversationRecord, reason: DisengageReason) {
        let channel_id = record.channel_id.clone();
        tracing::info!(
            "Disengaged from {} after {} repl{} ({:?})",
            channel_id,
            record.reply_count,
            if record.reply_count == 1 { "y" } else { "ies" },
            reason
        );
        drop(record);

        self.emit(EngagementEvent::Disengaged { channel_id, reason });
    }

    /// Channels whose reading window has run out.
    pub fn ready_to_respond(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let mut ready: Vec<(i64, String)> = self
            .lock()
            .values()
            .filter(|r| r.state == ConversationState::Reading && now >= r.reading_deadline_ms)
            .map(|r| (r.reading_deadline_ms, r.channel_id.clone()))
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, channel_id)| channel_id).collect()
    }

    /// Disengages once the reply cap is hit; otherwise true while Engaged.
    pub fn should_continue_engaging(&self, channel_id: &str) -> bool {
        let (capped, engaged) = {
            let records = self.lock();
            let Some(record) = records.get(channel_id) else {
                return false;
            };
            (
                record.reply_count >= self.settings.max_replies,
                record.state == ConversationState::Engaged,
            )
        };

        if capped {
            self.disengage(channel_id, DisengageReason::ReplyCap);
            return false;
        }
        engaged
    }

    pub fn has_unseen_activity(&self, channel_id: &str, self_id: &str) -> bool {
        let records = self.lock();
        let Some(record) = records.get(channel_id) else {
            return false;
        };
        if record.responding {
            return false;
        }

        let since = record.last_response_at_ms.unwrap_or(0);
        record
            .message_buffer
            .iter()
            .any(|m| m.timestamp_ms > since && m.author_id != self_id)
    }

    pub fn context(&self, channel_id: &str, self_id: &str) -> Option<ConversationView> {
        self.lock().get(channel_id).map(|r| view(r, self_id))
    }

    /// Like `context`, but only while the claim still holds.
    pub fn claimed_context(&self, claim: &Claim, self_id: &str) -> Option<ConversationView> {
        Self::claimed(&mut self.lock(), claim).map(|r| view(r, self_id))
    }

    /// Hands ownership of an engagement monitor to the record the claim was
    /// taken on, replacing (and aborting) any previous one. Without that record
    /// the task is aborted at once.
    pub fn attach_monitor(&self, claim: &Claim, monitor_id: u64, task: ScheduledTask) -> bool {
        let mut records = self.lock();
        let Some(record) = records
            .get_mut(&claim.channel_id)
            .filter(|r| r.record_id == claim.record_id)
        else {
            return false;
        };
        let previous = record.monitor.replace((monitor_id, task));
        drop(records);
        drop(previous);
        true
    }

    /// Lets a running monitor take itself off the record without being aborted.
    pub fn release_monitor(&self, channel_id: &str, monitor_id: u64) {
        let released = {
            let mut records = self.lock();
            match records.get_mut(channel_id) {
                Some(record) if matches!(record.monitor, Some((id, _)) if id == monitor_id) => {
                    record.monitor.take()
                }
                _ => None,
            }
        };
        if let Some((_, task)) = released {
            task.detach();
        }
    }

    pub fn monitor_id(&self, channel_id: &str) -> Option<u64> {
        self.lock()
            .get(channel_id)
            .and_then(|r| r.monitor.as_ref().map(|(id, _)| *id))
    }

    fn arm_idle_timer(self: &Arc<Self>, record: &mut ConversationRecord) {
        record.idle_epoch += 1;
        let epoch = record.idle_epoch;
        let record_id = record.record_id;
        let channel_id = record.channel_id.clone();
        let timeout = self.settings.idle_timeout;
        let store: Weak<Self> = Arc::downgrade(self);

        // Replacing the old handle aborts the previous countdown.
        record.idle_timer = Some(ScheduledTask::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(store) = store.upgrade() {
                store.expire_idle(&channel_id, record_id, epoch);
            }
        }));
    }

    // The epoch check covers a timer that woke just as it was being replaced.
    fn expire_idle(&self, channel_id: &str, record_id: u64, epoch: u64) {
        let current = {
            let records = self.lock();
            records
                .get(channel_id)
                .map(|r| r.record_id == record_id && r.idle_epoch == epoch)
                .unwrap_or(false)
        };
        if current {
            self.disengage(channel_id, DisengageReason::IdleTimeout);
        }
    }
}

fn view(record: &ConversationRecord, self_id: &str) -> ConversationView {
    ConversationView {
        guild_id: record.guild_id.clone(),
        messages: targeting::build_history(&record.message_buffer, self_id),
        participants: record.participants.iter().map(|p| p.user_id.clone()).collect(),
        initiator_id: record.initiator_id.clone(),
        trigger_message_id: record.trigger_message.id.clone(),
        last_response_at_ms: record.last_response_at_ms,
        reply_target: targeting::select_reply_target(
            &record.message_buffer,
            &record.trigger_message,
            &record.initiator_id,
            record.last_response_at_ms,
            self_id,
        ),
    }
}
