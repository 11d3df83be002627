//! Entry point for every chat event the bridge pushes to the daemon.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::clock::Clock;
use crate::config::BotConfig;
use crate::engage::EngagementEngine;
use crate::message::InboundMessage;
use crate::stats::{StatsDatabase, UserActivity};

const DIRECT_QUEUE_CAPACITY: usize = 5;

/// Small FIFO of direct-message ids being answered, so a redelivered event does
/// not produce a second reply. Holds at most `capacity` ids; the oldest goes first.
#[derive(Debug)]
pub struct DedupQueue {
    ids: VecDeque<String>,
    capacity: usize,
}

impl DedupQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// False when the id is already queued.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        if self.ids.len() >= self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(id.to_string());
        true
    }

    pub fn remove(&mut self, id: &str) {
        self.ids.retain(|queued| queued != id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|queued| queued == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOutcome {
    OwnMessage,
    Blacklisted,
    DuplicateDirect,
    /// Handed to the direct-reply path in the background.
    Direct,
    Started,
    Buffered,
    Ignored,
}

pub struct InboundRouter {
    config: Arc<BotConfig>,
    engine: Arc<EngagementEngine>,
    stats: Option<Arc<StatsDatabase>>,
    clock: Arc<dyn Clock>,
    direct_queue: Mutex<DedupQueue>,
}

impl InboundRouter {
    pub fn new(config: Arc<BotConfig>, engine: Arc<EngagementEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            engine,
            stats: None,
            clock,
            direct_queue: Mutex::new(DedupQueue::new(DIRECT_QUEUE_CAPACITY)),
        }
    }

    pub fn with_stats(mut self, stats: Arc<StatsDatabase>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, DedupQueue> {
        self.direct_queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn route(self: &Arc<Self>, message: &InboundMessage) -> RouteOutcome {
        let self_id = self.engine.self_id();
        if message.author_id == self_id {
            return RouteOutcome::OwnMessage;
        }
        if self
            .config
            .is_blacklisted(&message.author_id, message.guild_id.as_deref())
        {
            tracing::debug!("Ignoring blacklisted author {}", message.author_id);
            return RouteOutcome::Blacklisted;
        }

        if message.is_direct_message {
            return self.route_direct(message);
        }

        self.track_activity(message);

        let store = self.engine.store();
        if message.mentions(self_id) {
            store.start(message);
            return RouteOutcome::Started;
        }
        if store.is_relevant(&message.channel_id, message, self_id) && store.buffer(message) {
            return RouteOutcome::Buffered;
        }
        RouteOutcome::Ignored
    }

    fn route_direct(self: &Arc<Self>, message: &InboundMessage) -> RouteOutcome {
        if !self.queue().insert(&message.id) {
            tracing::debug!("Direct message {} already being answered", message.id);
            return RouteOutcome::DuplicateDirect;
        }

        let router = Arc::clone(self);
        let message = message.clone();
        tokio::spawn(async move {
            router.engine.run_direct(&message).await;
            router.queue().remove(&message.id);
        });
        RouteOutcome::Direct
    }

    fn track_activity(&self, message: &InboundMessage) {
        let (Some(stats), Some(guild_id)) = (&self.stats, message.guild_id.as_deref()) else {
            return;
        };
        let activity = UserActivity {
            server_id: guild_id,
            server_name: "",
            channel_id: &message.channel_id,
            user_id: &message.author_id,
            username: &message.author_name,
            content: &message.text,
        };
        if let Err(e) = stats.track_user_message(&activity, self.clock.now_ms()) {
            tracing::warn!("Failed to record activity in {}: {:#}", guild_id, e);
        }
    }

    pub fn pending_direct(&self) -> usize {
        self.queue().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::BlacklistConfig;
    use crate::conversation::ConversationState;
    use crate::engage::tests::{harness, settings, Harness};
    use crate::responder::ReplyOutcome;
    use crate::testing::{direct, inbound, mention, SELF_ID};

    fn router(h: &Harness, config: BotConfig) -> Arc<InboundRouter> {
        Arc::new(InboundRouter::new(Arc::new(config), h.engine.clone(), h.clock.clone()))
    }

    #[test]
    fn dedup_queue_evicts_oldest_and_rejects_duplicates() {
        let mut queue = DedupQueue::new(5);
        for id in ["a", "b", "c", "d", "e"] {
            assert!(queue.insert(id));
        }
        assert!(!queue.insert("c"));
        assert!(queue.insert("f"));
        assert_eq!(queue.len(), 5);
        assert!(!queue.contains("a"));
        assert!(queue.contains("f"));

        queue.remove("f");
        assert!(queue.insert("f"));
    }

    #[tokio::test(start_paused = true)]
    async fn mention_starts_and_followups_buffer() {
        let h = harness(settings(), vec![Ok(ReplyOutcome::Sent { gif: false })]);
        let router = router(&h, BotConfig::default());

        assert_eq!(router.route(&inbound("m0", "alice", "c1", 0)), RouteOutcome::Ignored);
        assert!(h.store.is_empty());

        assert_eq!(router.route(&mention("m1", "alice", "c1", 1)), RouteOutcome::Started);
        assert_eq!(router.route(&inbound("m2", "alice", "c1", 2)), RouteOutcome::Buffered);
        assert_eq!(router.route(&inbound("m3", "carol", "c1", 3)), RouteOutcome::Ignored);

        let mut reply = inbound("m4", "dave", "c1", 4);
        reply.replied_to_message_id = Some("m2".to_string());
        assert_eq!(router.route(&reply), RouteOutcome::Buffered);

        let snapshot = h.store.get("c1").unwrap();
        assert_eq!(snapshot.state, ConversationState::Reading);
        assert_eq!(snapshot.message_buffer.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn own_and_blacklisted_messages_are_dropped() {
        let h = harness(settings(), vec![Ok(ReplyOutcome::Sent { gif: false })]);
        let config = BotConfig {
            blacklist: BlacklistConfig {
                users: vec!["mallory".to_string()],
                servers: vec!["g-banned".to_string()],
            },
            ..BotConfig::default()
        };
        let router = router(&h, config);

        assert_eq!(router.route(&mention("m1", SELF_ID, "c1", 0)), RouteOutcome::OwnMessage);
        assert_eq!(router.route(&mention("m2", "mallory", "c1", 0)), RouteOutcome::Blacklisted);
        let mut banned = mention("m3", "alice", "c2", 0);
        banned.guild_id = Some("g-banned".to_string());
        assert_eq!(router.route(&banned), RouteOutcome::Blacklisted);
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn direct_messages_are_answered_once() {
        let h = harness(settings(), vec![Ok(ReplyOutcome::Sent { gif: false })]);
        let router = router(&h, BotConfig::default());
        let dm = direct("d1", "alice", 0);

        assert_eq!(router.route(&dm), RouteOutcome::Direct);
        assert_eq!(router.route(&dm), RouteOutcome::DuplicateDirect);
        assert_eq!(router.pending_direct(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.responder.call_count(), 1);
        assert_eq!(router.pending_direct(), 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn guild_activity_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(StatsDatabase::new(dir.path().join("stats.db")).unwrap());
        let h = harness(settings(), vec![Ok(ReplyOutcome::Sent { gif: false })]);
        h.clock.set(5_000);
        let router = Arc::new(
            InboundRouter::new(Arc::new(BotConfig::default()), h.engine.clone(), h.clock.clone())
                .with_stats(stats.clone()),
        );

        router.route(&inbound("m1", "alice", "c1", 5_000));
        router.route(&direct("d1", "alice", 5_000));

        let activity = stats.channel_activity().unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].channel_id, "c1");
        assert_eq!(activity[0].last_message_ms, Some(5_000));
    }
}
