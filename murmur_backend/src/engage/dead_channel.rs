//! Periodic revival of channels the bot used to be active in that have gone quiet.

use std::sync::Arc;

use anyhow::Result;
use rand::Rng;

use super::EngagementEngine;
use crate::clock::Clock;
use crate::config::DeadChatConfig;
use crate::stats::{ChannelActivity, StatsDatabase};

/// Read side of the persisted per-channel activity counters.
pub trait ActivitySource: Send + Sync {
    fn channel_activity(&self) -> Result<Vec<ChannelActivity>>;
}

impl ActivitySource for StatsDatabase {
    fn channel_activity(&self) -> Result<Vec<ChannelActivity>> {
        StatsDatabase::channel_activity(self)
    }
}

/// Channels with enough past bot activity that have been silent for at least
/// `idle_minutes`. A channel with no recorded human message counts as silent
/// since the epoch.
pub fn eligible_dead_channels(
    rows: Vec<ChannelActivity>,
    min_bot_messages: u64,
    idle_minutes: u64,
    now_ms: i64,
) -> Vec<ChannelActivity> {
    let idle_ms = i64::try_from(idle_minutes.saturating_mul(60_000)).unwrap_or(i64::MAX);
    rows.into_iter()
        .filter(|row| row.bot_messages >= min_bot_messages)
        .filter(|row| now_ms - row.last_message_ms.unwrap_or(0) >= idle_ms)
        .collect()
}

pub struct DeadChannelScanner {
    engine: Arc<EngagementEngine>,
    source: Arc<dyn ActivitySource>,
    config: DeadChatConfig,
    clock: Arc<dyn Clock>,
}

impl DeadChannelScanner {
    pub fn new(
        engine: Arc<EngagementEngine>,
        source: Arc<dyn ActivitySource>,
        config: DeadChatConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            source,
            config,
            clock,
        }
    }

    /// Attempts at most one revival: the first eligible channel that passes the
    /// chance gate ends the scan whatever the reply turns out to be. Returns
    /// the channel id when something was sent.
    pub async fn scan_once(&self) -> Option<String> {
        let rows = match self.source.channel_activity() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Dead chat scan could not read channel activity: {:#}", e);
                return None;
            }
        };

        let candidates = eligible_dead_channels(
            rows,
            self.config.min_bot_messages,
            self.config.idle_minutes,
            self.clock.now_ms(),
        );
        if candidates.is_empty() {
            return None;
        }
        tracing::debug!("Dead chat scan found {} quiet channel(s)", candidates.len());

        let chosen = candidates
            .into_iter()
            .find(|_| rand::rng().random::<f64>() <= self.config.chance)?;
        self.engine
            .revive(&chosen.server_id, &chosen.channel_id)
            .await
            .then_some(chosen.channel_id)
    }

    pub async fn run(self: Arc<Self>) {
        if !self.config.enabled {
            tracing::debug!("Dead chat revival disabled");
            return;
        }
        let period = self.config.check_interval();
        tracing::info!("Dead chat scanner checking every {:?}", period);
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticks.tick().await;
            self.scan_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::engage::tests::{harness, settings};
    use crate::responder::ReplyOutcome;

    const MINUTE: i64 = 60_000;

    fn row(channel: &str, bot_messages: u64, last_message_ms: Option<i64>) -> ChannelActivity {
        ChannelActivity {
            server_id: "g1".to_string(),
            server_name: "Hangout".to_string(),
            channel_id: channel.to_string(),
            last_message_ms,
            message_count: 100,
            bot_messages,
        }
    }

    struct FixedActivity(Mutex<Result<Vec<ChannelActivity>, String>>);

    impl ActivitySource for FixedActivity {
        fn channel_activity(&self) -> Result<Vec<ChannelActivity>> {
            self.0
                .lock()
                .unwrap()
                .clone()
                .map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn config(chance: f64) -> DeadChatConfig {
        DeadChatConfig {
            enabled: true,
            chance,
            ..DeadChatConfig::default()
        }
    }

    #[test]
    fn eligibility_thresholds() {
        let now = 100 * MINUTE;
        let rows = vec![
            row("quiet", 20, Some(now - 40 * MINUTE)),
            row("recent", 20, Some(now - 10 * MINUTE)),
            row("few-bot-lines", 3, Some(now - 40 * MINUTE)),
            row("exact", 15, Some(now - 30 * MINUTE)),
            row("never-talked", 15, None),
        ];
        let eligible: Vec<String> = eligible_dead_channels(rows, 15, 30, now)
            .into_iter()
            .map(|r| r.channel_id)
            .collect();
        assert_eq!(eligible, vec!["quiet", "exact", "never-talked"]);
    }

    #[tokio::test(start_paused = true)]
    async fn revives_at_most_one_channel_per_scan() {
        let h = harness(settings(), vec![Ok(ReplyOutcome::Sent { gif: false })]);
        h.clock.set(100 * MINUTE);
        let source = Arc::new(FixedActivity(Mutex::new(Ok(vec![
            row("a", 20, Some(0)),
            row("b", 20, Some(0)),
        ]))));
        let scanner = DeadChannelScanner::new(h.engine.clone(), source, config(1.0), h.clock.clone());

        assert_eq!(scanner.scan_once().await.as_deref(), Some("a"));
        assert_eq!(h.responder.call_count(), 1);
        assert!(h.store.is_empty());
    }

    #[test]
    fn huge_idle_threshold_makes_nothing_eligible() {
        let rows = vec![row("quiet", 20, Some(0)), row("never-talked", 20, None)];
        assert!(eligible_dead_channels(rows, 15, u64::MAX, 100 * MINUTE).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_revival_still_ends_the_scan() {
        let h = harness(
            settings(),
            vec![Ok(ReplyOutcome::Empty), Ok(ReplyOutcome::Sent { gif: false })],
        );
        h.clock.set(100 * MINUTE);
        let source = Arc::new(FixedActivity(Mutex::new(Ok(vec![
            row("a", 20, Some(0)),
            row("b", 20, Some(0)),
        ]))));
        let scanner = DeadChannelScanner::new(h.engine.clone(), source, config(1.0), h.clock.clone());

        assert_eq!(scanner.scan_once().await, None);
        assert_eq!(h.responder.call_count(), 1);
        assert_eq!(h.responder.contexts.lock().unwrap()[0].channel_id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_chance_and_unreadable_stats_revive_nothing() {
        let h = harness(settings(), vec![Ok(ReplyOutcome::Sent { gif: false })]);
        h.clock.set(100 * MINUTE);
        let source = Arc::new(FixedActivity(Mutex::new(Ok(vec![row("a", 20, Some(0))]))));
        let scanner = DeadChannelScanner::new(h.engine.clone(), source, config(-1.0), h.clock.clone());
        assert_eq!(scanner.scan_once().await, None);

        let broken = Arc::new(FixedActivity(Mutex::new(Err("disk gone".to_string()))));
        let scanner = DeadChannelScanner::new(h.engine.clone(), broken, config(1.0), h.clock.clone());
        assert_eq!(scanner.scan_once().await, None);
        assert_eq!(h.responder.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_scanner_returns_immediately() {
        let h = harness(settings(), vec![Ok(ReplyOutcome::Sent { gif: false })]);
        let source = Arc::new(FixedActivity(Mutex::new(Ok(vec![row("a", 20, None)]))));
        let scanner = Arc::new(DeadChannelScanner::new(
            h.engine.clone(),
            source,
            DeadChatConfig::default(),
            h.clock.clone(),
        ));
        scanner.run().await;
        assert_eq!(h.responder.call_count(), 0);
    }
}
