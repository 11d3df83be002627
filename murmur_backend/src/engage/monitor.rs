use std::sync::Arc;

use tokio::time::{interval_at, sleep, Instant};

use super::EngagementEngine;
use crate::conversation::{Claim, ConversationStore};
use crate::responder::RoundPurpose;

#[derive(Debug, PartialEq, Eq)]
enum Tick {
    Stop,
    Wait,
    Claimed(Claim),
}

fn check(store: &ConversationStore, channel_id: &str, self_id: &str) -> Tick {
    if !store.should_continue_engaging(channel_id) {
        return Tick::Stop;
    }
    if !store.has_unseen_activity(channel_id, self_id) {
        return Tick::Wait;
    }
    match store.try_claim(channel_id) {
        Some(claim) => Tick::Claimed(claim),
        None => Tick::Wait,
    }
}

/// Polls an engaged channel until someone says something new, then drives one
/// continuation round. A successful round starts a fresh monitor, so this one
/// always ends after claiming.
pub(super) async fn run(engine: Arc<EngagementEngine>, channel_id: String, monitor_id: u64) {
    let period = engine.check_interval;
    let mut ticks = interval_at(Instant::now() + period, period);
    let ceiling = sleep(engine.max_monitor);
    tokio::pin!(ceiling);

    let claim = loop {
        tokio::select! {
            _ = &mut ceiling => {
                tracing::debug!("Engagement monitor for {} reached its time limit", channel_id);
                engine.store.release_monitor(&channel_id, monitor_id);
                return;
            }
            _ = ticks.tick() => {}
        }

        match check(&engine.store, &channel_id, &engine.self_id) {
            Tick::Stop => return,
            Tick::Wait => continue,
            Tick::Claimed(claim) => break claim,
        }
    };

    // Off the record first: the next round attaches its own monitor, and
    // replacing this one must not abort the round in progress.
    engine.store.release_monitor(&channel_id, monitor_id);
    engine
        .run_claimed_round(claim, RoundPurpose::Continuation)
        .await;
}
