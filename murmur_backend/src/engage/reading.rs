//! Turns closed reading windows into opening replies.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::EngagementEngine;
use crate::responder::RoundPurpose;

impl EngagementEngine {
    /// Claims every channel whose reading window has closed and spawns its
    /// opening round. Channels already claimed elsewhere are skipped.
    pub fn dispatch_ready(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut rounds = Vec::new();
        for channel_id in self.store.ready_to_respond() {
            let Some(claim) = self.store.transition_to_responding(&channel_id) else {
                continue;
            };
            tracing::debug!("Reading window closed in {}", channel_id);
            let engine = Arc::clone(self);
            rounds.push(tokio::spawn(async move {
                engine.run_claimed_round(claim, RoundPurpose::Opening).await;
            }));
        }
        rounds
    }

    pub async fn run_reading_scheduler(self: Arc<Self>, poll_interval: Duration) {
        tracing::info!("Reading scheduler polling every {:?}", poll_interval);
        let mut ticks = tokio::time::interval(poll_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticks.tick().await;
            self.dispatch_ready();
        }
    }
}
