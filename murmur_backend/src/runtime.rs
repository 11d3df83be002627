use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::BotConfig;
use crate::conversation::{ConversationSettings, ConversationStore};
use crate::engage::{DeadChannelScanner, EngagementEngine};
use crate::events::EngagementEvent;
use crate::inbound::InboundRouter;
use crate::llm_client::{ChatModel, LlmClient};
use crate::memory::MemoryStore;
use crate::profiles::ProfileStore;
use crate::responder::{ChatResponder, Responder};
use crate::stats::StatsDatabase;
use crate::transport::{BridgeTransport, ChatTransport};

/// Everything the daemon wires together at startup.
pub struct BackendRuntime {
    pub config: Arc<BotConfig>,
    pub store: Arc<ConversationStore>,
    pub engine: Arc<EngagementEngine>,
    pub router: Arc<InboundRouter>,
    pub stats: Option<Arc<StatsDatabase>>,
    pub dead_channels: Option<Arc<DeadChannelScanner>>,
}

pub struct BackendRuntimeBuilder {
    config: BotConfig,
    event_tx: Sender<EngagementEvent>,
    clock: Arc<dyn Clock>,
    model: Option<Arc<dyn ChatModel>>,
    transport: Option<Arc<dyn ChatTransport>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: BotConfig, event_tx: Sender<EngagementEvent>) -> Self {
        Self {
            config,
            event_tx,
            clock: Arc::new(SystemClock),
            model: None,
            transport: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub async fn build(self) -> Result<BackendRuntime> {
        let config = Arc::new(self.config);
        let clock = self.clock;

        let transport: Arc<dyn ChatTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                BridgeTransport::connect(&config.bridge)
                    .await
                    .context("Failed to reach the chat bridge")?,
            ),
        };
        let model: Arc<dyn ChatModel> = match self.model {
            Some(model) => model,
            None => {
                let llm = LlmClient::from_config(&config.llm);
                tracing::info!("Using {:?} model {}", llm.provider(), llm.model());
                Arc::new(llm)
            }
        };
        let self_id = transport.self_id().to_string();
        tracing::info!("Chatting as user {}", self_id);

        // Stats, memory and profiles are optional: without them replies lose some
        // context and dead chat revival has nothing to scan.
        let stats = match StatsDatabase::new(&config.database_path) {
            Ok(db) => Some(Arc::new(db)),
            Err(e) => {
                tracing::warn!("Failed to open stats database: {:#}", e);
                None
            }
        };
        let memory = if config.memory_extraction {
            match MemoryStore::new(&config.database_path) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    tracing::warn!("Failed to open memory database: {:#}", e);
                    None
                }
            }
        } else {
            None
        };
        let profiles = match ProfileStore::new(&config.database_path, config.learning_interval) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!("Failed to open profile database: {:#}", e);
                None
            }
        };

        let mut responder = ChatResponder::new(config.clone(), model, transport, clock.clone());
        if let Some(stats) = &stats {
            responder = responder.with_stats(stats.clone());
        }
        if let Some(memory) = memory {
            responder = responder.with_memory(memory);
        }
        if let Some(profiles) = profiles {
            responder = responder.with_profiles(profiles);
        }
        let responder: Arc<dyn Responder> = Arc::new(responder);

        let store = Arc::new(
            ConversationStore::new(
                ConversationSettings::from(&config.server_chat),
                clock.clone(),
            )
            .with_events(self.event_tx.clone()),
        );
        let engine = Arc::new(
            EngagementEngine::new(
                store.clone(),
                responder,
                self_id,
                &config.server_chat.engagement,
            )
            .with_events(self.event_tx),
        );

        let mut router = InboundRouter::new(config.clone(), engine.clone(), clock.clone());
        if let Some(stats) = &stats {
            router = router.with_stats(stats.clone());
        }

        let dead_channels = stats.clone().map(|stats| {
            Arc::new(DeadChannelScanner::new(
                engine.clone(),
                stats,
                config.server_chat.dead_chat.clone(),
                clock.clone(),
            ))
        });

        Ok(BackendRuntime {
            config,
            store,
            engine,
            router: Arc::new(router),
            stats,
            dead_channels,
        })
    }
}

impl BackendRuntime {
    pub async fn bootstrap(config: BotConfig, event_tx: Sender<EngagementEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build().await
    }

    /// Starts the reading scheduler and, when enabled, the dead chat scanner.
    pub fn spawn_schedulers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(
            self.engine
                .clone()
                .run_reading_scheduler(self.config.server_chat.poll_interval()),
        )];
        if let Some(scanner) = &self.dead_channels {
            if self.config.server_chat.dead_chat.enabled {
                handles.push(tokio::spawn(scanner.clone().run()));
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::clock::ManualClock;
    use crate::testing::{mention, RecordingTransport, ScriptedModel, Sent};

    #[tokio::test(start_paused = true)]
    async fn mention_flows_through_to_a_threaded_reply() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BotConfig::default();
        config.database_path = dir.path().join("murmur.db").to_string_lossy().to_string();
        config.server_chat.reading_period.min_ms = 3_000;
        config.server_chat.reading_period.max_ms = 3_000;
        config.server_chat.engagement.reply_chance = 1.0;
        config.memory_extraction = false;

        let clock = Arc::new(ManualClock::new(0));
        let transport = Arc::new(RecordingTransport::default());
        let model = Arc::new(ScriptedModel::new(vec![Ok("hey alice")]));
        let (tx, rx) = flume::unbounded();
        let runtime = BackendRuntimeBuilder::new(config, tx)
            .with_clock(clock.clone())
            .with_model(model.clone())
            .with_transport(transport.clone())
            .build()
            .await
            .unwrap();
        let schedulers = runtime.spawn_schedulers();

        runtime.router.route(&mention("m1", "alice", "c1", 0));
        clock.set(3_000);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(model.call_count(), 1);
        assert_eq!(
            transport.deliveries(),
            vec![Sent::Reply {
                channel_id: "c1".to_string(),
                message_id: "m1".to_string(),
                text: "hey alice".to_string(),
            }]
        );
        let snapshot = runtime.store.get("c1").unwrap();
        assert_eq!(snapshot.reply_count, 1);
        let kinds: Vec<&str> = rx.try_iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["conversation_started", "reply_sent"]);

        for handle in schedulers {
            handle.abort();
        }
    }
}
