//! Language-model backed responder that talks through the chat transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use rand::Rng;

use super::prompt::{self, DirectPromptParts, ServerPromptParts, REVIVAL_INSTRUCTION};
use super::{ChannelContext, ReplyOutcome, Responder, RoundPurpose};
use crate::clock::Clock;
use crate::config::BotConfig;
use crate::gifs::{GifChoice, GifLibrary};
use crate::llm_client::{ChatModel, Message};
use crate::memory::MemoryStore;
use crate::profiles::{ProfileStore, UserProfile};
use crate::stats::StatsDatabase;
use crate::task::ScheduledTask;
use crate::transport::{ChannelInfo, ChatTransport};

const TYPING_REFRESH: Duration = Duration::from_secs(5);
const REVIVAL_HISTORY: usize = 10;
const ACTIVE_PERSON_MIN_MESSAGES: u64 = 5;
const ACTIVE_PEOPLE_SHOWN: usize = 5;
/// Trailing history lines handed to memory extraction along with our reply.
const MEMORY_EXCHANGE_LINES: usize = 4;

pub struct ChatResponder {
    config: Arc<BotConfig>,
    model: Arc<dyn ChatModel>,
    transport: Arc<dyn ChatTransport>,
    stats: Option<Arc<StatsDatabase>>,
    memory: Option<Arc<MemoryStore>>,
    profiles: Option<Arc<ProfileStore>>,
    gifs: GifLibrary,
    clock: Arc<dyn Clock>,
}

struct PreparedRound {
    system: String,
    messages: Vec<Message>,
    channel: ChannelInfo,
    allow_gifs: bool,
}

impl ChatResponder {
    pub fn new(
        config: Arc<BotConfig>,
        model: Arc<dyn ChatModel>,
        transport: Arc<dyn ChatTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let gifs = GifLibrary::from_config(&config.gifs);
        Self {
            config,
            model,
            transport,
            stats: None,
            memory: None,
            profiles: None,
            gifs,
            clock,
        }
    }

    pub fn with_stats(mut self, stats: Arc<StatsDatabase>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_profiles(mut self, profiles: Arc<ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    fn time_line(&self) -> String {
        let local = DateTime::from_timestamp_millis(self.clock.now_ms())
            .map(|utc| utc.with_timezone(&Local).naive_local())
            .unwrap_or_default();
        prompt::describe_time(local)
    }

    async fn channel_info(&self, ctx: &ChannelContext) -> ChannelInfo {
        match self.transport.channel_info(&ctx.channel_id).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Channel info for {} unavailable: {:#}", ctx.channel_id, e);
                ChannelInfo {
                    channel_id: ctx.channel_id.clone(),
                    name: ctx.channel_id.clone(),
                    topic: None,
                    guild_id: ctx.guild_id.clone(),
                    guild_name: None,
                }
            }
        }
    }

    fn stats_string(&self, guild_id: Option<&str>) -> String {
        let (Some(stats), Some(guild_id)) = (&self.stats, guild_id) else {
            return String::new();
        };
        stats.server_context_string(guild_id).unwrap_or_else(|e| {
            tracing::warn!("Server stats for {} unavailable: {:#}", guild_id, e);
            String::new()
        })
    }

    /// The stored profile, or a freshly learned one the first time someone
    /// writes. Failures only cost the prompt its relationship section.
    async fn direct_profile(&self, channel_id: &str, user_id: &str) -> Option<UserProfile> {
        let profiles = self.profiles.as_ref()?;
        match profiles.get(user_id) {
            Ok(Some(profile)) => return Some(profile),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Profile for {} unavailable: {:#}", user_id, e);
                return None;
            }
        }

        tracing::info!("Learning profile for {}", user_id);
        let history = match self
            .transport
            .fetch_recent(channel_id, self.config.profile_history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                tracing::debug!("No history to learn {} from: {:#}", user_id, e);
                return None;
            }
        };
        profiles
            .learn(
                self.model.as_ref(),
                &history,
                user_id,
                self.transport.self_id(),
                self.clock.now_ms(),
            )
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Learning profile for {} failed: {:#}", user_id, e);
                None
            })
    }

    async fn prepare(&self, ctx: &ChannelContext) -> Result<PreparedRound> {
        let channel = self.channel_info(ctx).await;
        let guild_id = ctx.guild_id.as_deref().or(channel.guild_id.as_deref());
        let base_prompt = self.config.system_prompt_for(guild_id);
        let self_id = self.transport.self_id();

        let round = match ctx.purpose {
            RoundPurpose::Opening | RoundPurpose::Continuation => {
                let continuing = ctx.purpose == RoundPurpose::Continuation;
                let server_stats = self.stats_string(guild_id);
                // Per-person notes only go into the opening round.
                let participant_notes: Vec<String> = match (&self.stats, guild_id) {
                    (Some(stats), Some(guild)) if !continuing => ctx
                        .participants
                        .iter()
                        .filter_map(|user| stats.user_context_string(guild, user).ok())
                        .collect(),
                    _ => Vec::new(),
                };
                let gif_section = self.gifs.prompt_section();
                let time_line = self.time_line();

                let system = prompt::server_round_prompt(&ServerPromptParts {
                    base_prompt,
                    channel: &channel,
                    participant_count: ctx.participants.len(),
                    continuing,
                    server_stats: &server_stats,
                    participant_notes: &participant_notes,
                    gif_section: &gif_section,
                    time_line: &time_line,
                });
                PreparedRound {
                    system,
                    messages: prompt::history_messages(&ctx.history),
                    channel,
                    allow_gifs: true,
                }
            }
            RoundPurpose::Revival => {
                let server_stats = self.stats_string(guild_id);
                let active_people = match (&self.stats, guild_id) {
                    (Some(stats), Some(guild)) => stats
                        .active_usernames(guild, ACTIVE_PERSON_MIN_MESSAGES, ACTIVE_PEOPLE_SHOWN)
                        .unwrap_or_default(),
                    _ => Vec::new(),
                };
                let system =
                    prompt::revival_prompt(base_prompt, &channel, &server_stats, &active_people);

                let recent = self
                    .transport
                    .fetch_recent(&ctx.channel_id, REVIVAL_HISTORY)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::debug!("No history for revival of {}: {:#}", ctx.channel_id, e);
                        Vec::new()
                    });
                let mut messages = prompt::fetched_messages(&recent, self_id, None);
                messages.push(Message::user(REVIVAL_INSTRUCTION));

                PreparedRound {
                    system,
                    messages,
                    channel,
                    allow_gifs: false,
                }
            }
            RoundPurpose::Direct => {
                let trigger = ctx
                    .trigger
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("Direct round without a trigger message"))?;

                let recent = self
                    .transport
                    .fetch_recent(&ctx.channel_id, self.config.context_messages + 1)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::debug!("No history for direct chat {}: {:#}", ctx.channel_id, e);
                        Vec::new()
                    });
                let mut messages = prompt::fetched_messages(&recent, self_id, Some(trigger.id.as_str()));
                messages.push(Message::user(trigger.text.clone()));

                let now = self.clock.now_ms();
                let fresh = prompt::is_fresh_conversation(&recent, now);
                let profile = self.direct_profile(&ctx.channel_id, &trigger.author_id).await;
                let last_seen = profile
                    .as_ref()
                    .and_then(|p| prompt::describe_elapsed(now - p.last_seen_ms));
                let memory = match &self.memory {
                    Some(memory) => memory.memory_string(&trigger.author_id).unwrap_or_else(|e| {
                        tracing::warn!("Memory for {} unavailable: {:#}", trigger.author_id, e);
                        String::new()
                    }),
                    None => String::new(),
                };
                let gif_section = self.gifs.prompt_section();
                let system = prompt::direct_prompt(&DirectPromptParts {
                    base_prompt,
                    time_line: &self.time_line(),
                    last_seen: last_seen.as_deref(),
                    fresh_conversation: fresh,
                    memory: &memory,
                    profile: profile.as_ref(),
                    gif_section: &gif_section,
                });

                PreparedRound {
                    system,
                    messages,
                    channel,
                    allow_gifs: true,
                }
            }
        };

        Ok(round)
    }

    fn start_typing(&self, channel_id: &str) -> ScheduledTask {
        let transport = self.transport.clone();
        let channel_id = channel_id.to_string();
        ScheduledTask::spawn(async move {
            loop {
                if let Err(e) = transport.send_typing(&channel_id).await {
                    tracing::debug!("Typing indicator failed in {}: {:#}", channel_id, e);
                }
                tokio::time::sleep(TYPING_REFRESH).await;
            }
        })
    }

    fn humanlike_delay(&self) -> Duration {
        let (min, max) = (self.config.delay.min_ms, self.config.delay.max_ms);
        let ms = if max <= min {
            min
        } else {
            rand::rng().random_range(min..=max)
        };
        Duration::from_millis(ms)
    }

    async fn deliver_text(&self, ctx: &ChannelContext, text: &str) -> Result<()> {
        let threaded = matches!(
            ctx.purpose,
            RoundPurpose::Opening | RoundPurpose::Continuation
        ) && rand::rng().random::<f64>() < self.config.server_chat.engagement.reply_chance;

        if threaded {
            if let Some(target) = &ctx.reply_target {
                match self.transport.reply_to(&ctx.channel_id, target, text).await {
                    Ok(()) => return Ok(()),
                    Err(e) => tracing::debug!(
                        "Threaded reply to {} failed, sending plainly: {:#}",
                        target,
                        e
                    ),
                }
            }
        }

        self.transport.send_message(&ctx.channel_id, text).await
    }

    fn record_bot_message(&self, ctx: &ChannelContext, channel: &ChannelInfo) {
        let Some(stats) = &self.stats else {
            return;
        };
        let Some(guild_id) = ctx.guild_id.as_deref().or(channel.guild_id.as_deref()) else {
            return;
        };
        let guild_name = channel.guild_name.as_deref().unwrap_or(guild_id);
        if let Err(e) =
            stats.track_bot_message(guild_id, guild_name, &ctx.channel_id, self.clock.now_ms())
        {
            tracing::warn!("Failed to record bot message in {}: {:#}", ctx.channel_id, e);
        }
    }

    /// Marks the person as just seen and, every `learning_interval` replies,
    /// refreshes their profile in the background.
    fn refresh_profile(&self, ctx: &ChannelContext) {
        let (Some(profiles), Some(trigger)) = (self.profiles.clone(), ctx.trigger.as_ref()) else {
            return;
        };
        let now = self.clock.now_ms();
        if let Err(e) = profiles.touch(&trigger.author_id, now) {
            tracing::warn!("Failed to update last seen for {}: {:#}", trigger.author_id, e);
        }
        if !profiles.track_interaction(&trigger.author_id) {
            return;
        }

        let model = self.model.clone();
        let transport = self.transport.clone();
        let limit = self.config.profile_history_limit;
        let channel_id = ctx.channel_id.clone();
        let user_id = trigger.author_id.clone();
        tokio::spawn(async move {
            let result = match transport.fetch_recent(&channel_id, limit).await {
                Ok(history) => {
                    profiles
                        .update(model.as_ref(), &history, &user_id, transport.self_id(), now)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::debug!("Profile refresh for {} failed: {:#}", user_id, e);
            }
        });
    }

    fn spawn_memory_extraction(&self, ctx: &ChannelContext, messages: &[Message], reply: &str) {
        if !self.config.memory_extraction {
            return;
        }
        let (Some(memory), Some(trigger)) = (self.memory.clone(), ctx.trigger.as_ref()) else {
            return;
        };

        let skip = messages.len().saturating_sub(MEMORY_EXCHANGE_LINES);
        let mut exchange = messages[skip..].to_vec();
        exchange.push(Message::assistant(reply));

        let model = self.model.clone();
        let user_id = trigger.author_id.clone();
        let today = Local::now().date_naive();
        tokio::spawn(async move {
            if let Err(e) = memory
                .extract_from_exchange(model.as_ref(), &user_id, &exchange, today)
                .await
            {
                tracing::debug!("Memory extraction for {} failed: {:#}", user_id, e);
            }
        });
    }
}

#[async_trait]
impl Responder for ChatResponder {
    async fn respond(&self, ctx: &ChannelContext) -> Result<ReplyOutcome> {
        let round = self.prepare(ctx).await?;

        let typing = self.start_typing(&ctx.channel_id);
        let mut reply = self.model.complete(&round.system, &round.messages).await?;

        if reply.trim().is_empty() {
            return Ok(ReplyOutcome::Empty);
        }

        let mut gif_url = None;
        if round.allow_gifs {
            let choice = self.gifs.parse_reply(&reply, &mut rand::rng());
            match choice {
                GifChoice::Send(url) => gif_url = Some(url),
                GifChoice::Reroll => {
                    tracing::debug!("Skipping gif reply in {}, asking again", ctx.channel_id);
                    reply = self.model.complete(&round.system, &round.messages).await?;
                    if reply.trim().is_empty() {
                        return Ok(ReplyOutcome::Empty);
                    }
                }
                GifChoice::NotGif => {}
            }

            if gif_url.is_none() {
                let incoming = prompt::last_user_text(&round.messages);
                gif_url = self.gifs.keyword_match(incoming, &reply, &mut rand::rng());
            }
        }
        drop(typing);

        tokio::time::sleep(self.humanlike_delay()).await;

        match &gif_url {
            Some(url) => self.transport.send_message(&ctx.channel_id, url).await?,
            None => self.deliver_text(ctx, reply.trim()).await?,
        }

        match ctx.purpose {
            RoundPurpose::Direct => {
                tracing::info!("Replied in direct chat {}", ctx.channel_id);
                self.refresh_profile(ctx);
                self.spawn_memory_extraction(ctx, &round.messages, &reply);
            }
            RoundPurpose::Revival => {
                tracing::info!("Revived {}", round.channel.display_location());
                self.record_bot_message(ctx, &round.channel);
            }
            RoundPurpose::Opening | RoundPurpose::Continuation => {
                tracing::info!("Replied in {}", round.channel.display_location());
                self.record_bot_message(ctx, &round.channel);
            }
        }

        Ok(ReplyOutcome::Sent {
            gif: gif_url.is_some(),
        })
    }
}
