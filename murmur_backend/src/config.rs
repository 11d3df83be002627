use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openrouter_url")]
    pub api_url: String,
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
}

fn default_provider() -> String {
    "openrouter".to_string()
}

fn default_model() -> String {
    "meta-llama/llama-3.3-70b-instruct".to_string()
}

fn default_openrouter_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.2".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            api_url: default_openrouter_url(),
            ollama_url: default_ollama_url(),
            ollama_model: default_ollama_model(),
        }
    }
}

/// Humanlike pause before a reply is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    #[serde(default = "default_delay_min_ms")]
    pub min_ms: u64,
    #[serde(default = "default_delay_max_ms")]
    pub max_ms: u64,
}

fn default_delay_min_ms() -> u64 {
    1000
}

fn default_delay_max_ms() -> u64 {
    3000
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            min_ms: default_delay_min_ms(),
            max_ms: default_delay_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlacklistConfig {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingPeriodConfig {
    #[serde(default = "default_reading_min_ms")]
    pub min_ms: u64,
    #[serde(default = "default_reading_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_max_extensions")]
    pub max_extensions: u32,
    #[serde(default = "default_true")]
    pub extend_on_activity: bool,
}

fn default_reading_min_ms() -> u64 {
    3000
}

fn default_reading_max_ms() -> u64 {
    15000
}

fn default_max_extensions() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for ReadingPeriodConfig {
    fn default() -> Self {
        Self {
            min_ms: default_reading_min_ms(),
            max_ms: default_reading_max_ms(),
            max_extensions: default_max_extensions(),
            extend_on_activity: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementConfig {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_replies")]
    pub max_replies: u32,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_max_monitor_ms")]
    pub max_monitor_ms: u64,
    /// Chance that a reply is threaded onto the selected reply target.
    #[serde(default = "default_reply_chance")]
    pub reply_chance: f64,
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_max_replies() -> u32 {
    10
}

fn default_check_interval_ms() -> u64 {
    2000
}

fn default_max_monitor_ms() -> u64 {
    120_000
}

fn default_reply_chance() -> f64 {
    0.4
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            max_replies: default_max_replies(),
            check_interval_ms: default_check_interval_ms(),
            max_monitor_ms: default_max_monitor_ms(),
            reply_chance: default_reply_chance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadChatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_dead_chat_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_min_bot_messages")]
    pub min_bot_messages: u64,
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,
    #[serde(default = "default_dead_chat_chance")]
    pub chance: f64,
}

fn default_dead_chat_interval_ms() -> u64 {
    300_000
}

fn default_min_bot_messages() -> u64 {
    15
}

fn default_idle_minutes() -> u64 {
    30
}

fn default_dead_chat_chance() -> f64 {
    0.3
}

impl Default for DeadChatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_ms: default_dead_chat_interval_ms(),
            min_bot_messages: default_min_bot_messages(),
            idle_minutes: default_idle_minutes(),
            chance: default_dead_chat_chance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerChatConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub reading_period: ReadingPeriodConfig,
    #[serde(default)]
    pub engagement: EngagementConfig,
    #[serde(default)]
    pub dead_chat: DeadChatConfig,
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for ServerChatConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            reading_period: ReadingPeriodConfig::default(),
            engagement: EngagementConfig::default(),
            dead_chat: DeadChatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GifEntry {
    pub url: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub triggers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GifConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gif_chance")]
    pub chance: f64,
    #[serde(default)]
    pub entries: Vec<GifEntry>,
}

fn default_gif_chance() -> f64 {
    0.3
}

impl Default for GifConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chance: default_gif_chance(),
            entries: Vec::new(),
        }
    }
}

/// Where the chat-platform bridge lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:8798".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_prompt")]
    pub default_prompt: String,
    #[serde(default)]
    pub server_prompts: HashMap<String, String>,
    #[serde(default = "default_context_messages")]
    pub context_messages: usize,
    #[serde(default = "default_true")]
    pub memory_extraction: bool,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Direct-chat replies between relationship profile refreshes.
    #[serde(default = "default_learning_interval")]
    pub learning_interval: u64,
    #[serde(default = "default_profile_history_limit")]
    pub profile_history_limit: usize,

    #[serde(default)]
    pub delay: DelayConfig,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server_chat: ServerChatConfig,
    #[serde(default)]
    pub gifs: GifConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

fn default_prompt() -> String {
    "You are a regular in this chat. Keep replies short and casual, \
     match the tone of the people you talk to, and never mention being automated."
        .to_string()
}

fn default_context_messages() -> usize {
    20
}

fn default_learning_interval() -> u64 {
    25
}

fn default_profile_history_limit() -> usize {
    100
}

fn default_database_path() -> String {
    "murmur.db".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            default_prompt: default_prompt(),
            server_prompts: HashMap::new(),
            context_messages: default_context_messages(),
            memory_extraction: true,
            database_path: default_database_path(),
            learning_interval: default_learning_interval(),
            profile_history_limit: default_profile_history_limit(),
            delay: DelayConfig::default(),
            blacklist: BlacklistConfig::default(),
            llm: LlmConfig::default(),
            server_chat: ServerChatConfig::default(),
            gifs: GifConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl BotConfig {
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `MURMUR_CONFIG` when set, otherwise `murmur_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("MURMUR_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
            _ => Self::get_base_dir().join("murmur_config.toml"),
        }
    }

    pub fn load() -> Self {
        let path = Self::config_path();

        let config = match fs::read_to_string(&path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {:#}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        config.with_env_overrides()
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str::<BotConfig>(contents).context("Invalid murmur config")
    }

    /// Secrets and endpoints are usually injected by the environment rather than the file.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = env::var("OPENROUTER_API_KEY") {
            if !key.trim().is_empty() {
                self.llm.api_key = Some(key.trim().to_string());
            }
        }

        if let Ok(provider) = env::var("MURMUR_LLM_PROVIDER") {
            if !provider.trim().is_empty() {
                self.llm.provider = provider.trim().to_ascii_lowercase();
            }
        }

        if let Ok(model) = env::var("MURMUR_MODEL") {
            if !model.trim().is_empty() {
                self.llm.model = model.trim().to_string();
            }
        }

        if let Ok(url) = env::var("MURMUR_BRIDGE_URL") {
            if !url.trim().is_empty() {
                self.bridge.base_url = url.trim().trim_end_matches('/').to_string();
            }
        }

        if let Ok(token) = env::var("MURMUR_BRIDGE_TOKEN") {
            if !token.trim().is_empty() {
                self.bridge.token = Some(token.trim().to_string());
            }
        }

        if let Ok(path) = env::var("MURMUR_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(enabled) = env::var("MURMUR_ENABLE_DEAD_CHAT") {
            let enabled = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
            self.server_chat.dead_chat.enabled = enabled;
        }

        self
    }

    /// Guild-specific prompt when one is configured, the default prompt otherwise.
    pub fn system_prompt_for(&self, guild_id: Option<&str>) -> &str {
        guild_id
            .and_then(|id| self.server_prompts.get(id))
            .map(String::as_str)
            .unwrap_or(&self.default_prompt)
    }

    pub fn is_blacklisted(&self, author_id: &str, guild_id: Option<&str>) -> bool {
        if self.blacklist.users.iter().any(|id| id == author_id) {
            return true;
        }
        guild_id
            .map(|guild| self.blacklist.servers.iter().any(|id| id == guild))
            .unwrap_or(false)
    }
}

impl ServerChatConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl EngagementConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn max_monitor(&self) -> Duration {
        Duration::from_millis(self.max_monitor_ms)
    }
}

impl DeadChatConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_documented_defaults() {
        let config = BotConfig::parse("").unwrap();
        assert_eq!(config.server_chat.poll_interval_ms, 500);
        assert_eq!(config.server_chat.reading_period.min_ms, 3000);
        assert_eq!(config.server_chat.reading_period.max_ms, 15000);
        assert_eq!(config.server_chat.reading_period.max_extensions, 3);
        assert!(config.server_chat.reading_period.extend_on_activity);
        assert_eq!(config.server_chat.engagement.idle_timeout_ms, 60_000);
        assert_eq!(config.server_chat.engagement.max_replies, 10);
        assert_eq!(config.server_chat.dead_chat.min_bot_messages, 15);
        assert_eq!(config.server_chat.dead_chat.idle_minutes, 30);
        assert!(!config.server_chat.dead_chat.enabled);
        assert_eq!(config.context_messages, 20);
        assert_eq!(config.learning_interval, 25);
        assert_eq!(config.profile_history_limit, 100);
    }

    #[test]
    fn nested_sections_override_defaults() {
        let config = BotConfig::parse(
            r#"
            default_prompt = "be nice"

            [server_prompts]
            "42" = "be terse"

            [server_chat.reading_period]
            min_ms = 1000
            max_ms = 2000

            [server_chat.dead_chat]
            enabled = true
            chance = 1.0

            [[gifs.entries]]
            url = "https://example.test/wave.gif"
            context = "greeting"
            triggers = ["hello"]
            "#,
        )
        .unwrap();

        assert_eq!(config.server_chat.reading_period.min_ms, 1000);
        assert_eq!(config.server_chat.reading_period.max_extensions, 3);
        assert!(config.server_chat.dead_chat.enabled);
        assert_eq!(config.gifs.entries.len(), 1);
        assert_eq!(config.system_prompt_for(Some("42")), "be terse");
        assert_eq!(config.system_prompt_for(Some("7")), "be nice");
        assert_eq!(config.system_prompt_for(None), "be nice");
    }

    #[test]
    fn blacklist_matches_users_and_servers() {
        let mut config = BotConfig::default();
        config.blacklist.users.push("u1".to_string());
        config.blacklist.servers.push("g1".to_string());

        assert!(config.is_blacklisted("u1", None));
        assert!(config.is_blacklisted("u2", Some("g1")));
        assert!(!config.is_blacklisted("u2", Some("g2")));
        assert!(!config.is_blacklisted("u2", None));
    }
}
