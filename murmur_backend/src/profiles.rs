//! Relationship profiles for direct chats. The model reads a person's
//! message history once to describe how the bot talks with them, and the
//! profile is refreshed every `learning_interval` replies after that.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::llm_client::{parse_json_reply, ChatModel, Message};
use crate::transport::FetchedMessage;

const MIN_LEARN_HISTORY: usize = 5;
const MIN_UPDATE_HISTORY: usize = 10;
const MAX_EXAMPLES: usize = 25;
const MAX_NEW_EXAMPLES: usize = 10;
const MAX_PATTERNS: usize = 15;
/// Example exchanges shown in a direct-chat prompt.
const PROMPT_EXAMPLES: usize = 10;
/// How far past one of their messages to look for our answer.
const ANSWER_LOOKAHEAD: usize = 3;

const ANALYSIS_PROMPT: &str = r#"Analyze this conversation between "You" and "Them". Return ONLY a JSON object with this structure (no other text):

{
  "summary": "2-3 sentence description of the relationship, dynamic, and typical tone",
  "style": {
    "formality": "casual/neutral/formal",
    "humor": "frequent/occasional/rare/none",
    "emoji": "heavy/light/none",
    "length": "short/medium/long"
  },
  "patterns": ["common phrases or words you use with them"],
  "relationship": "close friend/friend/acquaintance/coworker/family/romantic/other"
}

Base your analysis on the actual conversation content. Only include patterns that appear multiple times."#;

const UPDATE_INSTRUCTION: &str = "Update the profile based on the recent conversation.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStyle {
    #[serde(default = "default_formality")]
    pub formality: String,
    #[serde(default = "default_humor")]
    pub humor: String,
    #[serde(default = "default_emoji")]
    pub emoji: String,
    #[serde(default = "default_length")]
    pub length: String,
}

fn default_formality() -> String {
    "casual".to_string()
}

fn default_humor() -> String {
    "occasional".to_string()
}

fn default_emoji() -> String {
    "light".to_string()
}

fn default_length() -> String {
    "short".to_string()
}

impl Default for ProfileStyle {
    fn default() -> Self {
        Self {
            formality: default_formality(),
            humor: default_humor(),
            emoji: default_emoji(),
            length: default_length(),
        }
    }
}

/// One of their lines and how we answered it. `them` is empty when the
/// history had too few back-and-forths and only our own lines were kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleExchange {
    #[serde(default)]
    pub them: Option<String>,
    pub you: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub summary: String,
    pub style: ProfileStyle,
    pub patterns: Vec<String>,
    pub relationship: String,
    pub examples: Vec<ExampleExchange>,
    pub created_ms: i64,
    pub updated_ms: i64,
    pub interactions: u64,
    pub last_seen_ms: i64,
}

impl UserProfile {
    /// Prompt block describing the relationship.
    pub fn render(&self) -> String {
        let mut parts = vec![self.summary.clone()];

        let mut style = Vec::new();
        if !self.style.formality.is_empty() {
            style.push(self.style.formality.clone());
        }
        if !self.style.humor.is_empty() && self.style.humor != "none" {
            style.push(format!("{} humor", self.style.humor));
        }
        if !self.style.emoji.is_empty() && self.style.emoji != "none" {
            style.push(format!("{} emoji use", self.style.emoji));
        }
        if !self.style.length.is_empty() {
            style.push(format!("{} messages", self.style.length));
        }
        if !style.is_empty() {
            parts.push(format!("Communication style: {}", style.join(", ")));
        }

        if !self.patterns.is_empty() {
            parts.push(format!("Common phrases you use: {}", self.patterns.join(", ")));
        }
        if !self.relationship.is_empty() {
            parts.push(format!("Relationship: {}", self.relationship));
        }

        parts.join("\n")
    }

    pub fn render_examples(&self) -> String {
        self.examples
            .iter()
            .take(PROMPT_EXAMPLES)
            .map(|ex| match &ex.them {
                Some(them) => format!("Them: {}\nYou: {}\n\n", them, ex.you),
                None => format!("You: {}\n\n", ex.you),
            })
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProfileAnalysis {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    style: Option<ProfileStyle>,
    #[serde(default)]
    patterns: Option<Vec<String>>,
    #[serde(default)]
    relationship: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Serialize)]
struct ProfileView<'a> {
    summary: &'a str,
    style: &'a ProfileStyle,
    patterns: &'a [String],
    relationship: &'a str,
}

struct HistoryDigest {
    transcript: String,
    examples: Vec<ExampleExchange>,
    own_lines: Vec<String>,
}

/// Walks a direct-chat history oldest first and pulls out a You/Them
/// transcript plus example exchanges.
fn digest_history(
    history: &[FetchedMessage],
    user_id: &str,
    self_id: &str,
    max_examples: usize,
) -> HistoryDigest {
    let mut digest = HistoryDigest {
        transcript: String::new(),
        examples: Vec::new(),
        own_lines: Vec::new(),
    };

    for (i, message) in history.iter().enumerate() {
        let content = message.text.trim();
        if content.is_empty() {
            continue;
        }
        let ours = message.author_id == self_id;
        digest
            .transcript
            .push_str(&format!("{}: {}\n", if ours { "You" } else { "Them" }, content));

        if ours && content.chars().count() > 5 {
            digest.own_lines.push(content.to_string());
        }

        if digest.examples.len() < max_examples
            && message.author_id == user_id
            && content.chars().count() > 3
        {
            let answer = history[i + 1..]
                .iter()
                .take(ANSWER_LOOKAHEAD)
                .find(|next| next.author_id == self_id && next.text.trim().chars().count() > 3);
            if let Some(answer) = answer {
                digest.examples.push(ExampleExchange {
                    them: Some(content.to_string()),
                    you: answer.text.trim().to_string(),
                });
            }
        }
    }

    digest
}

pub struct ProfileStore {
    conn: Mutex<Connection>,
    learning_interval: u64,
    interactions: Mutex<HashMap<String, u64>>,
}

impl ProfileStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Profile database lock poisoned: {}", e))
    }

    pub fn new<P: AsRef<Path>>(path: P, learning_interval: u64) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open profile database at {:?}", path))?;
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS user_profiles (
                user_id TEXT PRIMARY KEY,
                summary TEXT NOT NULL,
                relationship TEXT NOT NULL,
                style TEXT NOT NULL,
                patterns TEXT NOT NULL,
                examples TEXT NOT NULL,
                created_ms INTEGER NOT NULL,
                updated_ms INTEGER NOT NULL,
                interactions INTEGER NOT NULL DEFAULT 0,
                last_seen_ms INTEGER NOT NULL
            );"#,
        )
        .context("Failed to create profile schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            learning_interval: learning_interval.max(1),
            interactions: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT summary, relationship, style, patterns, examples,
                        created_ms, updated_ms, interactions, last_seen_ms
                 FROM user_profiles WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((summary, relationship, style, patterns, examples, created, updated, interactions, seen)) =
            row
        else {
            return Ok(None);
        };

        // A damaged JSON column degrades to defaults rather than losing the profile.
        Ok(Some(UserProfile {
            summary,
            relationship,
            style: serde_json::from_str(&style).unwrap_or_default(),
            patterns: serde_json::from_str(&patterns).unwrap_or_default(),
            examples: serde_json::from_str(&examples).unwrap_or_default(),
            created_ms: created,
            updated_ms: updated,
            interactions: interactions.max(0) as u64,
            last_seen_ms: seen,
        }))
    }

    pub fn save(&self, user_id: &str, profile: &UserProfile) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO user_profiles (user_id, summary, relationship, style, patterns, examples,
                                        created_ms, updated_ms, interactions, last_seen_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_id) DO UPDATE SET
                summary = excluded.summary,
                relationship = excluded.relationship,
                style = excluded.style,
                patterns = excluded.patterns,
                examples = excluded.examples,
                updated_ms = excluded.updated_ms,
                interactions = excluded.interactions,
                last_seen_ms = excluded.last_seen_ms",
            params![
                user_id,
                profile.summary,
                profile.relationship,
                serde_json::to_string(&profile.style)?,
                serde_json::to_string(&profile.patterns)?,
                serde_json::to_string(&profile.examples)?,
                profile.created_ms,
                profile.updated_ms,
                profile.interactions as i64,
                profile.last_seen_ms,
            ],
        )?;
        Ok(())
    }

    /// Records that we just talked. No-op for someone without a profile.
    pub fn touch(&self, user_id: &str, now_ms: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE user_profiles SET last_seen_ms = ?2, interactions = interactions + 1
             WHERE user_id = ?1",
            params![user_id, now_ms],
        )?;
        Ok(())
    }

    /// Counts a reply in this process; true on every `learning_interval`th one.
    pub fn track_interaction(&self, user_id: &str) -> bool {
        let mut counts = self.interactions.lock().unwrap_or_else(|e| e.into_inner());
        let count = counts.entry(user_id.to_string()).or_insert(0);
        *count += 1;
        *count % self.learning_interval == 0
    }

    /// Builds a first profile from the chat history. `None` when the history
    /// is too short or the model has nothing to say.
    pub async fn learn(
        &self,
        model: &dyn ChatModel,
        history: &[FetchedMessage],
        user_id: &str,
        self_id: &str,
        now_ms: i64,
    ) -> Result<Option<UserProfile>> {
        if history.len() < MIN_LEARN_HISTORY {
            return Ok(None);
        }

        let digest = digest_history(history, user_id, self_id, MAX_EXAMPLES);
        let mut examples = digest.examples;
        if examples.len() < 2 && !digest.own_lines.is_empty() {
            examples = digest
                .own_lines
                .into_iter()
                .take(MAX_EXAMPLES)
                .map(|you| ExampleExchange { them: None, you })
                .collect();
        }

        let reply = model
            .complete(ANALYSIS_PROMPT, &[Message::user(digest.transcript)])
            .await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Ok(None);
        }

        let analysis = parse_json_reply::<ProfileAnalysis>(reply).unwrap_or_else(|e| {
            tracing::debug!("Profile analysis for {} was not JSON, keeping it as text: {:#}", user_id, e);
            ProfileAnalysis::default()
        });

        let profile = UserProfile {
            summary: non_empty(analysis.summary).unwrap_or_else(|| reply.to_string()),
            style: analysis.style.unwrap_or_default(),
            patterns: analysis.patterns.unwrap_or_default(),
            relationship: non_empty(analysis.relationship).unwrap_or_else(|| "friend".to_string()),
            examples,
            created_ms: now_ms,
            updated_ms: now_ms,
            interactions: 0,
            last_seen_ms: now_ms,
        };
        self.save(user_id, &profile)?;
        tracing::info!("Learned profile for {}", user_id);
        Ok(Some(profile))
    }

    /// Refreshes an existing profile from recent history, or learns one when
    /// there is none yet. Unparseable model output keeps the old profile.
    pub async fn update(
        &self,
        model: &dyn ChatModel,
        history: &[FetchedMessage],
        user_id: &str,
        self_id: &str,
        now_ms: i64,
    ) -> Result<Option<UserProfile>> {
        let Some(existing) = self.get(user_id)? else {
            return self.learn(model, history, user_id, self_id, now_ms).await;
        };
        if history.len() < MIN_UPDATE_HISTORY {
            return Ok(Some(existing));
        }

        let digest = digest_history(history, user_id, self_id, MAX_NEW_EXAMPLES);
        let current = serde_json::to_string_pretty(&ProfileView {
            summary: &existing.summary,
            style: &existing.style,
            patterns: &existing.patterns,
            relationship: &existing.relationship,
        })?;
        let system = format!(
            "Here is the current profile analysis for this person:\n{}\n\n\
             Here is a recent conversation with them:\n{}\n\
             Update the profile based on the new conversation. Return ONLY a JSON object:\n\
             {{\n  \"summary\": \"updated 2-3 sentence summary\",\n  \"style\": {{\n    \
             \"formality\": \"casual/neutral/formal\",\n    \"humor\": \"frequent/occasional/rare/none\",\n    \
             \"emoji\": \"heavy/light/none\",\n    \"length\": \"short/medium/long\"\n  }},\n  \
             \"patterns\": [\"updated common phrases\"],\n  \"relationship\": \"relationship type\"\n}}\n\n\
             Keep existing insights that still apply, but update anything that has changed.",
            current, digest.transcript
        );

        let reply = model
            .complete(&system, &[Message::user(UPDATE_INSTRUCTION)])
            .await?;
        if reply.trim().is_empty() {
            return Ok(Some(existing));
        }
        let updates: ProfileAnalysis = match parse_json_reply(&reply) {
            Ok(updates) => updates,
            Err(e) => {
                tracing::debug!("Ignoring unparseable profile update for {}: {:#}", user_id, e);
                return Ok(Some(existing));
            }
        };

        let mut seen = std::collections::HashSet::new();
        let examples: Vec<ExampleExchange> = digest
            .examples
            .into_iter()
            .chain(existing.examples.iter().cloned())
            .filter(|ex| seen.insert(format!("{}{}", ex.them.as_deref().unwrap_or(""), ex.you)))
            .take(MAX_EXAMPLES)
            .collect();

        let mut seen = std::collections::HashSet::new();
        let patterns: Vec<String> = updates
            .patterns
            .unwrap_or_default()
            .into_iter()
            .chain(existing.patterns.iter().cloned())
            .filter(|p| seen.insert(p.clone()))
            .take(MAX_PATTERNS)
            .collect();

        let profile = UserProfile {
            summary: non_empty(updates.summary).unwrap_or_else(|| existing.summary.clone()),
            style: updates.style.unwrap_or_else(|| existing.style.clone()),
            patterns,
            relationship: non_empty(updates.relationship)
                .unwrap_or_else(|| existing.relationship.clone()),
            examples,
            created_ms: existing.created_ms,
            updated_ms: now_ms,
            interactions: existing.interactions + self.learning_interval,
            last_seen_ms: now_ms,
        };
        self.save(user_id, &profile)?;
        tracing::info!("Updated profile for {}", user_id);
        Ok(Some(profile))
    }
}
