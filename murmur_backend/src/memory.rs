//! Long-term memory for direct conversations: facts and topics about each
//! person, plus facts the bot has revealed about itself.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Deserialize;
use std::path::Path;
use std::sync::Mutex;

use crate::llm_client::{parse_json_reply, ChatModel, Message};

const MAX_USER_FACTS: usize = 50;
const MAX_USER_TOPICS: usize = 30;
const MAX_SELF_FACTS: usize = 30;

const EXTRACTION_PROMPT: &str = r#"Analyze this conversation and extract any new information worth remembering.

Return ONLY a JSON object with this structure (no other text):
{
  "theirFacts": ["fact about them"],
  "yourFacts": ["fact you revealed about yourself"],
  "topics": [{"topic": "topic name", "note": "brief note"}]
}

Rules:
- Only include concrete, specific facts (names, places, jobs, pets, hobbies, preferences)
- Don't include opinions or temporary states
- Keep facts short (under 10 words each)
- Topics should be things worth remembering for future conversations
- Return empty arrays if nothing notable was shared
- ONLY return the JSON, no explanation"#;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedMemory {
    #[serde(default)]
    pub their_facts: Vec<String>,
    #[serde(default)]
    pub your_facts: Vec<String>,
    #[serde(default)]
    pub topics: Vec<ExtractedTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExtractedTopic {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMemory {
    pub topic: String,
    pub note: Option<String>,
    pub last: String,
}

pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory database lock poisoned: {}", e))
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open memory database at {:?}", path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS user_facts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                fact TEXT NOT NULL,
                learned_on TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_topics (
                user_id TEXT NOT NULL,
                topic_key TEXT NOT NULL,
                topic TEXT NOT NULL,
                note TEXT,
                last TEXT NOT NULL,
                PRIMARY KEY (user_id, topic_key)
            );

            CREATE TABLE IF NOT EXISTS self_facts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fact TEXT NOT NULL,
                learned_on TEXT NOT NULL
            );"#,
        )
        .context("Failed to create memory schema")?;
        Ok(())
    }

    fn is_duplicate_fact(existing: &[String], fact: &str) -> bool {
        let fact = fact.to_lowercase();
        existing.iter().any(|known| {
            let known = known.to_lowercase();
            known.contains(&fact) || fact.contains(&known)
        })
    }

    pub fn user_facts(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT fact FROM user_facts WHERE user_id = ?1 ORDER BY id ASC")?;
        let facts = stmt
            .query_map([user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(facts)
    }

    pub fn self_facts(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT fact FROM self_facts ORDER BY id ASC")?;
        let facts = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(facts)
    }

    /// Most recently discussed first.
    pub fn user_topics(&self, user_id: &str) -> Result<Vec<TopicMemory>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT topic, note, last FROM user_topics WHERE user_id = ?1
             ORDER BY last DESC, rowid DESC",
        )?;
        let topics = stmt
            .query_map([user_id], |row| {
                Ok(TopicMemory {
                    topic: row.get(0)?,
                    note: row.get(1)?,
                    last: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(topics)
    }

    /// Returns false when an existing fact already covers this one (or vice versa).
    pub fn add_user_fact(&self, user_id: &str, fact: &str, today: NaiveDate) -> Result<bool> {
        let existing = self.user_facts(user_id)?;
        if Self::is_duplicate_fact(&existing, fact) {
            return Ok(false);
        }

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO user_facts (user_id, fact, learned_on) VALUES (?1, ?2, ?3)",
            params![user_id, fact, today.to_string()],
        )?;
        conn.execute(
            "DELETE FROM user_facts WHERE user_id = ?1 AND id NOT IN (
                SELECT id FROM user_facts WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![user_id, MAX_USER_FACTS as i64],
        )?;
        Ok(true)
    }

    pub fn add_self_fact(&self, fact: &str, today: NaiveDate) -> Result<bool> {
        let existing = self.self_facts()?;
        if Self::is_duplicate_fact(&existing, fact) {
            return Ok(false);
        }

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO self_facts (fact, learned_on) VALUES (?1, ?2)",
            params![fact, today.to_string()],
        )?;
        conn.execute(
            "DELETE FROM self_facts WHERE id NOT IN (
                SELECT id FROM self_facts ORDER BY id DESC LIMIT ?1
             )",
            params![MAX_SELF_FACTS as i64],
        )?;
        Ok(true)
    }

    /// Topics match case-insensitively; a repeat refreshes the date and, when
    /// given, the note.
    pub fn add_user_topic(
        &self,
        user_id: &str,
        topic: &str,
        note: Option<&str>,
        today: NaiveDate,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO user_topics (user_id, topic_key, topic, note, last)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, topic_key) DO UPDATE SET
                last = excluded.last,
                note = COALESCE(excluded.note, user_topics.note)",
            params![
                user_id,
                topic.to_lowercase(),
                topic,
                note,
                today.to_string()
            ],
        )?;
        conn.execute(
            "DELETE FROM user_topics WHERE user_id = ?1 AND rowid NOT IN (
                SELECT rowid FROM user_topics WHERE user_id = ?1
                ORDER BY last DESC, rowid DESC LIMIT ?2
             )",
            params![user_id, MAX_USER_TOPICS as i64],
        )?;
        Ok(())
    }

    pub fn apply_extraction(
        &self,
        user_id: &str,
        extracted: &ExtractedMemory,
        today: NaiveDate,
    ) -> Result<()> {
        for fact in extracted.their_facts.iter().map(|f| f.trim()) {
            if !fact.is_empty() {
                self.add_user_fact(user_id, fact, today)?;
            }
        }
        for fact in extracted.your_facts.iter().map(|f| f.trim()) {
            if !fact.is_empty() {
                self.add_self_fact(fact, today)?;
            }
        }
        for topic in &extracted.topics {
            let name = topic.topic.trim();
            if !name.is_empty() {
                let note = topic.note.as_deref().filter(|n| !n.trim().is_empty());
                self.add_user_topic(user_id, name, note, today)?;
            }
        }
        Ok(())
    }

    /// Prompt block with what we remember about this person and ourselves.
    pub fn memory_string(&self, user_id: &str) -> Result<String> {
        let mut parts = Vec::new();

        let facts = self.user_facts(user_id)?;
        if !facts.is_empty() {
            let skip = facts.len().saturating_sub(10);
            parts.push(format!("Facts about them: {}", facts[skip..].join(", ")));
        }

        let topics = self.user_topics(user_id)?;
        if !topics.is_empty() {
            let rendered: Vec<String> = topics
                .iter()
                .take(5)
                .map(|t| match &t.note {
                    Some(note) => format!("{} ({})", t.topic, note),
                    None => t.topic.clone(),
                })
                .collect();
            parts.push(format!("Recent topics: {}", rendered.join(", ")));
        }

        let own = self.self_facts()?;
        if !own.is_empty() {
            let skip = own.len().saturating_sub(10);
            parts.push(format!("About you: {}", own[skip..].join(", ")));
        }

        Ok(parts.join("\n"))
    }

    /// Asks the model what was worth remembering from a direct exchange and
    /// stores it. Malformed model output is logged and dropped.
    pub async fn extract_from_exchange(
        &self,
        model: &dyn ChatModel,
        user_id: &str,
        exchange: &[Message],
        today: NaiveDate,
    ) -> Result<Option<ExtractedMemory>> {
        let transcript = exchange
            .iter()
            .map(|m| {
                let speaker = if m.role == "user" { "Them" } else { "You" };
                format!("{}: {}", speaker, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let reply = model
            .complete(EXTRACTION_PROMPT, &[Message::user(transcript)])
            .await?;
        if reply.trim().is_empty() {
            return Ok(None);
        }

        let extracted: ExtractedMemory = match parse_json_reply(&reply) {
            Ok(extracted) => extracted,
            Err(e) => {
                tracing::debug!("Ignoring unparseable memory extraction for {}: {:#}", user_id, e);
                return Ok(None);
            }
        };

        self.apply_extraction(user_id, &extracted, today)?;
        Ok(Some(extracted))
    }
}
