//! Per-server activity statistics persisted in SQLite.
//!
//! The inbound router writes user activity, the responder writes bot activity,
//! and the dead-channel scanner reads channel activity back.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

const MAX_NOTABLE_MESSAGES: usize = 20;
const NOTABLE_MIN_CHARS: usize = 20;
const NOTABLE_MAX_CHARS: usize = 500;
const NOTABLE_STORED_CHARS: usize = 300;

pub struct StatsDatabase {
    conn: Mutex<Connection>,
}

/// One user-authored guild message, as recorded by the inbound router.
#[derive(Debug, Clone)]
pub struct UserActivity<'a> {
    pub server_id: &'a str,
    pub server_name: &'a str,
    pub channel_id: &'a str,
    pub user_id: &'a str,
    pub username: &'a str,
    pub content: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelActivity {
    pub server_id: String,
    pub server_name: String,
    pub channel_id: String,
    pub last_message_ms: Option<i64>,
    pub message_count: u64,
    pub bot_messages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub messages_sent: u64,
    pub last_active: Option<String>,
    pub last_bot_message: Option<String>,
    pub vibes: Option<String>,
    pub topics: Vec<String>,
    pub user_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerUser {
    pub username: String,
    pub message_count: u64,
    pub last_seen: Option<String>,
    pub notable_messages: Vec<String>,
}

fn iso_from_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339()
}

fn mention_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"<[@#]\d+>").ok())
        .as_ref()
}

/// Messages worth quoting back later: mid-length prose that is not mostly mentions.
pub fn is_notable_message(content: &str) -> bool {
    let len = content.chars().count();
    if len <= NOTABLE_MIN_CHARS || len >= NOTABLE_MAX_CHARS || content.starts_with('<') {
        return false;
    }
    let tags = mention_pattern()
        .map(|re| re.find_iter(content).count())
        .unwrap_or(0);
    tags < 2
}

impl StatsDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Stats database lock poisoned: {}", e))
    }

    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open stats database at {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                messages_sent INTEGER NOT NULL DEFAULT 0,
                last_active TEXT,
                last_bot_message TEXT,
                vibes TEXT,
                topics TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS server_users (
                server_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                username TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                last_seen TEXT,
                PRIMARY KEY (server_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS notable_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_notable_messages_user
                ON notable_messages (server_id, user_id, id);

            CREATE TABLE IF NOT EXISTS channel_activity (
                server_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                last_message_ms INTEGER,
                message_count INTEGER NOT NULL DEFAULT 0,
                bot_messages INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (server_id, channel_id)
            );"#,
        )
        .context("Failed to create stats schema")?;
        Ok(())
    }

    fn ensure_server(conn: &Connection, server_id: &str, server_name: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO servers (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                name = CASE WHEN excluded.name = '' THEN servers.name ELSE excluded.name END",
            params![server_id, server_name],
        )?;
        Ok(())
    }

    pub fn track_user_message(&self, activity: &UserActivity<'_>, now_ms: i64) -> Result<()> {
        let now_iso = iso_from_ms(now_ms);
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        Self::ensure_server(&tx, activity.server_id, activity.server_name)?;

        tx.execute(
            "INSERT INTO server_users (server_id, user_id, username, message_count, last_seen)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(server_id, user_id) DO UPDATE SET
                username = excluded.username,
                message_count = message_count + 1,
                last_seen = excluded.last_seen",
            params![activity.server_id, activity.user_id, activity.username, now_iso],
        )?;

        if is_notable_message(activity.content) {
            let stored: String = activity.content.chars().take(NOTABLE_STORED_CHARS).collect();
            tx.execute(
                "INSERT INTO notable_messages (server_id, user_id, content, timestamp_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![activity.server_id, activity.user_id, stored, now_ms],
            )?;
            tx.execute(
                "DELETE FROM notable_messages
                 WHERE server_id = ?1 AND user_id = ?2 AND id NOT IN (
                    SELECT id FROM notable_messages
                    WHERE server_id = ?1 AND user_id = ?2
                    ORDER BY id DESC LIMIT ?3
                 )",
                params![
                    activity.server_id,
                    activity.user_id,
                    MAX_NOTABLE_MESSAGES as i64
                ],
            )?;
        }

        tx.execute(
            "UPDATE servers SET last_active = ?2 WHERE id = ?1",
            params![activity.server_id, now_iso],
        )?;

        tx.execute(
            "INSERT INTO channel_activity (server_id, channel_id, last_message_ms, message_count)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(server_id, channel_id) DO UPDATE SET
                last_message_ms = excluded.last_message_ms,
                message_count = message_count + 1",
            params![activity.server_id, activity.channel_id, now_ms],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Bot messages do not touch `last_message_ms`; a channel only the bot
    /// talks in still counts as quiet.
    pub fn track_bot_message(
        &self,
        server_id: &str,
        server_name: &str,
        channel_id: &str,
        now_ms: i64,
    ) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        Self::ensure_server(&tx, server_id, server_name)?;
        tx.execute(
            "UPDATE servers SET messages_sent = messages_sent + 1, last_bot_message = ?2
             WHERE id = ?1",
            params![server_id, iso_from_ms(now_ms)],
        )?;
        tx.execute(
            "INSERT INTO channel_activity (server_id, channel_id, bot_messages)
             VALUES (?1, ?2, 1)
             ON CONFLICT(server_id, channel_id) DO UPDATE SET
                bot_messages = bot_messages + 1",
            params![server_id, channel_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn channel_activity(&self) -> Result<Vec<ChannelActivity>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.server_id, COALESCE(s.name, ''), c.channel_id, c.last_message_ms,
                    c.message_count, c.bot_messages
             FROM channel_activity c
             LEFT JOIN servers s ON s.id = c.server_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ChannelActivity {
                    server_id: row.get(0)?,
                    server_name: row.get(1)?,
                    channel_id: row.get(2)?,
                    last_message_ms: row.get(3)?,
                    message_count: row.get::<_, i64>(4)? as u64,
                    bot_messages: row.get::<_, i64>(5)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn server_summary(&self, server_id: &str) -> Result<Option<ServerSummary>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, messages_sent, last_active, last_bot_message, vibes, topics,
                        (SELECT COUNT(*) FROM server_users u WHERE u.server_id = servers.id)
                 FROM servers WHERE id = ?1",
                [server_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(
            |(id, name, sent, last_active, last_bot, vibes, topics_json, users)| {
                let topics = serde_json::from_str(&topics_json).unwrap_or_else(|e| {
                    tracing::warn!("Discarding malformed topics for server {}: {}", id, e);
                    Vec::new()
                });
                ServerSummary {
                    id,
                    name,
                    messages_sent: sent as u64,
                    last_active,
                    last_bot_message: last_bot,
                    vibes: vibes.filter(|v| !v.trim().is_empty()),
                    topics,
                    user_count: users as u64,
                }
            },
        ))
    }

    pub fn server_user(&self, server_id: &str, user_id: &str) -> Result<Option<ServerUser>> {
        let conn = self.lock_conn()?;
        let user = conn
            .query_row(
                "SELECT username, message_count, last_seen FROM server_users
                 WHERE server_id = ?1 AND user_id = ?2",
                params![server_id, user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((username, message_count, last_seen)) = user else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT content FROM notable_messages
             WHERE server_id = ?1 AND user_id = ?2
             ORDER BY id ASC",
        )?;
        let notable_messages = stmt
            .query_map(params![server_id, user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(ServerUser {
            username,
            message_count: message_count as u64,
            last_seen,
            notable_messages,
        }))
    }

    /// Usernames of people with more than `min_messages` messages in the server.
    pub fn active_usernames(&self, server_id: &str, min_messages: u64, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT username FROM server_users
             WHERE server_id = ?1 AND message_count > ?2
             ORDER BY message_count DESC
             LIMIT ?3",
        )?;
        let names = stmt
            .query_map(
                params![server_id, min_messages as i64, limit as i64],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Prompt lines describing the server as a whole; empty when nothing is known.
    pub fn server_context_string(&self, server_id: &str) -> Result<String> {
        let Some(server) = self.server_summary(server_id)? else {
            return Ok(String::new());
        };

        let mut parts = Vec::new();
        if let Some(vibes) = &server.vibes {
            parts.push(format!("Server vibe: {}", vibes));
        }
        if !server.topics.is_empty() {
            parts.push(format!("Common topics: {}", server.topics.join(", ")));
        }
        if server.messages_sent > 0 {
            parts.push(format!("You've sent {} messages here", server.messages_sent));
        }
        Ok(parts.join("\n"))
    }

    /// Prompt lines about one participant: how familiar they are and what they said lately.
    pub fn user_context_string(&self, server_id: &str, user_id: &str) -> Result<String> {
        let Some(user) = self.server_user(server_id, user_id)? else {
            return Ok(String::new());
        };

        let mut parts = Vec::new();
        if user.message_count > 10 {
            parts.push(format!(
                "You've seen {} around ({} messages in this server)",
                user.username, user.message_count
            ));
        }
        if !user.notable_messages.is_empty() {
            parts.push("Things they've said recently:".to_string());
            let skip = user.notable_messages.len().saturating_sub(5);
            for msg in &user.notable_messages[skip..] {
                parts.push(format!("- \"{}\"", msg));
            }
        }
        Ok(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, StatsDatabase) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = StatsDatabase::new(dir.path().join("stats.db")).expect("db init");
        (dir, db)
    }

    fn activity<'a>(user: &'a str, channel: &'a str, content: &'a str) -> UserActivity<'a> {
        UserActivity {
            server_id: "g1",
            server_name: "Hangout",
            channel_id: channel,
            user_id: user,
            username: user,
            content,
        }
    }

    #[test]
    fn notable_message_filter() {
        assert!(!is_notable_message("too short"));
        assert!(is_notable_message("this is a perfectly ordinary sentence"));
        assert!(!is_notable_message("<@123> this starts with a mention tag"));
        assert!(!is_notable_message("hey <@123> and <#456> look at this thing"));
        assert!(is_notable_message("hey <@123> look at this thing right here"));
        assert!(!is_notable_message(&"x".repeat(500)));
    }

    #[test]
    fn user_and_bot_activity_accumulate_per_channel() {
        let (_dir, db) = open_temp();

        db.track_user_message(&activity("alice", "c1", "hi"), 1_000).unwrap();
        db.track_user_message(&activity("bob", "c1", "hey"), 2_000).unwrap();
        db.track_bot_message("g1", "Hangout", "c1", 3_000).unwrap();
        db.track_bot_message("g1", "Hangout", "c2", 4_000).unwrap();

        let mut rows = db.channel_activity().unwrap();
        rows.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].channel_id, "c1");
        assert_eq!(rows[0].message_count, 2);
        assert_eq!(rows[0].bot_messages, 1);
        assert_eq!(rows[0].last_message_ms, Some(2_000));
        assert_eq!(rows[0].server_name, "Hangout");
        assert_eq!(rows[1].last_message_ms, None);
        assert_eq!(rows[1].bot_messages, 1);

        let summary = db.server_summary("g1").unwrap().expect("server exists");
        assert_eq!(summary.messages_sent, 2);
        assert_eq!(summary.user_count, 2);
        assert!(summary.last_bot_message.is_some());
    }

    #[test]
    fn notable_messages_are_capped_and_truncated() {
        let (_dir, db) = open_temp();
        for n in 0..25 {
            let content = format!("message number {n} with enough words to count");
            db.track_user_message(&activity("alice", "c1", &content), n).unwrap();
        }
        let long = "y".repeat(450);
        db.track_user_message(&activity("alice", "c1", &long), 99).unwrap();

        let user = db.server_user("g1", "alice").unwrap().unwrap();
        assert_eq!(user.message_count, 26);
        assert_eq!(user.notable_messages.len(), MAX_NOTABLE_MESSAGES);
        assert_eq!(user.notable_messages.last().unwrap().chars().count(), 300);
        assert!(user.notable_messages[0].starts_with("message number 6 "));
    }

    #[test]
    fn context_strings_render_known_facts_only() {
        let (_dir, db) = open_temp();
        assert_eq!(db.server_context_string("g1").unwrap(), "");
        assert_eq!(db.user_context_string("g1", "alice").unwrap(), "");

        for n in 0..11 {
            db.track_user_message(&activity("alice", "c1", "ok"), n).unwrap();
        }
        db.track_user_message(
            &activity("alice", "c1", "I just adopted a very loud parrot"),
            20,
        )
        .unwrap();
        db.track_bot_message("g1", "Hangout", "c1", 30).unwrap();
        {
            let conn = db.lock_conn().unwrap();
            conn.execute(
                "UPDATE servers SET vibes = 'chill', topics = '[\"birds\",\"games\"]' WHERE id = 'g1'",
                [],
            )
            .unwrap();
        }

        let server = db.server_context_string("g1").unwrap();
        assert_eq!(
            server,
            "Server vibe: chill\nCommon topics: birds, games\nYou've sent 1 messages here"
        );

        let user = db.user_context_string("g1", "alice").unwrap();
        assert!(user.starts_with("You've seen alice around (12 messages in this server)"));
        assert!(user.contains("- \"I just adopted a very loud parrot\""));

        assert_eq!(db.active_usernames("g1", 5, 5).unwrap(), vec!["alice".to_string()]);
    }
}
