//! System-prompt assembly for each kind of reply round.

use chrono::{NaiveDateTime, Timelike};

use crate::message::{ChatRole, ContextMessage};
use crate::llm_client::Message;
use crate::profiles::UserProfile;
use crate::transport::{ChannelInfo, FetchedMessage};

pub const REVIVAL_INSTRUCTION: &str =
    "[The chat has been quiet. Say something to start a conversation.]";

/// A quiet stretch longer than this makes the next direct message a fresh conversation.
const FRESH_CONVERSATION_GAP_MS: i64 = 4 * 60 * 60 * 1000;

/// `Saturday evening, 7:05 PM`
pub fn describe_time(local: NaiveDateTime) -> String {
    let part_of_day = match local.hour() {
        5..=11 => "morning",
        12..=16 => "afternoon",
        17..=20 => "evening",
        _ => "night",
    };
    format!(
        "{} {}, {}",
        local.format("%A"),
        part_of_day,
        local.format("%-I:%M %p")
    )
}

/// `3 hours ago`; `None` under a minute.
pub fn describe_elapsed(elapsed_ms: i64) -> Option<String> {
    let minutes = elapsed_ms / 60_000;
    let hours = elapsed_ms / 3_600_000;
    let days = elapsed_ms / 86_400_000;
    let (n, unit) = match () {
        _ if minutes < 1 => return None,
        _ if minutes < 60 => (minutes, "minute"),
        _ if hours < 24 => (hours, "hour"),
        _ if days < 7 => (days, "day"),
        _ if days < 30 => (days / 7, "week"),
        _ => (days / 30, "month"),
    };
    Some(format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" }))
}

fn participant_line(count: usize) -> String {
    if count == 1 {
        "1 user is talking to you.".to_string()
    } else {
        format!("{} users are talking to you.", count)
    }
}

pub struct ServerPromptParts<'a> {
    pub base_prompt: &'a str,
    pub channel: &'a ChannelInfo,
    pub participant_count: usize,
    pub continuing: bool,
    pub server_stats: &'a str,
    pub participant_notes: &'a [String],
    pub gif_section: &'a str,
    pub time_line: &'a str,
}

pub fn server_round_prompt(parts: &ServerPromptParts<'_>) -> String {
    let mut context = format!("You are in a server chat ({}).\n", parts.channel.display_location());
    context.push_str(&participant_line(parts.participant_count));
    context.push('\n');
    context.push_str("Messages are formatted as [username]: message content.\n");
    if parts.continuing {
        context.push_str("Continue the conversation naturally.");
    } else {
        context.push_str("Respond naturally to the conversation. Address users by name if needed.");
    }
    if !parts.time_line.is_empty() {
        context.push('\n');
        context.push_str(parts.time_line);
    }
    if !parts.server_stats.is_empty() {
        context.push('\n');
        context.push_str(parts.server_stats);
    }
    for note in parts.participant_notes.iter().filter(|n| !n.is_empty()) {
        context.push_str("\n\n");
        context.push_str(note);
    }

    format!(
        "{}\n\n--- Server Context ---\n{}{}",
        parts.base_prompt, context, parts.gif_section
    )
}

pub fn revival_prompt(
    base_prompt: &str,
    channel: &ChannelInfo,
    server_stats: &str,
    active_people: &[String],
) -> String {
    let mut lines = vec![
        format!("You're in {}.", channel.display_location()),
        "The chat has been dead for a while and you want to say something.".to_string(),
        "Don't announce that it's been quiet. Just start a conversation naturally.".to_string(),
        "Maybe comment on something, ask a question, share a thought, or bring up something random."
            .to_string(),
    ];
    if !server_stats.is_empty() {
        lines.push(server_stats.to_string());
    }
    if !active_people.is_empty() {
        lines.push(format!("Active people here: {}", active_people.join(", ")));
    }
    format!("{}\n\n--- Context ---\n{}", base_prompt, lines.join("\n"))
}

pub struct DirectPromptParts<'a> {
    pub base_prompt: &'a str,
    pub time_line: &'a str,
    pub last_seen: Option<&'a str>,
    pub fresh_conversation: bool,
    pub memory: &'a str,
    pub profile: Option<&'a UserProfile>,
    pub gif_section: &'a str,
}

pub fn direct_prompt(parts: &DirectPromptParts<'_>) -> String {
    let mut context = vec![parts.time_line.to_string()];
    if let Some(last_seen) = parts.last_seen {
        context.push(format!("Last message from them: {}", last_seen));
    }
    if parts.fresh_conversation {
        context.push("(Starting fresh conversation)".to_string());
    }

    let mut prompt = format!("{}\n\n--- Context ---\n{}", parts.base_prompt, context.join("\n"));
    if !parts.memory.is_empty() {
        prompt.push_str("\n\n--- Memory ---\n");
        prompt.push_str(parts.memory);
    }
    if let Some(profile) = parts.profile {
        prompt.push_str("\n\n--- Your relationship with this person ---\n");
        prompt.push_str(&profile.render());

        let examples = profile.render_examples();
        if !examples.is_empty() {
            prompt.push_str("\n\n--- Example exchanges ---\n");
            prompt.push_str(&examples);
        }
    }
    prompt.push_str(parts.gif_section);
    prompt
}

/// Short histories and long silences both count as a new conversation.
pub fn is_fresh_conversation(history: &[FetchedMessage], now_ms: i64) -> bool {
    match history.last() {
        _ if history.len() < 3 => true,
        Some(last) => now_ms - last.timestamp_ms > FRESH_CONVERSATION_GAP_MS,
        None => true,
    }
}

pub fn history_messages(history: &[ContextMessage]) -> Vec<Message> {
    history
        .iter()
        .map(|m| Message {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        })
        .collect()
}

/// Channel history as model messages, skipping `exclude_id` (usually the trigger).
pub fn fetched_messages(history: &[FetchedMessage], self_id: &str, exclude_id: Option<&str>) -> Vec<Message> {
    history
        .iter()
        .filter(|m| Some(m.id.as_str()) != exclude_id)
        .map(|m| {
            let role = if m.author_id == self_id {
                ChatRole::Assistant
            } else {
                ChatRole::User
            };
            Message {
                role: role.as_str().to_string(),
                content: m.text.clone(),
            }
        })
        .collect()
}

/// Text of the newest non-assistant line, used for gif keyword matching.
pub fn last_user_text(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::User.as_str())
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{ExampleExchange, ProfileStyle};
    use chrono::NaiveDate;

    fn channel() -> ChannelInfo {
        ChannelInfo {
            channel_id: "c1".to_string(),
            name: "general".to_string(),
            topic: None,
            guild_id: Some("g1".to_string()),
            guild_name: Some("Hangout".to_string()),
        }
    }

    fn fetched(id: &str, author: &str, ts: i64) -> FetchedMessage {
        FetchedMessage {
            id: id.to_string(),
            author_id: author.to_string(),
            author_name: author.to_string(),
            text: format!("text {id}"),
            timestamp_ms: ts,
        }
    }

    #[test]
    fn time_description_buckets() {
        let at = |h, m| {
            NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap()
        };
        assert_eq!(describe_time(at(19, 5)), "Saturday evening, 7:05 PM");
        assert_eq!(describe_time(at(4, 59)), "Saturday night, 4:59 AM");
        assert_eq!(describe_time(at(5, 0)), "Saturday morning, 5:00 AM");
        assert_eq!(describe_time(at(12, 30)), "Saturday afternoon, 12:30 PM");
    }

    #[test]
    fn server_prompt_includes_participants_and_gif_section() {
        let notes = vec!["You've seen alice around".to_string(), String::new()];
        let prompt = server_round_prompt(&ServerPromptParts {
            base_prompt: "be chill",
            channel: &channel(),
            participant_count: 1,
            continuing: false,
            server_stats: "Server vibe: cozy",
            participant_notes: &notes,
            gif_section: "\n\n--- GIF Responses ---\n",
            time_line: "",
        });
        assert!(prompt.starts_with("be chill\n\n--- Server Context ---\n"));
        assert!(prompt.contains("(#general in Hangout)"));
        assert!(prompt.contains("1 user is talking to you."));
        assert!(prompt.contains("Address users by name"));
        assert!(prompt.contains("Server vibe: cozy\n\nYou've seen alice around"));
        assert!(prompt.ends_with("--- GIF Responses ---\n"));

        let prompt = server_round_prompt(&ServerPromptParts {
            base_prompt: "be chill",
            channel: &channel(),
            participant_count: 3,
            continuing: true,
            server_stats: "",
            participant_notes: &[],
            gif_section: "",
            time_line: "Monday morning, 9:00 AM",
        });
        assert!(prompt.contains("3 users are talking to you."));
        assert!(prompt.contains("Continue the conversation naturally.\nMonday morning"));
    }

    #[test]
    fn revival_prompt_mentions_active_people() {
        let prompt = revival_prompt("base", &channel(), "", &["alice".to_string(), "bob".to_string()]);
        assert!(prompt.contains("You're in #general in Hangout."));
        assert!(prompt.ends_with("Active people here: alice, bob"));
    }

    fn direct_parts<'a>(profile: Option<&'a UserProfile>) -> DirectPromptParts<'a> {
        DirectPromptParts {
            base_prompt: "base",
            time_line: "Monday night, 11:00 PM",
            last_seen: None,
            fresh_conversation: true,
            memory: "Facts about them: x",
            profile,
            gif_section: "",
        }
    }

    #[test]
    fn direct_prompt_sections() {
        assert_eq!(
            direct_prompt(&direct_parts(None)),
            "base\n\n--- Context ---\nMonday night, 11:00 PM\n(Starting fresh conversation)\n\n--- Memory ---\nFacts about them: x"
        );
    }

    #[test]
    fn direct_prompt_with_profile_and_last_seen() {
        let profile = UserProfile {
            summary: "Old friends.".to_string(),
            style: ProfileStyle::default(),
            patterns: Vec::new(),
            relationship: "friend".to_string(),
            examples: vec![ExampleExchange {
                them: Some("sup".to_string()),
                you: "nm".to_string(),
            }],
            created_ms: 0,
            updated_ms: 0,
            interactions: 0,
            last_seen_ms: 0,
        };
        let mut parts = direct_parts(Some(&profile));
        parts.last_seen = Some("2 days ago");
        parts.fresh_conversation = false;

        assert_eq!(
            direct_prompt(&parts),
            "base\n\n--- Context ---\nMonday night, 11:00 PM\nLast message from them: 2 days ago\n\n\
             --- Memory ---\nFacts about them: x\n\n\
             --- Your relationship with this person ---\nOld friends.\n\
             Communication style: casual, occasional humor, light emoji use, short messages\n\
             Relationship: friend\n\n\
             --- Example exchanges ---\nThem: sup\nYou: nm\n\n"
        );
    }

    #[test]
    fn elapsed_time_wording() {
        let minute = 60_000;
        assert_eq!(describe_elapsed(59_999), None);
        assert_eq!(describe_elapsed(minute).as_deref(), Some("1 minute ago"));
        assert_eq!(describe_elapsed(59 * minute).as_deref(), Some("59 minutes ago"));
        assert_eq!(describe_elapsed(60 * minute).as_deref(), Some("1 hour ago"));
        assert_eq!(describe_elapsed(3 * 24 * 60 * minute).as_deref(), Some("3 days ago"));
        assert_eq!(describe_elapsed(14 * 24 * 60 * minute).as_deref(), Some("2 weeks ago"));
        assert_eq!(describe_elapsed(65 * 24 * 60 * minute).as_deref(), Some("2 months ago"));
    }

    #[test]
    fn fresh_conversation_detection() {
        let hour = 60 * 60 * 1000;
        let history = vec![fetched("a", "u", 0), fetched("b", "u", hour), fetched("c", "u", 2 * hour)];
        assert!(!is_fresh_conversation(&history, 3 * hour));
        assert!(is_fresh_conversation(&history, 7 * hour));
        assert!(is_fresh_conversation(&history[..2], 2 * hour));
        assert!(is_fresh_conversation(&[], 0));
    }

    #[test]
    fn fetched_history_roles_and_exclusion() {
        let history = vec![fetched("a", "bot", 1), fetched("b", "alice", 2), fetched("t", "alice", 3)];
        let messages = fetched_messages(&history, "bot", Some("t"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "assistant");
        assert_eq!(messages[1].role, "user");
        assert_eq!(last_user_text(&messages), "text b");
    }
}
