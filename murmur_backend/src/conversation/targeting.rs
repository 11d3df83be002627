//! Read-side helpers over a conversation's buffered messages: which message a
//! reply should be threaded onto, and the role-tagged history handed to the
//! responder.

use serde::Serialize;

use crate::message::{ChatRole, ContextMessage, MessageSnapshot};

/// Ordered history plus participant metadata for one conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub guild_id: Option<String>,
    pub messages: Vec<ContextMessage>,
    pub participants: Vec<String>,
    pub initiator_id: String,
    pub trigger_message_id: String,
    pub last_response_at_ms: Option<i64>,
    pub reply_target: String,
}

/// Picks the message a reply should point at, among messages newer than the last
/// reply: a direct mention first, then the conversation starter, then anyone,
/// then the trigger itself.
pub fn select_reply_target(
    buffer: &[MessageSnapshot],
    trigger: &MessageSnapshot,
    initiator_id: &str,
    last_response_at_ms: Option<i64>,
    self_id: &str,
) -> String {
    let since = last_response_at_ms.unwrap_or(0);
    let mut recent: Vec<&MessageSnapshot> = buffer
        .iter()
        .filter(|msg| msg.timestamp_ms > since)
        .collect();
    // Stable sort keeps arrival order as the tie-breaker; reverse gives newest first.
    recent.sort_by_key(|msg| msg.timestamp_ms);
    recent.reverse();

    let not_self = |msg: &&&MessageSnapshot| msg.author_id != self_id;

    if let Some(msg) = recent.iter().filter(not_self).find(|msg| msg.mentions(self_id)) {
        return msg.id.clone();
    }

    if let Some(msg) = recent
        .iter()
        .filter(not_self)
        .find(|msg| msg.author_id == initiator_id)
    {
        return msg.id.clone();
    }

    if let Some(msg) = recent.iter().find(not_self) {
        return msg.id.clone();
    }

    trigger.id.clone()
}

/// Buffer in timestamp order, tagged `assistant` for our own lines and rendered
/// as `[name]: text` so the model can tell speakers apart.
pub fn build_history(buffer: &[MessageSnapshot], self_id: &str) -> Vec<ContextMessage> {
    let mut sorted: Vec<&MessageSnapshot> = buffer.iter().collect();
    sorted.sort_by_key(|msg| msg.timestamp_ms);

    sorted
        .into_iter()
        .map(|msg| ContextMessage {
            role: if msg.author_id == self_id {
                ChatRole::Assistant
            } else {
                ChatRole::User
            },
            content: format!("[{}]: {}", msg.author_name, msg.text),
            author_id: msg.author_id.clone(),
            author_name: msg.author_name.clone(),
            message_id: msg.id.clone(),
            timestamp_ms: msg.timestamp_ms,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF_ID: &str = "bot";

    fn snapshot(id: &str, author: &str, ts: i64, mentions: &[&str]) -> MessageSnapshot {
        MessageSnapshot {
            id: id.to_string(),
            author_id: author.to_string(),
            author_name: format!("{author}-name"),
            text: format!("text of {id}"),
            timestamp_ms: ts,
            mentions: mentions.iter().map(|m| m.to_string()).collect(),
            reply_to: None,
        }
    }

    fn without(buffer: &[MessageSnapshot], ids: &[&str]) -> Vec<MessageSnapshot> {
        buffer
            .iter()
            .filter(|msg| !ids.contains(&msg.id.as_str()))
            .cloned()
            .collect()
    }

    #[test]
    fn reply_target_priority_order() {
        let trigger = snapshot("T", "starter", 0, &[SELF_ID]);
        let buffer = vec![
            snapshot("M1", "someone", 3, &[SELF_ID]),
            snapshot("M2", "starter", 2, &[]),
            snapshot("M3", "other", 1, &[]),
        ];

        let pick = |buf: &[MessageSnapshot]| {
            select_reply_target(buf, &trigger, "starter", None, SELF_ID)
        };

        assert_eq!(pick(&buffer), "M1");
        assert_eq!(pick(&without(&buffer, &["M1"])), "M2");
        assert_eq!(pick(&without(&buffer, &["M1", "M2"])), "M3");
        assert_eq!(pick(&without(&buffer, &["M1", "M2", "M3"])), "T");
    }

    #[test]
    fn reply_target_ignores_messages_before_last_response() {
        let trigger = snapshot("T", "starter", 0, &[]);
        let buffer = vec![
            snapshot("old-mention", "someone", 5, &[SELF_ID]),
            snapshot("fresh", "other", 20, &[]),
        ];

        let target = select_reply_target(&buffer, &trigger, "starter", Some(10), SELF_ID);
        assert_eq!(target, "fresh");

        let target = select_reply_target(&buffer, &trigger, "starter", Some(30), SELF_ID);
        assert_eq!(target, "T");
    }

    #[test]
    fn reply_target_never_points_at_own_message() {
        let trigger = snapshot("T", "starter", 0, &[]);
        let buffer = vec![snapshot("mine", SELF_ID, 9, &[SELF_ID])];
        let target = select_reply_target(&buffer, &trigger, "starter", None, SELF_ID);
        assert_eq!(target, "T");
    }

    #[test]
    fn history_is_time_ordered_and_role_tagged() {
        let buffer = vec![
            snapshot("b", "alice", 20, &[]),
            snapshot("a", SELF_ID, 10, &[]),
        ];
        let history = build_history(&buffer, SELF_ID);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message_id, "a");
        assert_eq!(history[0].role, ChatRole::Assistant);
        assert_eq!(history[1].role, ChatRole::User);
        assert_eq!(history[1].content, "[alice-name]: text of b");
    }
}
