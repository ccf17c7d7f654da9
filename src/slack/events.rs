//! Decoding RTM frames into typed events. The `type` field selects the
//! variant; unknown variants and frames missing required fields decode
//! to `None` and are dropped by the caller, never coerced.

use serde_json::Value;
use tracing::debug;

use crate::slack::{Room, User};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FileInfo {
    pub name: Option<String>,
    pub mimetype: Option<String>,
    #[serde(default)]
    pub size: u64,
    pub url_private: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub channel: String,
    pub user: Option<String>,
    #[serde(default)]
    pub text: String,
    pub ts: String,
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub files: Vec<FileInfo>,
    /// Sent with `/me`; rendered as a CTCP ACTION on IRC.
    #[serde(skip)]
    pub action: bool,
}

#[derive(Debug)]
pub enum RtmEvent {
    Hello,
    Message(MessageEvent),
    MessageChanged {
        channel: String,
        previous: Option<MessageEvent>,
        current: MessageEvent,
    },
    MessageDeleted {
        channel: String,
        deleted_ts: String,
        previous: Option<MessageEvent>,
    },
    BotMessage {
        channel: String,
        ts: String,
        username: String,
        text: String,
    },
    TopicChange {
        channel: String,
        topic: String,
    },
    UserTyping {
        channel: String,
        user: String,
    },
    UserChange {
        user: User,
    },
    TeamJoin {
        user: User,
    },
    /// Slack put us into a room (own action elsewhere, or an invite).
    ChannelJoined {
        room: Room,
    },
    ChannelLeft {
        channel: String,
    },
    /// A room was created, renamed or (un)archived: drop cached state.
    RoomChanged {
        channel: String,
    },
    MemberJoined {
        channel: String,
        user: String,
    },
    MemberLeft {
        channel: String,
        user: String,
    },
    ReactionAdded {
        user: String,
        reaction: String,
        channel: String,
        ts: String,
    },
    PresenceChange {
        user: String,
        presence: String,
    },
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn message_from(value: &Value, channel: &str) -> Option<MessageEvent> {
    let mut message: MessageEvent = serde_json::from_value(value.clone()).ok()?;
    if message.channel.is_empty() {
        message.channel = channel.to_string();
    }
    Some(message)
}

pub fn decode(value: &Value) -> Option<RtmEvent> {
    let kind = value.get("type").and_then(Value::as_str)?;
    let decoded = match kind {
        "hello" => Some(RtmEvent::Hello),
        "message" => decode_message(value),
        "user_typing" => Some(RtmEvent::UserTyping {
            channel: str_field(value, "channel")?,
            user: str_field(value, "user")?,
        }),
        "user_change" => Some(RtmEvent::UserChange {
            user: serde_json::from_value(value.get("user")?.clone()).ok()?,
        }),
        "team_join" => Some(RtmEvent::TeamJoin {
            user: serde_json::from_value(value.get("user")?.clone()).ok()?,
        }),
        "channel_joined" | "group_joined" => Some(RtmEvent::ChannelJoined {
            room: serde_json::from_value(value.get("channel")?.clone()).ok()?,
        }),
        "channel_left" | "group_left" => Some(RtmEvent::ChannelLeft {
            channel: str_field(value, "channel")?,
        }),
        "channel_created" | "channel_rename" | "channel_archive" | "channel_unarchive" => {
            let channel = value.get("channel")?;
            let id = channel
                .as_str()
                .map(str::to_string)
                .or_else(|| str_field(channel, "id"))?;
            Some(RtmEvent::RoomChanged { channel: id })
        }
        "member_joined_channel" => Some(RtmEvent::MemberJoined {
            channel: str_field(value, "channel")?,
            user: str_field(value, "user")?,
        }),
        "member_left_channel" => Some(RtmEvent::MemberLeft {
            channel: str_field(value, "channel")?,
            user: str_field(value, "user")?,
        }),
        "reaction_added" => {
            let item = value.get("item")?;
            Some(RtmEvent::ReactionAdded {
                user: str_field(value, "user")?,
                reaction: str_field(value, "reaction")?,
                channel: str_field(item, "channel")?,
                ts: str_field(item, "ts")?,
            })
        }
        "presence_change" => Some(RtmEvent::PresenceChange {
            user: str_field(value, "user")?,
            presence: str_field(value, "presence")?,
        }),
        other => {
            debug!("dropping unhandled event type {other}");
            None
        }
    };
    if decoded.is_none() {
        debug!("dropping malformed {kind} event");
    }
    decoded
}

fn decode_message(value: &Value) -> Option<RtmEvent> {
    let channel = str_field(value, "channel")?;
    match value.get("subtype").and_then(Value::as_str) {
        None | Some("file_share") | Some("thread_broadcast") => {
            Some(RtmEvent::Message(message_from(value, &channel)?))
        }
        Some("me_message") => {
            let mut message = message_from(value, &channel)?;
            message.action = true;
            Some(RtmEvent::Message(message))
        }
        Some("message_changed") => Some(RtmEvent::MessageChanged {
            current: message_from(value.get("message")?, &channel)?,
            previous: value
                .get("previous_message")
                .and_then(|m| message_from(m, &channel)),
            channel,
        }),
        Some("message_deleted") => Some(RtmEvent::MessageDeleted {
            deleted_ts: str_field(value, "deleted_ts").or_else(|| {
                value
                    .pointer("/previous_message/ts")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })?,
            previous: value
                .get("previous_message")
                .and_then(|m| message_from(m, &channel)),
            channel,
        }),
        Some("bot_message") => Some(RtmEvent::BotMessage {
            ts: str_field(value, "ts")?,
            username: str_field(value, "username").unwrap_or_else(|| "bot".to_string()),
            text: str_field(value, "text").unwrap_or_default(),
            channel,
        }),
        Some("channel_topic") | Some("group_topic") => Some(RtmEvent::TopicChange {
            topic: str_field(value, "topic")?,
            channel,
        }),
        Some(other) => {
            debug!("dropping message subtype {other}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_plain_message() {
        let ev = decode(&json!({
            "type": "message",
            "channel": "C01",
            "user": "U01",
            "text": "hi",
            "ts": "1700000000.000100"
        }));
        match ev {
            Some(RtmEvent::Message(m)) => {
                assert_eq!(m.channel, "C01");
                assert_eq!(m.user.as_deref(), Some("U01"));
                assert_eq!(m.text, "hi");
                assert!(!m.action);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decodes_me_message_as_action() {
        let ev = decode(&json!({
            "type": "message",
            "subtype": "me_message",
            "channel": "C01",
            "user": "U01",
            "text": "waves",
            "ts": "1.2"
        }));
        assert!(matches!(ev, Some(RtmEvent::Message(m)) if m.action));
    }

    #[test]
    fn decodes_edit_and_injects_channel() {
        let ev = decode(&json!({
            "type": "message",
            "subtype": "message_changed",
            "channel": "C01",
            "message": {"user": "U01", "text": "new", "ts": "1.1"},
            "previous_message": {"user": "U01", "text": "old", "ts": "1.1"}
        }));
        match ev {
            Some(RtmEvent::MessageChanged {
                channel,
                previous,
                current,
            }) => {
                assert_eq!(channel, "C01");
                assert_eq!(current.channel, "C01");
                assert_eq!(previous.unwrap().text, "old");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decodes_delete_with_fallback_ts() {
        let ev = decode(&json!({
            "type": "message",
            "subtype": "message_deleted",
            "channel": "C01",
            "previous_message": {"user": "U01", "text": "oops", "ts": "1.5"}
        }));
        assert!(matches!(ev, Some(RtmEvent::MessageDeleted { deleted_ts, .. }) if deleted_ts == "1.5"));
    }

    #[test]
    fn decodes_reaction_added() {
        let ev = decode(&json!({
            "type": "reaction_added",
            "user": "U01",
            "reaction": "+1",
            "item": {"type": "message", "channel": "C01", "ts": "1.9"}
        }));
        assert!(matches!(
            ev,
            Some(RtmEvent::ReactionAdded { reaction, ts, .. }) if reaction == "+1" && ts == "1.9"
        ));
    }

    #[test]
    fn decodes_typing_and_topic() {
        assert!(matches!(
            decode(&json!({"type": "user_typing", "channel": "D01", "user": "U02"})),
            Some(RtmEvent::UserTyping { .. })
        ));
        assert!(matches!(
            decode(&json!({
                "type": "message",
                "subtype": "channel_topic",
                "channel": "C01",
                "user": "U01",
                "topic": "new topic",
                "ts": "2.0"
            })),
            Some(RtmEvent::TopicChange { topic, .. }) if topic == "new topic"
        ));
    }

    #[test]
    fn unknown_type_is_dropped() {
        assert!(decode(&json!({"type": "dnd_updated_user"})).is_none());
    }

    #[test]
    fn malformed_known_type_is_dropped() {
        assert!(decode(&json!({"type": "user_typing", "channel": "C01"})).is_none());
    }

    #[test]
    fn files_are_carried_on_messages() {
        let ev = decode(&json!({
            "type": "message",
            "subtype": "file_share",
            "channel": "C01",
            "user": "U01",
            "text": "uploaded",
            "ts": "3.0",
            "files": [{"name": "a.txt", "mimetype": "text/plain", "size": 12, "url_private": "https://f"}]
        }));
        match ev {
            Some(RtmEvent::Message(m)) => {
                assert_eq!(m.files.len(), 1);
                assert_eq!(m.files[0].name.as_deref(), Some("a.txt"));
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }
}
