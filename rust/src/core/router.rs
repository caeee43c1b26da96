//! Inbound frame demultiplexing.
//!
//! Frames are JSON objects tagged by `"type"`. The router decodes a frame and
//! calls exactly one [`EventSink`] method; all merge and idempotence rules live
//! in the sink.

use serde::{Deserialize, Serialize};

use crate::error::PresenceError;

pub const KNOWN_TAGS: [&str; 5] = [
    "typing-start",
    "typing-stop",
    "message-new",
    "message-read",
    "presence-snapshot",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireEvent {
    #[serde(rename_all = "camelCase")]
    TypingStart {
        conversation_id: String,
        peer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TypingStop {
        conversation_id: String,
        peer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    MessageNew {
        conversation_id: String,
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MessageRead {
        conversation_id: String,
        peer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PresenceSnapshot {
        conversation_id: String,
        count: u32,
        as_of: u64,
    },
}

impl WireEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            WireEvent::TypingStart { .. } => "typing-start",
            WireEvent::TypingStop { .. } => "typing-stop",
            WireEvent::MessageNew { .. } => "message-new",
            WireEvent::MessageRead { .. } => "message-read",
            WireEvent::PresenceSnapshot { .. } => "presence-snapshot",
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            WireEvent::TypingStart {
                conversation_id, ..
            }
            | WireEvent::TypingStop {
                conversation_id, ..
            }
            | WireEvent::MessageNew {
                conversation_id, ..
            }
            | WireEvent::MessageRead {
                conversation_id, ..
            }
            | WireEvent::PresenceSnapshot {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn to_frame(&self) -> String {
        // Plain strings and integers only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_frame(frame: &str) -> Result<Self, PresenceError> {
        let value: serde_json::Value = serde_json::from_str(frame)
            .map_err(|e| PresenceError::MalformedEvent(format!("not json: {e}")))?;
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| PresenceError::MalformedEvent("missing `type`".to_string()))?;
        if !KNOWN_TAGS.contains(&tag) {
            return Err(PresenceError::UnknownEvent(tag.to_string()));
        }
        let tag = tag.to_string();
        let event: WireEvent = serde_json::from_value(value)
            .map_err(|e| PresenceError::MalformedEvent(format!("{tag}: {e}")))?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<(), PresenceError> {
        let empty = |field: &str| {
            Err(PresenceError::MalformedEvent(format!(
                "{}: empty `{field}`",
                self.tag()
            )))
        };
        if self.conversation_id().is_empty() {
            return empty("conversationId");
        }
        match self {
            WireEvent::TypingStart { peer_id, .. }
            | WireEvent::TypingStop { peer_id, .. }
            | WireEvent::MessageRead { peer_id, .. }
                if peer_id.is_empty() =>
            {
                empty("peerId")
            }
            WireEvent::MessageNew { message_id, .. } if message_id.is_empty() => {
                empty("messageId")
            }
            _ => Ok(()),
        }
    }
}

/// Receiver of decoded inbound events.
pub trait EventSink {
    fn typing_started(&mut self, conversation_id: &str, peer_id: &str);
    fn typing_stopped(&mut self, conversation_id: &str, peer_id: &str);
    fn message_received(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        sender_id: Option<&str>,
    );
    fn message_read(&mut self, conversation_id: &str, peer_id: &str);
    fn unread_snapshot(&mut self, conversation_id: &str, count: u32, as_of: u64);
}

/// Decodes `frame` and dispatches it. Returns the event tag on success.
pub fn route<S: EventSink + ?Sized>(
    frame: &str,
    sink: &mut S,
) -> Result<&'static str, PresenceError> {
    let event = WireEvent::from_frame(frame)?;
    let tag = event.tag();
    dispatch(event, sink);
    Ok(tag)
}

pub fn dispatch<S: EventSink + ?Sized>(event: WireEvent, sink: &mut S) {
    match event {
        WireEvent::TypingStart {
            conversation_id,
            peer_id,
        } => sink.typing_started(&conversation_id, &peer_id),
        WireEvent::TypingStop {
            conversation_id,
            peer_id,
        } => sink.typing_stopped(&conversation_id, &peer_id),
        WireEvent::MessageNew {
            conversation_id,
            message_id,
            sender_id,
        } => sink.message_received(&conversation_id, &message_id, sender_id.as_deref()),
        WireEvent::MessageRead {
            conversation_id,
            peer_id,
        } => sink.message_read(&conversation_id, &peer_id),
        WireEvent::PresenceSnapshot {
            conversation_id,
            count,
            as_of,
        } => sink.unread_snapshot(&conversation_id, count, as_of),
    }
}
