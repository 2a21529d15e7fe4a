//! NIP-01 wire framing between clients and relays.

use serde_json::{json, Value};

use crate::{event::Event, filter::Filter};

/// Frames a client sends to a relay.
#[derive(Debug, Clone)]
pub enum ClientMessage<'a> {
    Event(&'a Event),
    Req { sub_id: &'a str, filter: &'a Filter },
    Close(&'a str),
}

impl ClientMessage<'_> {
    pub fn to_json(&self) -> String {
        match self {
            ClientMessage::Event(ev) => json!(["EVENT", ev]),
            ClientMessage::Req { sub_id, filter } => json!(["REQ", sub_id, filter]),
            ClientMessage::Close(sub_id) => json!(["CLOSE", sub_id]),
        }
        .to_string()
    }
}

/// Frames a relay sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Eose(String),
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Closed { sub_id: String, message: String },
    Notice(String),
}

impl RelayMessage {
    /// Parse one text frame. Unknown verbs and malformed frames yield `None`.
    pub fn parse(txt: &str) -> Option<Self> {
        let val = serde_json::from_str::<Value>(txt).ok()?;
        let arr = val.as_array()?;
        let text_at = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
        match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") if arr.len() >= 3 => {
                let event = serde_json::from_value::<Event>(arr[2].clone()).ok()?;
                Some(RelayMessage::Event {
                    sub_id: text_at(1)?,
                    event,
                })
            }
            Some("EOSE") => Some(RelayMessage::Eose(text_at(1)?)),
            Some("OK") if arr.len() >= 3 => Some(RelayMessage::Ok {
                event_id: text_at(1)?,
                accepted: arr[2].as_bool()?,
                message: text_at(3).unwrap_or_default(),
            }),
            Some("CLOSED") => Some(RelayMessage::Closed {
                sub_id: text_at(1)?,
                message: text_at(2).unwrap_or_default(),
            }),
            Some("NOTICE") => Some(RelayMessage::Notice(text_at(1).unwrap_or_default())),
            _ => None,
        }
    }
}
