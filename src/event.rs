//! Nostr event model and subscription filters.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind number for text notes.
pub const KIND_TEXT_NOTE: u32 = 1;
/// Kind number for contact lists.
pub const KIND_CONTACT_LIST: u32 = 3;
/// Kind number for reposts.
pub const KIND_REPOST: u32 = 6;
/// Kind number for reactions.
pub const KIND_REACTION: u32 = 7;
/// Kind number for zap receipts.
pub const KIND_ZAP_RECEIPT: u32 = 9735;

/// Simple tag wrapper preserving tag fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Core Nostr event as received from relays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `9735`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Values of all tags whose first field equals `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags.iter().filter_map(move |Tag(fields)| {
            if fields.len() >= 2 && fields[0] == name {
                Some(fields[1].as_str())
            } else {
                None
            }
        })
    }

    /// Referenced pubkeys (`p` tags).
    pub fn p_tags(&self) -> Vec<&str> {
        self.tag_values("p").collect()
    }

    /// Referenced event ids (`e` tags).
    pub fn e_tags(&self) -> Vec<&str> {
        self.tag_values("e").collect()
    }

    /// First value of the given tag, if any.
    pub fn first_tag<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next()
    }
}

/// Subscription filter serialized into REQ frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub kinds: Option<Vec<u32>>,
    pub authors: Option<Vec<String>>,
    pub p_tags: Option<Vec<String>>,
    pub e_tags: Option<Vec<String>>,
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    /// Assemble the filter JSON object sent in a REQ message.
    pub fn to_value(&self) -> Value {
        let mut filter = serde_json::Map::new();
        if let Some(k) = &self.kinds {
            filter.insert(
                "kinds".into(),
                Value::Array(k.iter().map(|v| Value::Number((*v).into())).collect()),
            );
        }
        if let Some(a) = &self.authors {
            filter.insert(
                "authors".into(),
                Value::Array(a.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(p) = &self.p_tags {
            filter.insert(
                "#p".into(),
                Value::Array(p.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(e) = &self.e_tags {
            filter.insert(
                "#e".into(),
                Value::Array(e.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(s) = self.since {
            filter.insert("since".into(), Value::Number(s.into()));
        }
        if let Some(l) = self.limit {
            filter.insert("limit".into(), Value::Number(l.into()));
        }
        Value::Object(filter)
    }
}

/// Build a `["REQ", subId, filter]` frame.
pub fn req_frame(sub_id: &str, filter: &Filter) -> String {
    json!(["REQ", sub_id, filter.to_value()]).to_string()
}

/// Build a `["CLOSE", subId]` frame.
pub fn close_frame(sub_id: &str) -> String {
    json!(["CLOSE", sub_id]).to_string()
}

/// Incoming relay frame, parsed from a JSON array.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// `["EVENT", subId, event]`
    Event(String, Event),
    /// `["EOSE", subId]`
    Eose(String),
    /// `["NOTICE", message]`
    Notice(String),
}

impl RelayFrame {
    /// Parse a relay text frame; unknown or malformed frames yield `None`.
    pub fn parse(txt: &str) -> Option<RelayFrame> {
        let val: Value = serde_json::from_str(txt).ok()?;
        let arr = val.as_array()?;
        match arr.first().and_then(|v| v.as_str())? {
            "EVENT" if arr.len() >= 3 => {
                let sub = arr[1].as_str()?.to_string();
                let ev = serde_json::from_value(arr[2].clone()).ok()?;
                Some(RelayFrame::Event(sub, ev))
            }
            "EOSE" if arr.len() >= 2 => Some(RelayFrame::Eose(arr[1].as_str()?.to_string())),
            "NOTICE" if arr.len() >= 2 => Some(RelayFrame::Notice(arr[1].as_str()?.to_string())),
            _ => None,
        }
    }
}

/// Current wall-clock time as Unix seconds.
pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// GMT hour of day (0-23) for a Unix timestamp.
pub fn hour_of_day(ts: u64) -> u8 {
    ((ts % 86_400) / 3_600) as u8
}
