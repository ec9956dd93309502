//! Wire types shared by every transport.
//!
//! Inbound frames use the `{Type, Data}` shape the original clients send.
//! Both `"Type"` and `"type"` spellings are accepted: the deployed clients
//! are inconsistent about casing and the server has always tolerated both.

use serde::{Deserialize, Serialize};

/// One decoded frame from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "Type", alias = "type")]
    pub kind: String,
    #[serde(rename = "Data", alias = "data", default)]
    pub data: String,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Outbound payload placed into client mailboxes.
///
/// Serializes to `{"type":"message","message":...,"sender":...}` or
/// `{"type":"userList","message":[...]}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    Message { message: String, sender: String },
    UserList { message: Vec<String> },
}

impl Envelope {
    /// Serialize for the wire. These shapes cannot fail to serialize, but the
    /// broadcast path treats a failure as "skip this envelope" rather than
    /// panicking.
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize envelope");
                None
            }
        }
    }
}
