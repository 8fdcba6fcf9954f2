//! Wire protocol spoken over the hub WebSocket.
//!
//! Every frame is a JSON text message. Clients send [`ClientFrame`]s; the
//! server answers each invocation with a [`ServerFrame::Completion`] carrying
//! the same `id`, and pushes [`ServerFrame::Event`]s that need no ack.
//!
//! ```text
//! → {"type":"invoke","id":7,"call":{"target":"LeaveGroupChat","arguments":{"group_id":"01J.."}}}
//! ← {"type":"completion","id":7,"error":null}
//! ← {"type":"event","event":{"target":"GroupMemberLeft","arguments":{...}}}
//! ```

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque transport-session id assigned by the server.
pub type ConnectionId = String;
pub type GroupId = String;
pub type MessageId = String;

/// Stable authenticated user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for Identity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A chat group: an id plus the identities allowed to talk in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: Option<String>,
    pub members: BTreeSet<Identity>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub id: MessageId,
    pub group_id: GroupId,
    pub author: Identity,
    pub content: String,
    pub edited: bool,
    pub timestamp: DateTime<Utc>,
}

/// One live connection of an online user, as shown in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub connection_id: ConnectionId,
    pub name: Option<String>,
    pub email: Option<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub id: Identity,
    pub clients: Vec<ConnectionSummary>,
}

/// Client-invocable hub operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", content = "arguments")]
pub enum HubCall {
    SendGroupChatMessage {
        group_id: GroupId,
        message: String,
    },
    EditGroupChatMessage {
        group_id: GroupId,
        message_id: MessageId,
        new_content: String,
    },
    DeleteGroupChatMessage {
        group_id: GroupId,
        message_id: MessageId,
    },
    LeaveGroupChat {
        group_id: GroupId,
    },
    /// Opt in or out of roster/visitor-count pushes for this connection.
    SetPresenceInterest {
        enabled: bool,
    },
}

impl HubCall {
    pub fn target(&self) -> &'static str {
        match self {
            HubCall::SendGroupChatMessage { .. } => "SendGroupChatMessage",
            HubCall::EditGroupChatMessage { .. } => "EditGroupChatMessage",
            HubCall::DeleteGroupChatMessage { .. } => "DeleteGroupChatMessage",
            HubCall::LeaveGroupChat { .. } => "LeaveGroupChat",
            HubCall::SetPresenceInterest { .. } => "SetPresenceInterest",
        }
    }
}

/// Server-pushed events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", content = "arguments")]
pub enum ServerEvent {
    /// Full roster snapshot plus the anonymous visitor count.
    PresenceUpdated {
        online: Vec<OnlineUser>,
        visitor_count: usize,
    },
    GroupCreated {
        group: Group,
    },
    GroupMessageReceived {
        message: GroupMessage,
    },
    GroupMessageEdited {
        message: GroupMessage,
    },
    GroupMessageDeleted {
        group_id: GroupId,
        message_id: MessageId,
    },
    GroupMemberJoined {
        group_id: GroupId,
        identity: Identity,
    },
    GroupMemberLeft {
        group_id: GroupId,
        identity: Identity,
    },
}

impl ServerEvent {
    /// Encode as a complete [`ServerFrame::Event`] JSON text frame.
    pub fn to_frame_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        enum Borrowed<'a> {
            Event { event: &'a ServerEvent },
        }
        serde_json::to_string(&Borrowed::Event { event: self })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown group or message.
    NotFound,
    /// Caller is not allowed to perform the operation.
    Forbidden,
    /// Rejected input (empty or oversized content, malformed frame).
    Invalid,
    /// Storage failed; the caller may retry.
    Transient,
    /// Operation requires an authenticated identity.
    Unauthorized,
}

/// Error half of a [`ServerFrame::Completion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Invoke { id: u64, call: HubCall },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Completion { id: u64, error: Option<ErrorBody> },
    Event { event: ServerEvent },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invoke_frame_shape() {
        let frame = ClientFrame::Invoke {
            id: 3,
            call: HubCall::SendGroupChatMessage {
                group_id: "g1".into(),
                message: "hello".into(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "invoke",
                "id": 3,
                "call": {
                    "target": "SendGroupChatMessage",
                    "arguments": {"group_id": "g1", "message": "hello"}
                }
            })
        );
    }

    #[test]
    fn completion_without_error_is_null() {
        let frame = ServerFrame::Completion { id: 9, error: None };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({"type": "completion", "id": 9, "error": null}));
    }

    #[test]
    fn error_codes_are_snake_case() {
        let body = ErrorBody::new(ErrorCode::NotFound, "group g1 not found");
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["code"], "not_found");
    }

    #[test]
    fn event_frame_json_parses_as_server_frame() {
        let event = ServerEvent::GroupMemberLeft {
            group_id: "g1".into(),
            identity: Identity::new("alice"),
        };
        let text = event.to_frame_json().unwrap();
        let parsed: ServerFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, ServerFrame::Event { event });
        assert!(text.contains("\"target\":\"GroupMemberLeft\""));
    }

    #[test]
    fn identity_serializes_as_plain_string() {
        let value = serde_json::to_value(Identity::new("u-42")).unwrap();
        assert_eq!(value, json!("u-42"));
    }

    #[test]
    fn call_targets_match_wire_names() {
        let call = HubCall::LeaveGroupChat {
            group_id: "g".into(),
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["target"], call.target());
    }
}
