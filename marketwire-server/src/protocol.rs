//! JSON frames exchanged over the persistent connection.

use serde::{Deserialize, Serialize};

use crate::db::{Message, Notification};

/// Client → server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    Message {
        #[serde(default)]
        receiver_id: Option<String>,
        #[serde(default)]
        content: String,
        #[serde(rename = "isSupport", default)]
        is_support: bool,
        /// Retry key: resending with the same key never duplicates.
        #[serde(default)]
        client_msg_id: Option<String>,
    },
    /// Replay everything visible to the client after a message id.
    Resume {
        after_id: i64,
    },
    Read {
        #[serde(rename = "isSupport", default)]
        is_support: bool,
        #[serde(rename = "threadUserId", default)]
        thread_user_id: Option<String>,
    },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Authenticated,
    NewMessage { message: Message },
    /// Acknowledgement to the connection that issued the send.
    Sent { message: Message },
    Notification { notification: Notification },
    Unread { general: i64, support: i64 },
    /// End of a resume batch. `more` means the client should resume again from `cursor`.
    Resumed { cursor: i64, more: bool },
    Error { message: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error { message: message.into() }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"encoding failed"}"#.to_string())
    }
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
