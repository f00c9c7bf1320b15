use serde::{Deserialize, Serialize};

/// Events sent FROM server TO client over the hub WebSocket.
///
/// Replies to a command carry the `request_id` the client chose, so a client
/// can have several invocations in flight on one socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum HubEvent {
    /// A new room was allocated. The caller is not joined to it.
    RoomCreated { request_id: u64, code: String },

    /// Outcome of a join. `accepted=false` covers malformed, unknown and expired codes alike.
    RoomJoined {
        request_id: u64,
        code: String,
        accepted: bool,
    },

    RoomLeft { request_id: u64, code: String },

    /// The send was persisted (or dropped because the room does not exist).
    ContentSent { request_id: u64 },

    /// Decrypted history, oldest first.
    RoomHistory {
        request_id: u64,
        code: String,
        items: Vec<String>,
    },

    /// Fan-out of a clipboard payload to every member of `code`.
    ReceiveClipboardContent { code: String, content: String },

    /// The command identified by `request_id` failed.
    Error {
        request_id: Option<u64>,
        message: String,
    },
}

impl HubEvent {
    /// Returns the request this event answers, if any.
    /// Broadcasts return `None`.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::RoomCreated { request_id, .. }
            | Self::RoomJoined { request_id, .. }
            | Self::RoomLeft { request_id, .. }
            | Self::ContentSent { request_id }
            | Self::RoomHistory { request_id, .. } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            Self::ReceiveClipboardContent { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over the hub WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum HubCommand {
    CreateRoom { request_id: u64 },

    JoinRoom { request_id: u64, code: String },

    LeaveRoom { request_id: u64, code: String },

    SendClipboardContent {
        request_id: u64,
        code: String,
        content: String,
    },

    GetRoomHistory { request_id: u64, code: String },
}

impl HubCommand {
    pub fn request_id(&self) -> u64 {
        match self {
            Self::CreateRoom { request_id }
            | Self::JoinRoom { request_id, .. }
            | Self::LeaveRoom { request_id, .. }
            | Self::SendClipboardContent { request_id, .. }
            | Self::GetRoomHistory { request_id, .. } => *request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_type_data_framing() {
        let json = r#"{"type":"JoinRoom","data":{"request_id":7,"code":"K3F9A"}}"#;
        let cmd: HubCommand = serde_json::from_str(json).unwrap();
        assert_eq!(
            cmd,
            HubCommand::JoinRoom {
                request_id: 7,
                code: "K3F9A".into()
            }
        );
        assert_eq!(cmd.request_id(), 7);
    }

    #[test]
    fn broadcast_has_no_request_id() {
        let event = HubEvent::ReceiveClipboardContent {
            code: "K3F9A".into(),
            content: "hello".into(),
        };
        assert_eq!(event.request_id(), None);

        let text = serde_json::to_string(&event).unwrap();
        assert!(text.starts_with(r#"{"type":"ReceiveClipboardContent","data":"#));
    }
}
