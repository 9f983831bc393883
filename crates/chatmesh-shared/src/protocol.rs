use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Commands a peer sends to the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum TrackerRequest {
    Login {
        #[serde(rename = "usr")]
        username: String,
        password: String,
        #[serde(rename = "peer-listen-port")]
        listen_port: u16,
    },
    Register {
        #[serde(rename = "usr")]
        username: String,
        password: String,
    },
    Logout,
    Heartbeat,
    ListPeers,
    GetPeerAddr {
        #[serde(rename = "user-to-connect")]
        username: String,
    },
    ListRooms,
    CreateRoom {
        #[serde(rename = "room-name")]
        room: String,
    },
    JoinRoom {
        #[serde(rename = "room-to-join")]
        room: String,
    },
    LeaveRoom {
        #[serde(rename = "room-name")]
        room: String,
    },
    GetRoomMembers {
        #[serde(rename = "room-name")]
        room: String,
    },
    ListMyRooms,
    ListMembers {
        #[serde(rename = "room-name")]
        room: String,
    },
    AddMember {
        #[serde(rename = "room-name")]
        room: String,
        #[serde(rename = "user")]
        username: String,
    },
    RemoveMember {
        #[serde(rename = "room-name")]
        room: String,
        #[serde(rename = "user")]
        username: String,
    },
    CloseRoom {
        #[serde(rename = "room-name")]
        room: String,
    },
}

impl TrackerRequest {
    /// Wire name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            TrackerRequest::Login { .. } => "login",
            TrackerRequest::Register { .. } => "register",
            TrackerRequest::Logout => "logout",
            TrackerRequest::Heartbeat => "heartbeat",
            TrackerRequest::ListPeers => "list-peers",
            TrackerRequest::GetPeerAddr { .. } => "get-peer-addr",
            TrackerRequest::ListRooms => "list-rooms",
            TrackerRequest::CreateRoom { .. } => "create-room",
            TrackerRequest::JoinRoom { .. } => "join-room",
            TrackerRequest::LeaveRoom { .. } => "leave-room",
            TrackerRequest::GetRoomMembers { .. } => "get-room-members",
            TrackerRequest::ListMyRooms => "list-my-rooms",
            TrackerRequest::ListMembers { .. } => "list-members",
            TrackerRequest::AddMember { .. } => "add-member",
            TrackerRequest::RemoveMember { .. } => "remove-member",
            TrackerRequest::CloseRoom { .. } => "close-room",
        }
    }

    /// Commands accepted before a username is bound to the connection.
    pub fn is_anonymous(&self) -> bool {
        matches!(
            self,
            TrackerRequest::Login { .. } | TrackerRequest::Register { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Where to dial a peer and which key to seal for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    #[serde(rename = "user-ip")]
    pub ip: IpAddr,
    #[serde(rename = "user-port")]
    pub port: u16,
    #[serde(rename = "peer-public-key")]
    pub public_key: String,
}

/// Command-specific part of a tracker response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResponseData {
    LoggedIn {
        #[serde(rename = "usr")]
        username: String,
    },
    PeerList {
        #[serde(rename = "peer-list")]
        peers: Vec<String>,
    },
    PeerAddr(PeerAddr),
    RoomList {
        #[serde(rename = "room-list")]
        rooms: Vec<String>,
    },
    MyRooms {
        rooms: Vec<String>,
    },
    Members {
        moderator: String,
        members: Vec<String>,
    },
    OnlineMembers {
        members: BTreeMap<String, PeerAddr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerResponse {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

impl TrackerResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: ResponseData) -> Self {
        Self {
            status: Status::Ok,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Messages exchanged directly between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    ChatRequest {
        from_user: String,
    },
    Busy,
    Accept,
    Refuse,
    Message {
        content: String,
    },
    Exit,
    GroupChatJoin {
        room_name: String,
        from_user: String,
    },
    GroupJoinAccept,
    GroupMessage {
        content: String,
    },
    GroupLeave,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_names() {
        let req = TrackerRequest::Login {
            username: "alice".into(),
            password: "pw".into(),
            listen_port: 5565,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({"cmd": "login", "usr": "alice", "password": "pw", "peer-listen-port": 5565})
        );

        let value = serde_json::to_value(TrackerRequest::JoinRoom { room: "x".into() }).unwrap();
        assert_eq!(value, json!({"cmd": "join-room", "room-to-join": "x"}));
    }

    #[test]
    fn test_request_name_matches_tag() {
        let reqs = [
            TrackerRequest::Heartbeat,
            TrackerRequest::ListMyRooms,
            TrackerRequest::GetRoomMembers { room: "r".into() },
            TrackerRequest::RemoveMember {
                room: "r".into(),
                username: "u".into(),
            },
        ];
        for req in reqs {
            let value = serde_json::to_value(&req).unwrap();
            assert_eq!(value["cmd"], req.name());
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        let parsed = serde_json::from_value::<TrackerRequest>(json!({"cmd": "format-disk"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_missing_field_rejected() {
        let parsed = serde_json::from_value::<TrackerRequest>(json!({"cmd": "add-member", "room-name": "r"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_response_shape() {
        let resp = TrackerResponse::ok_with(
            "ok",
            ResponseData::PeerList {
                peers: vec!["bob".into()],
            },
        );
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["data"]["kind"], "peer-list");
        assert_eq!(value["data"]["peer-list"][0], "bob");

        let plain = serde_json::to_value(TrackerResponse::error("nope")).unwrap();
        assert_eq!(plain, json!({"status": "error", "message": "nope"}));
    }

    #[test]
    fn test_peer_message_tags() {
        let value = serde_json::to_value(PeerMessage::GroupChatJoin {
            room_name: "x".into(),
            from_user: "bob".into(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "group_chat_join", "room_name": "x", "from_user": "bob"})
        );

        let busy: PeerMessage = serde_json::from_value(json!({"type": "busy"})).unwrap();
        assert_eq!(busy, PeerMessage::Busy);
    }
}
