// ================
// common/src/lib.rs
// ================
//! Wire-protocol types shared between the Parley relay server and its clients.
//! This module defines the relay channel messages and supporting types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User identifier, matching the `sub` claim of a session token.
pub type UserId = i64;

/// WebRTC signal kinds relayed between two participants.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Which media track a state change applies to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

/// Chat message origin.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    User,
    System,
}

/// Messages sent from client to server over the relay channel
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "msgType")]
pub enum ClientFrame {
    /// Announce presence in a meeting. Membership must already exist
    /// (established through the REST join endpoint).
    Join {
        meeting_code: String,
        /// Absent or null when the client failed to authenticate itself;
        /// the server answers with an error frame instead of broadcasting.
        user_id: Option<UserId>,
    },
    /// Announce departure from a meeting.
    Leave {
        meeting_code: String,
        user_id: UserId,
    },
    /// WebRTC session negotiation, forwarded verbatim to one participant.
    Signal {
        meeting_code: String,
        from: UserId,
        target_user_id: UserId,
        kind: SignalKind,
        /// JSON-stringified SDP or ICE candidate; opaque to the server.
        payload: String,
    },
    /// Chat message, broadcast to the meeting.
    Chat {
        meeting_code: String,
        sender_id: UserId,
        sender_name: String,
        text: String,
        timestamp: DateTime<Utc>,
        kind: ChatKind,
    },
    /// File transfer metadata plus base64 content, broadcast to the meeting.
    File {
        meeting_code: String,
        sender_id: UserId,
        sender_name: String,
        file_name: String,
        file_type: String,
        file_size: u64,
        /// Base64 encoded file content.
        file_data: String,
        timestamp: DateTime<Utc>,
    },
    /// Camera / microphone state change.
    MediaState {
        meeting_code: String,
        user_id: UserId,
        media_type: MediaType,
        enabled: bool,
    },
}

impl ClientFrame {
    /// The meeting this frame is addressed to.
    pub fn meeting_code(&self) -> &str {
        match self {
            ClientFrame::Join { meeting_code, .. }
            | ClientFrame::Leave { meeting_code, .. }
            | ClientFrame::Signal { meeting_code, .. }
            | ClientFrame::Chat { meeting_code, .. }
            | ClientFrame::File { meeting_code, .. }
            | ClientFrame::MediaState { meeting_code, .. } => meeting_code,
        }
    }
}

/// Messages sent from server to client over the relay channel
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "msgType")]
pub enum ServerFrame {
    /// A participant announced itself on the meeting topic.
    UserJoined {
        meeting_code: String,
        user_id: UserId,
    },
    /// A participant left (explicitly or through a transport disconnect).
    UserLeft {
        meeting_code: String,
        user_id: UserId,
    },
    /// Forwarded WebRTC signal, delivered only to the target participant.
    Signal {
        meeting_code: String,
        from: UserId,
        target_user_id: UserId,
        kind: SignalKind,
        payload: String,
    },
    Chat {
        meeting_code: String,
        sender_id: UserId,
        sender_name: String,
        text: String,
        timestamp: DateTime<Utc>,
        kind: ChatKind,
    },
    File {
        meeting_code: String,
        sender_id: UserId,
        sender_name: String,
        file_name: String,
        file_type: String,
        file_size: u64,
        file_data: String,
        timestamp: DateTime<Utc>,
    },
    MediaState {
        meeting_code: String,
        user_id: UserId,
        media_type: MediaType,
        enabled: bool,
    },
    /// Error addressed to the originating connection only, never broadcast.
    Error { code: String, message: String },
    /// The incoming frame could not be parsed.
    Malformed { err_msg: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_serialization() {
        let join = ClientFrame::Join {
            meeting_code: "AB12CD34EF".to_string(),
            user_id: Some(42),
        };

        let json = serde_json::to_string(&join).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["msgType"], "Join");
        assert_eq!(parsed["meeting_code"], "AB12CD34EF");
        assert_eq!(parsed["user_id"], 42);

        let roundtrip: ClientFrame = serde_json::from_str(&json).unwrap();
        match roundtrip {
            ClientFrame::Join { meeting_code, user_id } => {
                assert_eq!(meeting_code, "AB12CD34EF");
                assert_eq!(user_id, Some(42));
            },
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_join_without_user_id_parses() {
        // Clients that never authenticated send a join with no user id;
        // the frame must still parse so the relay can answer with an error.
        let json = r#"{"msgType":"Join","meeting_code":"AB12CD34EF"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Join { user_id, .. } => assert!(user_id.is_none()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_signal_kind_wire_names() {
        let sig = ClientFrame::Signal {
            meeting_code: "AB12CD34EF".to_string(),
            from: 1,
            target_user_id: 2,
            kind: SignalKind::IceCandidate,
            payload: "{\"candidate\":\"...\"}".to_string(),
        };
        let json = serde_json::to_string(&sig).unwrap();
        assert!(json.contains("\"ice-candidate\""));
    }

    #[test]
    fn test_meeting_code_accessor() {
        let frame = ClientFrame::MediaState {
            meeting_code: "XY98ZW76QV".to_string(),
            user_id: 7,
            media_type: MediaType::Video,
            enabled: false,
        };
        assert_eq!(frame.meeting_code(), "XY98ZW76QV");
    }
}
