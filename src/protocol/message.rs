//! Control-channel message catalog
//!
//! Every control payload is a JSON object with a `type` tag, a server- or
//! client-stamped ISO-8601 `timestamp`, and tag-specific fields. The catalog
//! is modeled as one internally-tagged enum so dispatch is a single `match`.
//!
//! Unknown tags deserialize to [`ControlBody::Unknown`]; the hub warns and
//! ignores them rather than dropping the connection, so older hubs tolerate
//! newer clients.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::frame::encode_frame;
use crate::registry::participant::{ClientId, ParticipantInfo};
use crate::session::chat::ChatEntry;
use crate::session::files::FileInfo;

/// A complete control record: tagged body plus required timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// ISO-8601 timestamp. Server clock is authoritative on everything the
    /// hub emits; inbound stamps are accepted but never trusted for ordering.
    pub timestamp: String,

    #[serde(flatten)]
    pub body: ControlBody,
}

impl Envelope {
    /// Wrap a body with the current server time.
    pub fn now(body: ControlBody) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            body,
        }
    }

    /// Serialize to a JSON payload.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Serialize and prepend the length prefix, ready for a writer task.
    pub fn to_frame(&self) -> Result<Bytes> {
        Ok(encode_frame(&serde_json::to_vec(self)?))
    }

    /// Parse a received payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Host-mutable permission fields addressed by `set_permission`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionField {
    MayVideo,
    MayAudio,
    MayScreenShare,
    MayChat,
    MayUpload,
    MayDownload,
}

/// The tagged message catalog.
///
/// Direction notes are in each variant's doc line; the hub rejects commands
/// arriving from an illegitimate sender with `permission_error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlBody {
    /// client → server: display-name handshake.
    Login { name: String },

    /// server → client: admission with full session state.
    LoginSuccess {
        client_id: ClientId,
        participants: Vec<ParticipantInfo>,
        chat_history: Vec<ChatEntry>,
        shared_files: HashMap<String, FileInfo>,
        host_id: ClientId,
    },

    /// server → client: rejection; connection closes after send.
    LoginError { reason: String },

    /// client → server: graceful leave.
    Logout,

    /// client → server: explicit liveness proof.
    Heartbeat,

    /// server → all: roster addition.
    UserJoined { id: ClientId, name: String },

    /// server → all: a new participant holds the host role.
    HostChanged { host_id: ClientId },

    /// server → all: roster removal.
    UserLeft {
        id: ClientId,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// client → server (text only) and server → all (sender fields added).
    Chat {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
    },

    /// client → server: own-state delta; server → all: mirror with `id`.
    MediaState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        video_on: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_on: Option<bool>,
    },

    /// client → server: ask for the presenter slot.
    RequestPresenter,

    /// client → server: voluntarily give the presenter slot back.
    StopPresenting,

    /// server → requester: slot granted.
    PresenterGranted,

    /// server → requester: slot refused.
    PresenterDenied { reason: String },

    /// server → all: presenter slot changed; `null` clears.
    PresenterChanged { presenter_id: Option<ClientId> },

    /// presenter → server → all others: base64 screen frame, latest-wins.
    ScreenFrame { frame_data: String },

    /// host → server, and server → target as the forced-state notification.
    ForceMute {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_client: Option<ClientId>,
    },

    /// host → server, and server → target.
    ForceVideoOff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_client: Option<ClientId>,
    },

    /// host → server, and server → presenter.
    ForceStopPresenting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_client: Option<ClientId>,
    },

    /// host → server, and server → target.
    ForceStopScreenSharing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_client: Option<ClientId>,
    },

    /// host → server: mute every guest.
    ForceMuteAll,

    /// host → server: stop every guest's camera.
    ForceVideoOffAll,

    /// host → server → target: non-forcing prompt shown client-side.
    HostRequest {
        target_client: ClientId,
        request_type: String,
        message: String,
    },

    /// host → server: flip one permission bit on one participant.
    SetPermission {
        target: ClientId,
        field: PermissionField,
        value: bool,
    },

    /// host → server: evict; server → target before teardown.
    Kick { target: ClientId },

    /// client → server: announce an upload.
    FileOffer {
        fid: String,
        filename: String,
        size: u64,
    },

    /// server → uploader: ephemeral port is listening.
    FileUploadPort { fid: String, port: u16 },

    /// server → all: a file joined the shared index.
    FileAvailable {
        fid: String,
        filename: String,
        size: u64,
        uploader: String,
    },

    /// client → server: ask to download.
    FileRequest { fid: String },

    /// server → requester: ephemeral port is listening.
    FileDownloadPort { fid: String, port: u16, size: u64 },

    /// server → sender: upload/download refused or failed.
    FileError { fid: String, reason: String },

    /// client → server: resync the shared-file index.
    GetFilesList,

    /// server → requester: current index.
    FilesListUpdate {
        shared_files: HashMap<String, FileInfo>,
    },

    /// server → sender: command rejected.
    PermissionError { message: String },

    /// server → all: best-effort notice before exit.
    ServerShutdown,

    /// Any unrecognized tag. Logged once, never fatal.
    #[serde(other)]
    Unknown,
}

impl ControlBody {
    /// Build a `screen_frame` record from raw frame bytes.
    ///
    /// The hub itself never calls this (it relays the encoded payload
    /// opaquely); it exists for clients and tests.
    pub fn screen_frame(frame: &[u8]) -> Self {
        ControlBody::ScreenFrame {
            frame_data: BASE64.encode(frame),
        }
    }

    /// Tag name used in logs (mirrors the wire `type` value).
    pub fn tag(&self) -> &'static str {
        match self {
            ControlBody::Login { .. } => "login",
            ControlBody::LoginSuccess { .. } => "login_success",
            ControlBody::LoginError { .. } => "login_error",
            ControlBody::Logout => "logout",
            ControlBody::Heartbeat => "heartbeat",
            ControlBody::UserJoined { .. } => "user_joined",
            ControlBody::HostChanged { .. } => "host_changed",
            ControlBody::UserLeft { .. } => "user_left",
            ControlBody::Chat { .. } => "chat",
            ControlBody::MediaState { .. } => "media_state",
            ControlBody::RequestPresenter => "request_presenter",
            ControlBody::StopPresenting => "stop_presenting",
            ControlBody::PresenterGranted => "presenter_granted",
            ControlBody::PresenterDenied { .. } => "presenter_denied",
            ControlBody::PresenterChanged { .. } => "presenter_changed",
            ControlBody::ScreenFrame { .. } => "screen_frame",
            ControlBody::ForceMute { .. } => "force_mute",
            ControlBody::ForceVideoOff { .. } => "force_video_off",
            ControlBody::ForceStopPresenting { .. } => "force_stop_presenting",
            ControlBody::ForceStopScreenSharing { .. } => "force_stop_screen_sharing",
            ControlBody::ForceMuteAll => "force_mute_all",
            ControlBody::ForceVideoOffAll => "force_video_off_all",
            ControlBody::HostRequest { .. } => "host_request",
            ControlBody::SetPermission { .. } => "set_permission",
            ControlBody::Kick { .. } => "kick",
            ControlBody::FileOffer { .. } => "file_offer",
            ControlBody::FileUploadPort { .. } => "file_upload_port",
            ControlBody::FileAvailable { .. } => "file_available",
            ControlBody::FileRequest { .. } => "file_request",
            ControlBody::FileDownloadPort { .. } => "file_download_port",
            ControlBody::FileError { .. } => "file_error",
            ControlBody::GetFilesList => "get_files_list",
            ControlBody::FilesListUpdate { .. } => "files_list_update",
            ControlBody::PermissionError { .. } => "permission_error",
            ControlBody::ServerShutdown => "server_shutdown",
            ControlBody::Unknown => "unknown",
        }
    }
}

/// Decode the bytes carried by a `screen_frame` record.
pub fn decode_screen_frame(frame_data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(frame_data)
        .map_err(|e| Error::MalformedFrame(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_round_trip() {
        let env = Envelope::now(ControlBody::Login {
            name: "alice".into(),
        });

        let bytes = env.to_bytes().unwrap();
        let parsed = Envelope::from_slice(&bytes).unwrap();

        assert!(matches!(parsed.body, ControlBody::Login { ref name } if name == "alice"));
        assert_eq!(parsed.timestamp, env.timestamp);
    }

    #[test]
    fn test_tag_on_wire() {
        let env = Envelope::now(ControlBody::RequestPresenter);
        let json: serde_json::Value =
            serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert_eq!(json["type"], "request_presenter");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_unknown_tag_tolerated() {
        let raw = br#"{"type":"emoji_reaction","timestamp":"2026-01-01T00:00:00Z","emoji":"wave"}"#;
        let parsed = Envelope::from_slice(raw).unwrap();

        assert!(matches!(parsed.body, ControlBody::Unknown));
    }

    #[test]
    fn test_missing_timestamp_is_error() {
        let raw = br#"{"type":"heartbeat"}"#;
        assert!(Envelope::from_slice(raw).is_err());
    }

    #[test]
    fn test_missing_type_is_error() {
        let raw = br#"{"timestamp":"2026-01-01T00:00:00Z","name":"alice"}"#;
        assert!(Envelope::from_slice(raw).is_err());
    }

    #[test]
    fn test_chat_sender_fields_omitted_inbound() {
        let env = Envelope::now(ControlBody::Chat {
            text: "hi".into(),
            sender_id: None,
            sender_name: None,
        });
        let json: serde_json::Value =
            serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert_eq!(json["text"], "hi");
        assert!(json.get("sender_id").is_none());
        assert!(json.get("sender_name").is_none());
    }

    #[test]
    fn test_chat_sender_fields_present_outbound() {
        let env = Envelope::now(ControlBody::Chat {
            text: "hi".into(),
            sender_id: Some(1),
            sender_name: Some("alice".into()),
        });
        let json: serde_json::Value =
            serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert_eq!(json["sender_id"], 1);
        assert_eq!(json["sender_name"], "alice");
    }

    #[test]
    fn test_presenter_changed_null_clears() {
        let env = Envelope::now(ControlBody::PresenterChanged { presenter_id: None });
        let json: serde_json::Value =
            serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert!(json["presenter_id"].is_null());
    }

    #[test]
    fn test_permission_field_wire_names() {
        let env = Envelope::now(ControlBody::SetPermission {
            target: 3,
            field: PermissionField::MayScreenShare,
            value: false,
        });
        let json: serde_json::Value =
            serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();

        assert_eq!(json["type"], "set_permission");
        assert_eq!(json["field"], "may_screen_share");
        assert_eq!(json["target"], 3);
        assert_eq!(json["value"], false);
    }

    #[test]
    fn test_client_shaped_json_parses() {
        // Shapes a non-Rust client would produce.
        let cases: &[&[u8]] = &[
            br#"{"type":"login","timestamp":"2026-01-01T00:00:00Z","name":"bob"}"#,
            br#"{"type":"chat","timestamp":"2026-01-01T00:00:00Z","text":"hello"}"#,
            br#"{"type":"media_state","timestamp":"2026-01-01T00:00:00Z","audio_on":false}"#,
            br#"{"type":"file_offer","timestamp":"2026-01-01T00:00:00Z","fid":"f1","filename":"notes.txt","size":11}"#,
            br#"{"type":"force_mute","timestamp":"2026-01-01T00:00:00Z","target_client":2}"#,
            br#"{"type":"force_mute_all","timestamp":"2026-01-01T00:00:00Z"}"#,
        ];

        for raw in cases {
            let parsed = Envelope::from_slice(raw).unwrap();
            assert!(!matches!(parsed.body, ControlBody::Unknown));
        }
    }

    #[test]
    fn test_screen_frame_codec_round_trip() {
        let body = ControlBody::screen_frame(b"opaque frame bytes");
        let ControlBody::ScreenFrame { ref frame_data } = body else {
            unreachable!();
        };

        assert_eq!(decode_screen_frame(frame_data).unwrap(), b"opaque frame bytes");
        assert!(decode_screen_frame("not!!base64##").is_err());
    }

    #[test]
    fn test_to_frame_has_prefix() {
        let env = Envelope::now(ControlBody::Heartbeat);
        let framed = env.to_frame().unwrap();
        let declared = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;

        assert_eq!(declared, framed.len() - 4);
        let parsed = Envelope::from_slice(&framed[4..]).unwrap();
        assert!(matches!(parsed.body, ControlBody::Heartbeat));
    }
}
