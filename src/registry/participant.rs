//! Participant types and roster snapshots
//!
//! [`Participant`] is the registry owner's mutable record. Fan-out paths
//! never see it; they read [`Snapshot`], an immutable copy-on-write view
//! published after every mutation. [`ParticipantInfo`] is the wire-facing
//! roster summary carried in `login_success` and `files`/roster broadcasts.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::fanout::queues::Mailbox;
use crate::protocol::message::PermissionField;

/// Participant identifier. 0 is reserved for the local host participant;
/// remote ids are assigned monotonically and never reused.
pub type ClientId = u32;

/// Participant role. At most one host exists at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Guest,
}

/// Live media flags, mirrored to all clients on change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaState {
    pub video_on: bool,
    pub audio_on: bool,
    pub screen_sharing: bool,
    pub is_presenter: bool,
}

/// Host-mutable permission bits. Everything defaults to allowed; the host
/// revokes selectively and the server enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub may_video: bool,
    pub may_audio: bool,
    pub may_screen_share: bool,
    pub may_chat: bool,
    pub may_upload: bool,
    pub may_download: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            may_video: true,
            may_audio: true,
            may_screen_share: true,
            may_chat: true,
            may_upload: true,
            may_download: true,
        }
    }
}

impl Permissions {
    pub fn get(&self, field: PermissionField) -> bool {
        match field {
            PermissionField::MayVideo => self.may_video,
            PermissionField::MayAudio => self.may_audio,
            PermissionField::MayScreenShare => self.may_screen_share,
            PermissionField::MayChat => self.may_chat,
            PermissionField::MayUpload => self.may_upload,
            PermissionField::MayDownload => self.may_download,
        }
    }

    /// Set one field; returns true when the value actually changed, so
    /// idempotent `set_permission` commands skip their broadcast.
    pub fn set(&mut self, field: PermissionField, value: bool) -> bool {
        let slot = match field {
            PermissionField::MayVideo => &mut self.may_video,
            PermissionField::MayAudio => &mut self.may_audio,
            PermissionField::MayScreenShare => &mut self.may_screen_share,
            PermissionField::MayChat => &mut self.may_chat,
            PermissionField::MayUpload => &mut self.may_upload,
            PermissionField::MayDownload => &mut self.may_download,
        };
        let changed = *slot != value;
        *slot = value;
        changed
    }
}

/// The registry owner's mutable participant record.
#[derive(Debug)]
pub struct Participant {
    pub id: ClientId,
    pub name: String,
    pub role: Role,

    /// Peer endpoint of the reliable stream. `None` for the local host
    /// participant, which has no TCP connection.
    pub control_addr: Option<SocketAddr>,

    /// Datagram endpoints, learned from the first valid datagram carrying
    /// this participant's id and refreshed on rebind.
    pub video_addr: Option<SocketAddr>,
    pub audio_addr: Option<SocketAddr>,

    pub media_state: MediaState,
    pub permissions: Permissions,

    pub last_heartbeat: Instant,
    /// One soft-timeout warning per quiet spell.
    pub soft_warned: bool,

    /// Admission order, used for host promotion (oldest wins).
    pub joined_seq: u64,

    pub mailbox: Arc<Mailbox>,
}

impl Participant {
    pub fn new(
        id: ClientId,
        name: String,
        role: Role,
        control_addr: Option<SocketAddr>,
        joined_seq: u64,
        mailbox: Arc<Mailbox>,
    ) -> Self {
        Self {
            id,
            name,
            role,
            control_addr,
            video_addr: None,
            audio_addr: None,
            media_state: MediaState::default(),
            permissions: Permissions::default(),
            last_heartbeat: Instant::now(),
            soft_warned: false,
            joined_seq,
            mailbox,
        }
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id,
            name: self.name.clone(),
            role: self.role,
            video_on: self.media_state.video_on,
            audio_on: self.media_state.audio_on,
            screen_sharing: self.media_state.screen_sharing,
            is_presenter: self.media_state.is_presenter,
        }
    }

    fn view(&self) -> ParticipantView {
        ParticipantView {
            id: self.id,
            name: self.name.clone(),
            role: self.role,
            media_state: self.media_state,
            permissions: self.permissions,
            video_addr: self.video_addr,
            audio_addr: self.audio_addr,
            mailbox: Arc::clone(&self.mailbox),
        }
    }
}

/// Wire-facing roster summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ClientId,
    pub name: String,
    pub role: Role,
    pub video_on: bool,
    pub audio_on: bool,
    pub screen_sharing: bool,
    pub is_presenter: bool,
}

/// Immutable per-participant view inside a [`Snapshot`].
#[derive(Debug)]
pub struct ParticipantView {
    pub id: ClientId,
    pub name: String,
    pub role: Role,
    pub media_state: MediaState,
    pub permissions: Permissions,
    pub video_addr: Option<SocketAddr>,
    pub audio_addr: Option<SocketAddr>,
    pub mailbox: Arc<Mailbox>,
}

/// Copy-on-write roster view published by the registry owner after every
/// mutation. The table is small (≤ `max_participants`, default 100), so a
/// full rebuild per mutation is cheap and keeps readers lock-free.
#[derive(Debug, Default)]
pub struct Snapshot {
    participants: Vec<Arc<ParticipantView>>,
    pub host_id: Option<ClientId>,
    pub presenter_id: Option<ClientId>,
}

impl Snapshot {
    pub(crate) fn build<'a, I>(
        participants: I,
        host_id: Option<ClientId>,
        presenter_id: Option<ClientId>,
    ) -> Arc<Self>
    where
        I: Iterator<Item = &'a Participant>,
    {
        Arc::new(Self {
            participants: participants.map(|p| Arc::new(p.view())).collect(),
            host_id,
            presenter_id,
        })
    }

    pub fn get(&self, id: ClientId) -> Option<&Arc<ParticipantView>> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ParticipantView>> {
        self.participants.iter()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
