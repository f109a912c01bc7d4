//! Registry owner implementation
//!
//! The actor that owns the roster, chat log, shared-file index, and
//! presenter slot. One command at a time, so dependent broadcasts (say,
//! `presenter_changed` caused by a `kick`) go out in the causal order the
//! mutations happen, and there is never a window without an advertised host.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fanout::engine::FanOut;
use crate::fanout::queues::Mailbox;
use crate::protocol::message::{ControlBody, Envelope};
use crate::registry::error::RegistryError;
use crate::registry::moderation::{self, ModAction};
use crate::registry::participant::{ClientId, Participant, Role, Snapshot};
use crate::server::config::HubConfig;
use crate::session::chat::{ChatEntry, ChatLog};
use crate::session::files::{sanitize_filename, FileEntry, FileIndex, FileInfo};
use crate::session::presenter::PresenterSlot;
use crate::stats::metrics::HubMetrics;
use crate::HOST_CLIENT_ID;

/// Why a participant left, as carried in `user_left.reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Explicit `logout`; no wire reason.
    Logout,
    /// Heartbeat hard timeout.
    Timeout,
    /// Evicted by the host.
    Kicked,
    /// Reader or writer task failed.
    ConnectionError,
    /// Control lane overflowed.
    Overflow,
}

impl LeaveReason {
    fn wire(self) -> Option<String> {
        match self {
            LeaveReason::Logout => None,
            LeaveReason::Timeout => Some("timeout".into()),
            LeaveReason::Kicked => Some("kicked".into()),
            LeaveReason::ConnectionError => Some("connection_error".into()),
            LeaveReason::Overflow => Some("overflow".into()),
        }
    }
}

/// Which datagram channel an address was learned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// A validated file offer: everything the transfer mediator needs to run
/// the upload. The fid is reserved until registered or released.
#[derive(Debug, Clone)]
pub struct UploadTicket {
    pub fid: String,
    pub filename: String,
    pub size: u64,
    pub uploader_id: ClientId,
    pub uploader_name: String,
}

pub(crate) enum Command {
    Admit {
        name: String,
        control_addr: Option<SocketAddr>,
        mailbox: Arc<Mailbox>,
        reply: oneshot::Sender<std::result::Result<ClientId, RegistryError>>,
    },
    Remove {
        id: ClientId,
        reason: LeaveReason,
    },
    Heartbeat {
        id: ClientId,
    },
    Chat {
        id: ClientId,
        text: String,
    },
    MediaState {
        id: ClientId,
        video_on: Option<bool>,
        audio_on: Option<bool>,
    },
    ScreenSharing {
        id: ClientId,
        on: bool,
    },
    LearnMediaAddr {
        id: ClientId,
        kind: MediaKind,
        addr: SocketAddr,
    },
    RequestPresenter {
        id: ClientId,
        reply: oneshot::Sender<std::result::Result<(), RegistryError>>,
    },
    StopPresenting {
        id: ClientId,
    },
    Moderate {
        from: ClientId,
        action: ModAction,
        reply: oneshot::Sender<std::result::Result<(), RegistryError>>,
    },
    FileOffer {
        id: ClientId,
        fid: String,
        filename: String,
        size: u64,
        reply: oneshot::Sender<std::result::Result<UploadTicket, RegistryError>>,
    },
    RegisterUpload {
        entry: FileEntry,
    },
    ReleaseFid {
        fid: String,
    },
    FileRequest {
        id: ClientId,
        fid: String,
        reply: oneshot::Sender<std::result::Result<FileEntry, RegistryError>>,
    },
    FilesList {
        id: ClientId,
    },
    ScanSpool {
        reply: oneshot::Sender<Vec<FileInfo>>,
    },
    SweepStale,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The owner's state. Mutated only inside the actor task; `moderation`
/// reaches in through `pub(crate)` because it runs on the same task.
pub(crate) struct RegistryState {
    pub(crate) config: Arc<HubConfig>,
    pub(crate) participants: HashMap<ClientId, Participant>,
    next_id: ClientId,
    next_seq: u64,
    pub(crate) chat: ChatLog,
    pub(crate) files: FileIndex,
    pub(crate) presenter: PresenterSlot,
    pub(crate) fanout: FanOut,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    pub(crate) snapshot: Arc<Snapshot>,
    /// Participants whose control lane overflowed during the current
    /// command; evicted after the handler returns.
    pub(crate) pending_evict: Vec<ClientId>,
}

impl RegistryState {
    fn new(config: Arc<HubConfig>, fanout: FanOut, host_mailbox: Arc<Mailbox>) -> (Self, watch::Receiver<Arc<Snapshot>>) {
        let host = Participant::new(
            HOST_CLIENT_ID,
            config.host_name.clone(),
            Role::Host,
            None,
            0,
            host_mailbox,
        );

        let mut participants = HashMap::new();
        participants.insert(HOST_CLIENT_ID, host);

        let snapshot = Snapshot::build(participants.values(), Some(HOST_CLIENT_ID), None);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());

        HubMetrics::incr(&fanout.metrics().active_participants);

        let state = Self {
            chat: ChatLog::new(config.chat_history_size),
            config,
            participants,
            next_id: 1,
            next_seq: 1,
            files: FileIndex::new(),
            presenter: PresenterSlot::new(),
            fanout,
            snapshot_tx,
            snapshot,
            pending_evict: Vec::new(),
        };
        (state, snapshot_rx)
    }

    /// Rebuild and publish the roster snapshot. Called after every mutation
    /// and before any broadcast that depends on it.
    pub(crate) fn publish(&mut self) {
        let snapshot = Snapshot::build(
            self.participants.values(),
            self.host_id(),
            self.presenter.holder(),
        );
        self.snapshot = snapshot.clone();
        let _ = self.snapshot_tx.send(snapshot);
    }

    pub(crate) fn host_id(&self) -> Option<ClientId> {
        self.participants
            .values()
            .find(|p| p.role == Role::Host)
            .map(|p| p.id)
    }

    /// Control-lane send to one live participant.
    pub(crate) fn send_control(&mut self, id: ClientId, body: ControlBody) {
        self.send_control_env(id, Envelope::now(body));
    }

    fn send_control_env(&mut self, id: ClientId, env: Envelope) {
        if self.snapshot.get(id).is_none() {
            return;
        }
        match self.fanout.control_to(&self.snapshot, id, &env) {
            Ok(true) => {}
            Ok(false) => {
                warn!(id, "Control lane overflow, scheduling eviction");
                self.pending_evict.push(id);
            }
            Err(e) => warn!(id, error = %e, "Failed to encode control record"),
        }
    }

    /// Control-lane broadcast; overflowing recipients get scheduled for
    /// eviction.
    pub(crate) fn broadcast_control(&mut self, exclude: Option<ClientId>, body: ControlBody) {
        match self
            .fanout
            .control_broadcast(&self.snapshot, exclude, &Envelope::now(body))
        {
            Ok(overflowed) => {
                for id in &overflowed {
                    warn!(id, "Control lane overflow, scheduling eviction");
                }
                self.pending_evict.extend(overflowed);
            }
            Err(e) => warn!(error = %e, "Failed to encode control broadcast"),
        }
    }

    /// Chat-lane broadcast (droppable under pressure).
    pub(crate) fn broadcast_chat(&mut self, exclude: Option<ClientId>, body: ControlBody) {
        self.broadcast_chat_env(exclude, Envelope::now(body));
    }

    fn broadcast_chat_env(&mut self, exclude: Option<ClientId>, env: Envelope) {
        if let Err(e) = self.fanout.chat_broadcast(&self.snapshot, exclude, &env) {
            warn!(error = %e, "Failed to encode chat broadcast");
        }
    }

    /// Typed policy rejection back to the offending sender.
    pub(crate) fn send_permission_error(&mut self, id: ClientId, err: &RegistryError) {
        self.send_control(
            id,
            ControlBody::PermissionError {
                message: err.to_string(),
            },
        );
    }

    fn admit(
        &mut self,
        name: String,
        control_addr: Option<SocketAddr>,
        mailbox: Arc<Mailbox>,
    ) -> std::result::Result<ClientId, RegistryError> {
        let name = name.trim().to_string();
        if name.is_empty() || name.chars().count() > crate::MAX_NAME_LEN {
            return Err(RegistryError::InvalidName(name));
        }
        if self.participants.len() >= self.config.max_participants {
            return Err(RegistryError::SessionFull {
                max: self.config.max_participants,
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        // An empty-host session (the local host logged out earlier) hands
        // the role to the next arrival.
        let role = if self.host_id().is_none() {
            Role::Host
        } else {
            Role::Guest
        };

        let participant = Participant::new(id, name.clone(), role, control_addr, seq, mailbox);
        self.participants.insert(id, participant);
        self.publish();

        HubMetrics::incr(&self.fanout.metrics().active_participants);
        info!(id, name = %name, ?role, "Participant admitted");

        let mut roster: Vec<_> = self.participants.values().map(|p| p.info()).collect();
        roster.sort_by_key(|p| p.id);

        self.send_control(
            id,
            ControlBody::LoginSuccess {
                client_id: id,
                participants: roster,
                chat_history: self.chat.history(),
                shared_files: self.files.wire_map(),
                host_id: self.host_id().unwrap_or(id),
            },
        );
        self.broadcast_chat(Some(id), ControlBody::UserJoined { id, name });

        Ok(id)
    }

    /// Remove a participant, promoting a new host and clearing the
    /// presenter slot in the same serialized step when needed.
    pub(crate) fn remove(&mut self, id: ClientId, reason: LeaveReason) {
        let Some(removed) = self.participants.remove(&id) else {
            return;
        };
        removed.mailbox.close();

        let was_host = removed.role == Role::Host;
        let presenter_cleared = self.presenter.release_if(id);

        let mut new_host = None;
        if was_host {
            if let Some(oldest) = self
                .participants
                .values_mut()
                .min_by_key(|p| (p.joined_seq, p.id))
            {
                oldest.role = Role::Host;
                new_host = Some(oldest.id);
            }
        }

        self.publish();
        HubMetrics::decr(&self.fanout.metrics().active_participants);
        info!(id, name = %removed.name, ?reason, "Participant removed");

        self.broadcast_chat(
            None,
            ControlBody::UserLeft {
                id,
                name: removed.name,
                reason: reason.wire(),
            },
        );
        if presenter_cleared {
            self.broadcast_chat(None, ControlBody::PresenterChanged { presenter_id: None });
        }
        if let Some(host_id) = new_host {
            info!(host_id, "Host role transferred");
            self.broadcast_chat(None, ControlBody::HostChanged { host_id });
        }
    }

    fn heartbeat(&mut self, id: ClientId) {
        if let Some(p) = self.participants.get_mut(&id) {
            p.last_heartbeat = tokio::time::Instant::now();
            p.soft_warned = false;
            HubMetrics::incr(&self.fanout.metrics().heartbeats);
        }
    }

    fn chat_message(&mut self, id: ClientId, text: String) {
        let (may_chat, sender_name) = match self.participants.get(&id) {
            Some(p) => (p.permissions.may_chat, p.name.clone()),
            None => return,
        };

        if !may_chat {
            let err = RegistryError::PermissionDenied("chat");
            self.send_permission_error(id, &err);
            return;
        }
        if text.len() > self.config.max_chat_len {
            let err = RegistryError::ChatTooLong {
                len: text.len(),
                max: self.config.max_chat_len,
            };
            self.send_permission_error(id, &err);
            return;
        }

        let entry = ChatEntry {
            sender_id: id,
            sender_name,
            text,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        self.chat.push(entry.clone());
        HubMetrics::incr(&self.fanout.metrics().chat_messages);

        // The broadcast reuses the logged timestamp so history replay and
        // live delivery agree.
        let env = Envelope {
            timestamp: entry.timestamp,
            body: ControlBody::Chat {
                text: entry.text,
                sender_id: Some(entry.sender_id),
                sender_name: Some(entry.sender_name),
            },
        };
        self.broadcast_chat_env(Some(id), env);
    }

    fn media_state(&mut self, id: ClientId, video_on: Option<bool>, audio_on: Option<bool>) {
        let Some(p) = self.participants.get_mut(&id) else {
            return;
        };

        // Permissions clamp what a client may turn on; it cannot bypass a
        // host-revoked medium by re-announcing it.
        let applied_video = video_on.map(|v| v && p.permissions.may_video);
        let applied_audio = audio_on.map(|v| v && p.permissions.may_audio);

        if let Some(v) = applied_video {
            p.media_state.video_on = v;
        }
        if let Some(v) = applied_audio {
            p.media_state.audio_on = v;
        }
        if applied_video.is_none() && applied_audio.is_none() {
            return;
        }

        self.publish();
        self.broadcast_chat(
            Some(id),
            ControlBody::MediaState {
                id: Some(id),
                video_on: applied_video,
                audio_on: applied_audio,
            },
        );
    }

    fn screen_sharing(&mut self, id: ClientId, on: bool) {
        if let Some(p) = self.participants.get_mut(&id) {
            if p.media_state.screen_sharing != on {
                p.media_state.screen_sharing = on;
                self.publish();
            }
        }
    }

    fn learn_media_addr(&mut self, id: ClientId, kind: MediaKind, addr: SocketAddr) {
        let Some(p) = self.participants.get_mut(&id) else {
            return;
        };
        let slot = match kind {
            MediaKind::Video => &mut p.video_addr,
            MediaKind::Audio => &mut p.audio_addr,
        };
        if *slot != Some(addr) {
            debug!(id, ?kind, %addr, "Learned media address");
            *slot = Some(addr);
            self.publish();
        }
    }

    fn file_offer(
        &mut self,
        id: ClientId,
        fid: String,
        filename: String,
        size: u64,
    ) -> std::result::Result<UploadTicket, RegistryError> {
        let Some(p) = self.participants.get(&id) else {
            return Err(RegistryError::UnknownParticipant(id));
        };
        if !p.permissions.may_upload {
            return Err(RegistryError::PermissionDenied("file upload"));
        }
        if size > self.config.max_file_size {
            return Err(RegistryError::FileTooLarge {
                size,
                max: self.config.max_file_size,
            });
        }
        if fid.is_empty()
            || fid.len() > 128
            || !fid
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(RegistryError::InvalidFid(fid));
        }
        let filename = sanitize_filename(&filename)?;
        self.files.reserve(&fid)?;

        Ok(UploadTicket {
            fid,
            filename,
            size,
            uploader_id: id,
            uploader_name: p.name.clone(),
        })
    }

    fn register_upload(&mut self, entry: FileEntry) {
        info!(fid = %entry.fid, size = entry.size, uploader = %entry.uploader_name, "File registered");
        HubMetrics::incr(&self.fanout.metrics().files_uploaded);

        let body = ControlBody::FileAvailable {
            fid: entry.fid.clone(),
            filename: entry.filename.clone(),
            size: entry.size,
            uploader: entry.uploader_name.clone(),
        };
        self.files.register(entry);
        self.broadcast_chat(None, body);
    }

    fn file_request(
        &self,
        id: ClientId,
        fid: &str,
    ) -> std::result::Result<FileEntry, RegistryError> {
        let Some(p) = self.participants.get(&id) else {
            return Err(RegistryError::UnknownParticipant(id));
        };
        if !p.permissions.may_download {
            return Err(RegistryError::PermissionDenied("file download"));
        }
        self.files
            .get(fid)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownFid(fid.to_string()))
    }

    async fn scan_spool(&mut self) -> Vec<FileInfo> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let spool = self.config.spool_dir.clone();
        let created = self.files.scan_spool(&spool, &timestamp).await;

        let infos: Vec<FileInfo> = created.iter().map(|e| e.info()).collect();
        for entry in created {
            self.broadcast_chat(
                None,
                ControlBody::FileAvailable {
                    fid: entry.fid,
                    filename: entry.filename,
                    size: entry.size,
                    uploader: entry.uploader_name,
                },
            );
        }
        infos
    }

    fn sweep_stale(&mut self) {
        let soft = self.config.heartbeat_soft;
        let hard = self.config.heartbeat_hard;

        let mut evict = Vec::new();
        for p in self.participants.values_mut() {
            if p.id == HOST_CLIENT_ID {
                continue;
            }
            let quiet = p.last_heartbeat.elapsed();
            if quiet >= hard {
                evict.push(p.id);
            } else if quiet >= soft && !p.soft_warned {
                p.soft_warned = true;
                warn!(id = p.id, name = %p.name, quiet_s = quiet.as_secs(), "Heartbeat overdue");
            }
        }

        for id in evict {
            self.remove(id, LeaveReason::Timeout);
        }
    }

    fn shutdown(&mut self) {
        info!("Registry shutting down");
        self.broadcast_control(None, ControlBody::ServerShutdown);
        for p in self.participants.values() {
            p.mailbox.close();
        }
        self.participants.clear();
        self.publish();
    }

    /// Evict everyone whose control lane overflowed while handling the
    /// current command. Removals broadcast too, so keep draining until
    /// quiescent.
    fn drain_evictions(&mut self) {
        while let Some(id) = self.pending_evict.pop() {
            if self.participants.contains_key(&id) {
                self.remove(id, LeaveReason::Overflow);
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Admit {
                name,
                control_addr,
                mailbox,
                reply,
            } => {
                let _ = reply.send(self.admit(name, control_addr, mailbox));
            }
            Command::Remove { id, reason } => self.remove(id, reason),
            Command::Heartbeat { id } => self.heartbeat(id),
            Command::Chat { id, text } => self.chat_message(id, text),
            Command::MediaState {
                id,
                video_on,
                audio_on,
            } => self.media_state(id, video_on, audio_on),
            Command::ScreenSharing { id, on } => self.screen_sharing(id, on),
            Command::LearnMediaAddr { id, kind, addr } => self.learn_media_addr(id, kind, addr),
            Command::RequestPresenter { id, reply } => {
                let _ = reply.send(moderation::request_presenter(self, id));
            }
            Command::StopPresenting { id } => moderation::stop_presenting(self, id),
            Command::Moderate {
                from,
                action,
                reply,
            } => {
                let _ = reply.send(moderation::apply(self, from, action));
            }
            Command::FileOffer {
                id,
                fid,
                filename,
                size,
                reply,
            } => {
                let _ = reply.send(self.file_offer(id, fid, filename, size));
            }
            Command::RegisterUpload { entry } => self.register_upload(entry),
            Command::ReleaseFid { fid } => self.files.release(&fid),
            Command::FileRequest { id, fid, reply } => {
                let _ = reply.send(self.file_request(id, &fid));
            }
            Command::FilesList { id } => {
                let body = ControlBody::FilesListUpdate {
                    shared_files: self.files.wire_map(),
                };
                self.send_control(id, body);
            }
            Command::ScanSpool { reply } => {
                let _ = reply.send(self.scan_spool().await);
            }
            Command::SweepStale => self.sweep_stale(),
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            let stop = matches!(cmd, Command::Shutdown { .. });
            self.handle(cmd).await;
            self.drain_evictions();
            if stop {
                break;
            }
        }
        debug!("Registry task finished");
    }
}

/// Spawns the registry owner task.
pub struct Registry;

impl Registry {
    /// Start the owner with the local host participant (id 0) installed.
    ///
    /// Returns the command handle, the host participant's mailbox (for a
    /// host console to drain), and the task handle.
    pub fn spawn(
        config: Arc<HubConfig>,
        fanout: FanOut,
    ) -> (RegistryHandle, Arc<Mailbox>, tokio::task::JoinHandle<()>) {
        let host_mailbox = Arc::new(Mailbox::new());
        let (state, snapshot_rx) = RegistryState::new(config, fanout, host_mailbox.clone());

        let (tx, rx) = mpsc::channel(256);
        let join = tokio::spawn(state.run(rx));

        let handle = RegistryHandle { tx, snapshot_rx };
        (handle, host_mailbox, join)
    }
}

/// Cloneable command-channel handle to the registry owner.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
}

impl RegistryHandle {
    /// Latest published roster snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_rx.borrow().clone()
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| Error::RegistryGone)
    }

    pub async fn admit(
        &self,
        name: String,
        control_addr: Option<SocketAddr>,
        mailbox: Arc<Mailbox>,
    ) -> Result<ClientId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Admit {
            name,
            control_addr,
            mailbox,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| Error::RegistryGone)??)
    }

    pub async fn remove(&self, id: ClientId, reason: LeaveReason) -> Result<()> {
        self.send(Command::Remove { id, reason }).await
    }

    pub async fn heartbeat(&self, id: ClientId) -> Result<()> {
        self.send(Command::Heartbeat { id }).await
    }

    pub async fn chat(&self, id: ClientId, text: String) -> Result<()> {
        self.send(Command::Chat { id, text }).await
    }

    pub async fn media_state(
        &self,
        id: ClientId,
        video_on: Option<bool>,
        audio_on: Option<bool>,
    ) -> Result<()> {
        self.send(Command::MediaState {
            id,
            video_on,
            audio_on,
        })
        .await
    }

    pub async fn screen_sharing(&self, id: ClientId, on: bool) -> Result<()> {
        self.send(Command::ScreenSharing { id, on }).await
    }

    pub async fn learn_media_addr(
        &self,
        id: ClientId,
        kind: MediaKind,
        addr: SocketAddr,
    ) -> Result<()> {
        self.send(Command::LearnMediaAddr { id, kind, addr }).await
    }

    pub async fn request_presenter(&self, id: ClientId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RequestPresenter { id, reply }).await?;
        Ok(rx.await.map_err(|_| Error::RegistryGone)??)
    }

    pub async fn stop_presenting(&self, id: ClientId) -> Result<()> {
        self.send(Command::StopPresenting { id }).await
    }

    /// Apply a host command as `from`. The wire-level `permission_error` /
    /// notifications are emitted by the owner; the returned result mirrors
    /// them for embedding host consoles.
    pub async fn moderate(&self, from: ClientId, action: ModAction) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Moderate {
            from,
            action,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| Error::RegistryGone)??)
    }

    pub async fn file_offer(
        &self,
        id: ClientId,
        fid: String,
        filename: String,
        size: u64,
    ) -> Result<UploadTicket> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FileOffer {
            id,
            fid,
            filename,
            size,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| Error::RegistryGone)??)
    }

    pub async fn register_upload(&self, entry: FileEntry) -> Result<()> {
        self.send(Command::RegisterUpload { entry }).await
    }

    pub async fn release_fid(&self, fid: String) -> Result<()> {
        self.send(Command::ReleaseFid { fid }).await
    }

    pub async fn file_request(&self, id: ClientId, fid: String) -> Result<FileEntry> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FileRequest { id, fid, reply }).await?;
        Ok(rx.await.map_err(|_| Error::RegistryGone)??)
    }

    pub async fn files_list(&self, id: ClientId) -> Result<()> {
        self.send(Command::FilesList { id }).await
    }

    /// Rescan the spool (startup and host command), returning new entries.
    pub async fn scan_spool(&self) -> Result<Vec<FileInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ScanSpool { reply }).await?;
        rx.await.map_err(|_| Error::RegistryGone)
    }

    pub async fn sweep_stale(&self) -> Result<()> {
        self.send(Command::SweepStale).await
    }

    /// Broadcast `server_shutdown`, close every mailbox, and stop the owner.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| Error::RegistryGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::protocol::message::PermissionField;
    use crate::registry::moderation::ModAction;

    fn test_config() -> HubConfig {
        HubConfig::default()
            .max_participants(5)
            .chat_history_size(3)
            .host_name("host")
    }

    fn spawn_with(config: HubConfig) -> (RegistryHandle, Arc<Mailbox>) {
        let fanout = FanOut::new(Arc::new(HubMetrics::new()));
        let (handle, host_mailbox, _join) = Registry::spawn(Arc::new(config), fanout);
        (handle, host_mailbox)
    }

    fn spawn_registry() -> (RegistryHandle, Arc<Mailbox>) {
        spawn_with(test_config())
    }

    fn decode(frame: bytes::Bytes) -> Envelope {
        Envelope::from_slice(&frame[4..]).expect("valid envelope")
    }

    fn drain(mailbox: &Mailbox) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(frame) = mailbox.try_next() {
            out.push(decode(frame));
        }
        out
    }

    fn tags(envelopes: &[Envelope]) -> Vec<&'static str> {
        envelopes.iter().map(|e| e.body.tag()).collect()
    }

    /// Wait until every previously queued command has been processed. Any
    /// replying command works as a fence because the owner is FIFO.
    async fn fence(handle: &RegistryHandle) {
        let err = handle.file_request(HOST_CLIENT_ID, "no-such-fid".into()).await;
        assert!(err.is_err());
    }

    async fn admit(handle: &RegistryHandle, name: &str) -> (ClientId, Arc<Mailbox>) {
        let mailbox = Arc::new(Mailbox::new());
        let id = handle
            .admit(name.into(), None, mailbox.clone())
            .await
            .expect("admitted");
        (id, mailbox)
    }

    #[tokio::test]
    async fn test_admit_assigns_monotonic_ids() {
        let (handle, _host) = spawn_registry();

        let (a, _) = admit(&handle, "alice").await;
        let (b, _) = admit(&handle, "bob").await;

        assert_eq!(a, 1);
        assert_eq!(b, 2);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.len(), 3); // host + 2
        assert_eq!(snapshot.host_id, Some(HOST_CLIENT_ID));
    }

    #[tokio::test]
    async fn test_login_success_contents() {
        let (handle, _host) = spawn_registry();

        let (id, mailbox) = admit(&handle, "alice").await;
        let envelopes = drain(&mailbox);

        let ControlBody::LoginSuccess {
            client_id,
            ref participants,
            ref chat_history,
            ref shared_files,
            host_id,
        } = envelopes[0].body
        else {
            panic!("expected login_success, got {:?}", envelopes[0].body);
        };

        assert_eq!(client_id, id);
        assert_eq!(host_id, HOST_CLIENT_ID);
        assert!(chat_history.is_empty());
        assert!(shared_files.is_empty());

        // Roster includes the host and the new participant itself.
        let names: Vec<_> = participants.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["host", "alice"]);
        assert_eq!(participants[0].role, Role::Host);
    }

    #[tokio::test]
    async fn test_duplicate_names_get_distinct_ids() {
        let (handle, _host) = spawn_registry();

        let (a, _) = admit(&handle, "sam").await;
        let (b, _) = admit(&handle, "sam").await;

        assert_ne!(a, b);
        assert_eq!(handle.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_session_full_rejected() {
        let (handle, _host) = spawn_with(test_config().max_participants(2));

        admit(&handle, "alice").await;

        let mailbox = Arc::new(Mailbox::new());
        let err = handle.admit("late".into(), None, mailbox).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::SessionFull { max: 2 })
        ));
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (handle, _host) = spawn_registry();

        for bad in ["", "   ", &"x".repeat(51)] {
            let mailbox = Arc::new(Mailbox::new());
            let err = handle.admit(bad.into(), None, mailbox).await.unwrap_err();
            assert!(matches!(
                err,
                Error::Registry(RegistryError::InvalidName(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_user_joined_excludes_joiner() {
        let (handle, host) = spawn_registry();

        let (_, alice) = admit(&handle, "alice").await;
        drain(&alice);
        drain(&host);

        let (bob_id, bob) = admit(&handle, "bob").await;

        // Alice and the host see the join; Bob only sees login_success.
        let alice_envs = drain(&alice);
        assert_eq!(tags(&alice_envs), vec!["user_joined"]);
        let ControlBody::UserJoined { id, ref name } = alice_envs[0].body else {
            panic!("expected user_joined");
        };
        assert_eq!(id, bob_id);
        assert_eq!(name, "bob");

        assert_eq!(tags(&drain(&host)), vec!["user_joined"]);
        assert_eq!(tags(&drain(&bob)), vec!["login_success"]);
    }

    #[tokio::test]
    async fn test_chat_fanout_excludes_sender() {
        let (handle, host) = spawn_registry();

        let (alice_id, alice) = admit(&handle, "alice").await;
        drain(&alice);
        drain(&host);

        handle.chat(alice_id, "hi".into()).await.unwrap();
        fence(&handle).await;

        // Host receives the message with sender fields attached.
        let host_envs = drain(&host);
        assert_eq!(host_envs.len(), 1);
        let ControlBody::Chat {
            ref text,
            sender_id,
            ref sender_name,
        } = host_envs[0].body
        else {
            panic!("expected chat");
        };
        assert_eq!(text, "hi");
        assert_eq!(sender_id, Some(alice_id));
        assert_eq!(sender_name.as_deref(), Some("alice"));

        // The sender does not get its own message back.
        assert!(drain(&alice).is_empty());
    }

    #[tokio::test]
    async fn test_chat_history_replayed_and_ring_bounded() {
        let (handle, _host) = spawn_registry();
        let (alice_id, _alice) = admit(&handle, "alice").await;

        // Capacity is 3; send 4 so the first falls off.
        for n in 0..4 {
            handle.chat(alice_id, format!("m{}", n)).await.unwrap();
        }
        fence(&handle).await;

        let (_, bob) = admit(&handle, "bob").await;
        let envs = drain(&bob);
        let ControlBody::LoginSuccess {
            ref chat_history, ..
        } = envs[0].body
        else {
            panic!("expected login_success");
        };

        let texts: Vec<_> = chat_history.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_chat_without_permission_gets_error() {
        let (handle, host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        drain(&alice);
        drain(&host);

        handle
            .moderate(
                HOST_CLIENT_ID,
                ModAction::SetPermission {
                    target: alice_id,
                    field: PermissionField::MayChat,
                    value: false,
                },
            )
            .await
            .unwrap();
        drain(&alice);

        handle.chat(alice_id, "blocked".into()).await.unwrap();
        fence(&handle).await;

        assert_eq!(tags(&drain(&alice)), vec!["permission_error"]);
        // Never silently discarded, never fanned out.
        assert!(drain(&host).is_empty());
    }

    #[tokio::test]
    async fn test_chat_length_boundary() {
        let (handle, host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        drain(&alice);
        drain(&host);

        handle
            .chat(alice_id, "x".repeat(crate::MAX_CHAT_LEN))
            .await
            .unwrap();
        handle
            .chat(alice_id, "x".repeat(crate::MAX_CHAT_LEN + 1))
            .await
            .unwrap();
        fence(&handle).await;

        assert_eq!(tags(&drain(&host)), vec!["chat"]); // only the 4 KiB one
        assert_eq!(tags(&drain(&alice)), vec!["permission_error"]);
    }

    #[tokio::test]
    async fn test_presenter_arbitration() {
        let (handle, host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        let (bob_id, bob) = admit(&handle, "bob").await;
        drain(&alice);
        drain(&bob);
        drain(&host);

        handle.request_presenter(alice_id).await.unwrap();
        let err = handle.request_presenter(bob_id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::PresenterBusy)
        ));

        let alice_envs = drain(&alice);
        assert_eq!(tags(&alice_envs), vec!["presenter_granted", "presenter_changed"]);

        // Control lane drains before chat, so the denial comes out first.
        let bob_envs = drain(&bob);
        assert_eq!(tags(&bob_envs), vec!["presenter_denied", "presenter_changed"]);
        let ControlBody::PresenterDenied { ref reason } = bob_envs[0].body else {
            panic!("expected presenter_denied");
        };
        assert_eq!(reason, "busy");

        // Everyone (presenter included) saw the change.
        let host_envs = drain(&host);
        assert!(host_envs
            .iter()
            .any(|e| matches!(e.body, ControlBody::PresenterChanged { presenter_id: Some(id) } if id == alice_id)));

        assert_eq!(handle.snapshot().presenter_id, Some(alice_id));
        assert!(handle.snapshot().get(alice_id).unwrap().media_state.is_presenter);
    }

    #[tokio::test]
    async fn test_stop_presenting_clears_slot() {
        let (handle, host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        handle.request_presenter(alice_id).await.unwrap();
        drain(&alice);
        drain(&host);

        handle.stop_presenting(alice_id).await.unwrap();
        fence(&handle).await;

        assert_eq!(handle.snapshot().presenter_id, None);
        let host_envs = drain(&host);
        assert!(host_envs
            .iter()
            .any(|e| matches!(e.body, ControlBody::PresenterChanged { presenter_id: None })));
    }

    #[tokio::test]
    async fn test_denied_without_screen_permission() {
        let (handle, _host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;

        handle
            .moderate(
                HOST_CLIENT_ID,
                ModAction::SetPermission {
                    target: alice_id,
                    field: PermissionField::MayScreenShare,
                    value: false,
                },
            )
            .await
            .unwrap();
        drain(&alice);

        let err = handle.request_presenter(alice_id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::PermissionDenied(_))
        ));
        assert_eq!(tags(&drain(&alice)), vec!["presenter_denied"]);
        assert_eq!(handle.snapshot().presenter_id, None);
    }

    #[tokio::test]
    async fn test_force_mute_notifies_and_broadcasts() {
        let (handle, host) = spawn_registry();
        let (_alice_id, alice) = admit(&handle, "alice").await;
        let (bob_id, bob) = admit(&handle, "bob").await;

        handle.media_state(bob_id, None, Some(true)).await.unwrap();
        fence(&handle).await;
        assert!(handle.snapshot().get(bob_id).unwrap().media_state.audio_on);
        drain(&alice);
        drain(&bob);
        drain(&host);

        handle
            .moderate(HOST_CLIENT_ID, ModAction::Mute { target: Some(bob_id) })
            .await
            .unwrap();

        assert!(!handle.snapshot().get(bob_id).unwrap().media_state.audio_on);

        // Target gets the forced notification plus the roster delta.
        assert_eq!(tags(&drain(&bob)), vec!["force_mute", "media_state"]);

        // Everyone else just sees the delta.
        let alice_envs = drain(&alice);
        assert_eq!(tags(&alice_envs), vec!["media_state"]);
        let ControlBody::MediaState { id, audio_on, .. } = alice_envs[0].body else {
            panic!("expected media_state");
        };
        assert_eq!(id, Some(bob_id));
        assert_eq!(audio_on, Some(false));
    }

    #[tokio::test]
    async fn test_force_mute_all_spares_host() {
        let (handle, _host) = spawn_registry();
        let (alice_id, _alice) = admit(&handle, "alice").await;
        let (bob_id, _bob) = admit(&handle, "bob").await;

        handle.media_state(alice_id, None, Some(true)).await.unwrap();
        handle.media_state(bob_id, None, Some(true)).await.unwrap();
        fence(&handle).await;

        handle
            .moderate(HOST_CLIENT_ID, ModAction::Mute { target: None })
            .await
            .unwrap();

        let snapshot = handle.snapshot();
        assert!(!snapshot.get(alice_id).unwrap().media_state.audio_on);
        assert!(!snapshot.get(bob_id).unwrap().media_state.audio_on);
    }

    #[tokio::test]
    async fn test_media_state_clamped_by_permission() {
        let (handle, _host) = spawn_registry();
        let (alice_id, _alice) = admit(&handle, "alice").await;

        handle
            .moderate(
                HOST_CLIENT_ID,
                ModAction::SetPermission {
                    target: alice_id,
                    field: PermissionField::MayVideo,
                    value: false,
                },
            )
            .await
            .unwrap();

        handle.media_state(alice_id, Some(true), None).await.unwrap();
        fence(&handle).await;

        assert!(!handle.snapshot().get(alice_id).unwrap().media_state.video_on);
    }

    #[tokio::test]
    async fn test_set_permission_idempotent() {
        let (handle, _host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        drain(&alice);

        let action = ModAction::SetPermission {
            target: alice_id,
            field: PermissionField::MayUpload,
            value: false,
        };
        handle.moderate(HOST_CLIENT_ID, action.clone()).await.unwrap();
        assert_eq!(tags(&drain(&alice)), vec!["set_permission"]);

        // Second identical command: no additional notification.
        handle.moderate(HOST_CLIENT_ID, action).await.unwrap();
        assert!(drain(&alice).is_empty());
    }

    #[tokio::test]
    async fn test_revoking_screen_share_force_stops_presenter() {
        let (handle, host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        handle.request_presenter(alice_id).await.unwrap();
        drain(&alice);
        drain(&host);

        handle
            .moderate(
                HOST_CLIENT_ID,
                ModAction::SetPermission {
                    target: alice_id,
                    field: PermissionField::MayScreenShare,
                    value: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(handle.snapshot().presenter_id, None);
        assert_eq!(
            tags(&drain(&alice)),
            vec!["set_permission", "force_stop_presenting", "presenter_changed"]
        );
    }

    #[tokio::test]
    async fn test_kick_notifies_then_removes() {
        let (handle, host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        let (bob_id, bob) = admit(&handle, "bob").await;
        drain(&alice);
        drain(&bob);
        drain(&host);

        handle
            .moderate(HOST_CLIENT_ID, ModAction::Kick { target: bob_id })
            .await
            .unwrap();

        assert!(handle.snapshot().get(bob_id).is_none());
        assert!(handle.snapshot().get(alice_id).is_some());

        // Kicked participant got the notice before its mailbox closed.
        assert_eq!(tags(&drain(&bob)), vec!["kick"]);

        let alice_envs = drain(&alice);
        assert!(alice_envs.iter().any(|e| matches!(
            e.body,
            ControlBody::UserLeft { id, ref reason, .. }
                if id == bob_id && reason.as_deref() == Some("kicked")
        )));
    }

    #[tokio::test]
    async fn test_non_host_moderation_rejected() {
        let (handle, _host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        let (bob_id, bob) = admit(&handle, "bob").await;
        drain(&alice);
        drain(&bob);

        let err = handle
            .moderate(alice_id, ModAction::Mute { target: Some(bob_id) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::NotHost(_))));

        assert_eq!(tags(&drain(&alice)), vec!["permission_error"]);
        assert!(drain(&bob).is_empty());
        assert!(handle.snapshot().get(bob_id).is_some());
    }

    #[tokio::test]
    async fn test_host_logout_promotes_oldest() {
        let (handle, host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        let (bob_id, bob) = admit(&handle, "bob").await;
        drain(&alice);
        drain(&bob);
        drain(&host);

        handle.remove(HOST_CLIENT_ID, LeaveReason::Logout).await.unwrap();
        fence(&handle).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.host_id, Some(alice_id));
        assert_eq!(snapshot.get(alice_id).unwrap().role, Role::Host);
        assert_eq!(snapshot.get(bob_id).unwrap().role, Role::Guest);

        let bob_envs = drain(&bob);
        assert!(bob_envs.iter().any(|e| matches!(
            e.body,
            ControlBody::UserLeft { id: 0, ref reason, .. } if reason.is_none()
        )));
        assert!(bob_envs.iter().any(|e| matches!(
            e.body,
            ControlBody::HostChanged { host_id } if host_id == alice_id
        )));
    }

    #[tokio::test]
    async fn test_explicit_host_transfer() {
        let (handle, host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        drain(&alice);
        drain(&host);

        handle
            .moderate(HOST_CLIENT_ID, ModAction::TransferHost { target: alice_id })
            .await
            .unwrap();

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.host_id, Some(alice_id));
        assert_eq!(snapshot.get(HOST_CLIENT_ID).unwrap().role, Role::Guest);

        let alice_envs = drain(&alice);
        assert!(alice_envs.iter().any(|e| matches!(
            e.body,
            ControlBody::HostChanged { host_id } if host_id == alice_id
        )));

        // The demoted participant has no moderation authority left.
        let err = handle
            .moderate(HOST_CLIENT_ID, ModAction::Mute { target: Some(alice_id) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::NotHost(_))));
    }

    #[tokio::test]
    async fn test_presenter_slot_survives_host_transfer() {
        let (handle, _host) = spawn_registry();
        let (alice_id, _alice) = admit(&handle, "alice").await;
        let (bob_id, _bob) = admit(&handle, "bob").await;

        handle.request_presenter(bob_id).await.unwrap();
        handle.remove(HOST_CLIENT_ID, LeaveReason::Logout).await.unwrap();
        fence(&handle).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.host_id, Some(alice_id));
        assert_eq!(snapshot.presenter_id, Some(bob_id));
    }

    #[tokio::test]
    async fn test_presenter_removal_clears_slot() {
        let (handle, host) = spawn_registry();
        let (alice_id, _alice) = admit(&handle, "alice").await;
        handle.request_presenter(alice_id).await.unwrap();
        drain(&host);

        handle.remove(alice_id, LeaveReason::ConnectionError).await.unwrap();
        fence(&handle).await;

        assert_eq!(handle.snapshot().presenter_id, None);
        let host_envs = drain(&host);
        assert!(host_envs
            .iter()
            .any(|e| matches!(e.body, ControlBody::PresenterChanged { presenter_id: None })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_silent_participants() {
        let (handle, host) = spawn_with(
            test_config().heartbeat_timeouts(Duration::from_secs(20), Duration::from_secs(30)),
        );
        let (alice_id, alice) = admit(&handle, "alice").await;
        drain(&alice);
        drain(&host);

        // Quiet for 10 s, then a heartbeat, then silence past the hard limit.
        tokio::time::advance(Duration::from_secs(10)).await;
        handle.heartbeat(alice_id).await.unwrap();
        handle.sweep_stale().await.unwrap();
        fence(&handle).await;
        assert!(handle.snapshot().get(alice_id).is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        handle.sweep_stale().await.unwrap();
        fence(&handle).await;

        assert!(handle.snapshot().get(alice_id).is_none());
        let host_envs = drain(&host);
        assert!(host_envs.iter().any(|e| matches!(
            e.body,
            ControlBody::UserLeft { id, ref reason, .. }
                if id == alice_id && reason.as_deref() == Some("timeout")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_exempt_from_sweep() {
        let (handle, _host) = spawn_registry();

        tokio::time::advance(Duration::from_secs(3600)).await;
        handle.sweep_stale().await.unwrap();
        fence(&handle).await;

        assert!(handle.snapshot().get(HOST_CLIENT_ID).is_some());
    }

    #[tokio::test]
    async fn test_learn_media_addr_and_rebind() {
        let (handle, _host) = spawn_registry();
        let (alice_id, _alice) = admit(&handle, "alice").await;

        let addr_a: SocketAddr = "10.1.1.1:4000".parse().unwrap();
        let addr_b: SocketAddr = "10.1.1.1:4001".parse().unwrap();

        handle
            .learn_media_addr(alice_id, MediaKind::Video, addr_a)
            .await
            .unwrap();
        fence(&handle).await;
        assert_eq!(handle.snapshot().get(alice_id).unwrap().video_addr, Some(addr_a));
        assert_eq!(handle.snapshot().get(alice_id).unwrap().audio_addr, None);

        // NAT rebind within the LAN: the newer endpoint wins.
        handle
            .learn_media_addr(alice_id, MediaKind::Video, addr_b)
            .await
            .unwrap();
        fence(&handle).await;
        assert_eq!(handle.snapshot().get(alice_id).unwrap().video_addr, Some(addr_b));
    }

    #[tokio::test]
    async fn test_file_offer_validations() {
        let (handle, _host) = spawn_with(test_config().max_file_size(1000));
        let (alice_id, _alice) = admit(&handle, "alice").await;

        // Happy path reserves the fid.
        let ticket = handle
            .file_offer(alice_id, "f1".into(), "notes.txt".into(), 1000)
            .await
            .unwrap();
        assert_eq!(ticket.fid, "f1");
        assert_eq!(ticket.uploader_name, "alice");

        // Duplicate fid.
        let err = handle
            .file_offer(alice_id, "f1".into(), "notes.txt".into(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::FidTaken(_))));

        // One byte over the limit.
        let err = handle
            .file_offer(alice_id, "f2".into(), "big.bin".into(), 1001)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::FileTooLarge { size: 1001, max: 1000 })
        ));

        // Path-traversal filename.
        let err = handle
            .file_offer(alice_id, "f3".into(), "../../etc/passwd".into(), 10)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::InvalidFilename(_))
        ));

        // Garbage fid.
        let err = handle
            .file_offer(alice_id, "a/b".into(), "ok.txt".into(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::InvalidFid(_))));

        // Released fids become available again.
        handle.release_fid("f1".into()).await.unwrap();
        handle
            .file_offer(alice_id, "f1".into(), "notes.txt".into(), 10)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_upload_broadcasts_file_available() {
        let (handle, host) = spawn_registry();
        let (alice_id, alice) = admit(&handle, "alice").await;
        drain(&alice);
        drain(&host);

        let ticket = handle
            .file_offer(alice_id, "f1".into(), "notes.txt".into(), 11)
            .await
            .unwrap();
        handle
            .register_upload(FileEntry {
                fid: ticket.fid.clone(),
                filename: ticket.filename.clone(),
                size: 11,
                uploader_name: ticket.uploader_name.clone(),
                uploader_id: Some(alice_id),
                path: std::path::PathBuf::from("/tmp/f1_notes.txt"),
                uploaded_at: chrono::Utc::now().to_rfc3339(),
            })
            .await
            .unwrap();
        fence(&handle).await;

        for mailbox in [&host, &alice] {
            let envs = drain(mailbox);
            assert!(envs.iter().any(|e| matches!(
                e.body,
                ControlBody::FileAvailable { ref fid, size: 11, .. } if fid == "f1"
            )));
        }

        // Download validation sees the entry now.
        let entry = handle.file_request(alice_id, "f1".into()).await.unwrap();
        assert_eq!(entry.size, 11);

        // files_list reflects exactly the registered set.
        handle.files_list(alice_id).await.unwrap();
        fence(&handle).await;
        let envs = drain(&alice);
        let ControlBody::FilesListUpdate { ref shared_files } = envs[0].body else {
            panic!("expected files_list_update");
        };
        assert_eq!(shared_files.len(), 1);
        assert!(shared_files.contains_key("f1"));
    }

    #[tokio::test]
    async fn test_download_permission_enforced() {
        let (handle, _host) = spawn_registry();
        let (alice_id, _alice) = admit(&handle, "alice").await;

        handle
            .moderate(
                HOST_CLIENT_ID,
                ModAction::SetPermission {
                    target: alice_id,
                    field: PermissionField::MayDownload,
                    value: false,
                },
            )
            .await
            .unwrap();

        let err = handle.file_request(alice_id, "any".into()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_closes() {
        let (handle, host) = spawn_registry();
        let (_, alice) = admit(&handle, "alice").await;
        drain(&alice);
        drain(&host);

        handle.shutdown().await.unwrap();

        assert_eq!(tags(&drain(&alice)), vec!["server_shutdown"]);
        assert!(alice.is_closed());
        assert!(host.is_closed());

        // The owner stops taking commands once its task winds down.
        let mut closed = false;
        for _ in 0..100 {
            if handle.heartbeat(0).await.is_err() {
                closed = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(closed);
    }
}
