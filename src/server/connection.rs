//! Per-participant control connection handling
//!
//! Each accepted connection gets two independent tasks: a reader that
//! decodes framed records and routes them, and a writer that drains the
//! participant's mailbox. A stalled writer never blocks the reader; a
//! writer that misses the hard deadline evicts the participant.
//!
//! The first frame must be `login`. Anything else, or a framing error at
//! any point, closes the connection; policy failures inside a valid
//! session get typed replies and the connection lives on.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::Error;
use crate::fanout::engine::FanOut;
use crate::fanout::queues::Mailbox;
use crate::protocol::frame::{encode_frame, read_frame, write_frame};
use crate::protocol::message::{ControlBody, Envelope};
use crate::registry::moderation::ModAction;
use crate::registry::participant::ClientId;
use crate::registry::store::{LeaveReason, RegistryHandle};
use crate::server::config::HubConfig;
use crate::server::transfer::FileMediator;

/// Everything a connection task needs, cloned per accept.
#[derive(Clone)]
pub(crate) struct ConnectionCtx {
    pub config: Arc<HubConfig>,
    pub registry: RegistryHandle,
    pub fanout: FanOut,
    pub transfer: FileMediator,
    pub shutdown: watch::Receiver<bool>,
}

/// Drive one control connection from accept to teardown.
pub(crate) async fn run_connection(stream: TcpStream, peer: SocketAddr, ctx: ConnectionCtx) {
    let (mut reader, mut writer) = stream.into_split();

    let id = match login(&mut reader, &mut writer, peer, &ctx).await {
        Some((id, mailbox)) => {
            let writer_handle = tokio::spawn(writer_task(
                writer,
                mailbox.clone(),
                ctx.config.clone(),
                ctx.registry.clone(),
                id,
            ));

            let reason = read_loop(&mut reader, id, &mailbox, &ctx).await;
            if let Some(reason) = reason {
                let _ = ctx.registry.remove(id, reason).await;
            }
            // The remove above closed the mailbox; the writer flushes what
            // is queued and exits on its own.
            let _ = writer_handle.await;
            id
        }
        None => return,
    };

    debug!(id, peer = %peer, "Connection finished");
}

/// Handshake: the first frame must be a `login`; reply `login_error` and
/// close on rejection.
async fn login(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    peer: SocketAddr,
    ctx: &ConnectionCtx,
) -> Option<(ClientId, Arc<Mailbox>)> {
    let payload = match read_frame(reader, ctx.config.max_frame_size, ctx.config.read_timeout).await
    {
        Ok(payload) => payload,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Connection dropped before login");
            return None;
        }
    };

    let name = match Envelope::from_slice(&payload) {
        Ok(Envelope {
            body: ControlBody::Login { name },
            ..
        }) => name,
        Ok(env) => {
            warn!(peer = %peer, tag = env.body.tag(), "First frame was not login");
            send_direct(
                writer,
                ControlBody::LoginError {
                    reason: "login required".into(),
                },
            )
            .await;
            return None;
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "Malformed login frame");
            return None;
        }
    };

    let mailbox = Arc::new(Mailbox::new());
    match ctx
        .registry
        .admit(name, Some(peer), mailbox.clone())
        .await
    {
        Ok(id) => Some((id, mailbox)),
        Err(Error::Registry(err)) => {
            send_direct(
                writer,
                ControlBody::LoginError {
                    reason: err.to_string(),
                },
            )
            .await;
            None
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "Admission failed");
            None
        }
    }
}

/// One-off reply on a connection that has no writer task yet.
async fn send_direct(writer: &mut OwnedWriteHalf, body: ControlBody) {
    if let Ok(payload) = Envelope::now(body).to_bytes() {
        let _ = write_frame(writer, &payload).await;
    }
}

/// Framed-record loop. Returns the reason the registry should record, or
/// `None` when removal already happened (logout, shutdown).
async fn read_loop(
    reader: &mut OwnedReadHalf,
    id: ClientId,
    mailbox: &Arc<Mailbox>,
    ctx: &ConnectionCtx,
) -> Option<LeaveReason> {
    let mut shutdown = ctx.shutdown.clone();

    loop {
        let payload = tokio::select! {
            result = read_frame(reader, ctx.config.max_frame_size, ctx.config.read_timeout) => {
                match result {
                    Ok(payload) => payload,
                    Err(Error::ConnectionClosed) => {
                        debug!(id, "Peer closed the control connection");
                        return Some(LeaveReason::ConnectionError);
                    }
                    Err(e) => {
                        warn!(id, error = %e, "Control read failed, closing");
                        return Some(LeaveReason::ConnectionError);
                    }
                }
            }
            _ = shutdown.changed() => return None,
        };

        let env = match Envelope::from_slice(&payload) {
            Ok(env) => env,
            Err(e) => {
                // Any framing/parse error invalidates the only
                // synchronization point we have; close.
                warn!(id, error = %e, "Malformed control record, closing");
                return Some(LeaveReason::ConnectionError);
            }
        };

        if dispatch(env, payload, id, mailbox, ctx).await.is_err() {
            return Some(LeaveReason::ConnectionError);
        }
        if mailbox.is_closed() {
            // Registry-side removal (kick, timeout, overflow) already
            // happened; the socket is on its way out.
            return None;
        }
    }
}

/// Route one inbound record. `Err` means the registry is gone and the
/// connection should die; policy problems never surface here.
async fn dispatch(
    env: Envelope,
    raw_payload: Bytes,
    id: ClientId,
    mailbox: &Arc<Mailbox>,
    ctx: &ConnectionCtx,
) -> crate::Result<()> {
    match env.body {
        ControlBody::Logout => {
            ctx.registry.remove(id, LeaveReason::Logout).await?;
            Err(Error::ConnectionClosed)
        }

        ControlBody::Heartbeat => ctx.registry.heartbeat(id).await,

        ControlBody::Chat { text, .. } => ctx.registry.chat(id, text).await,

        ControlBody::MediaState {
            video_on, audio_on, ..
        } => ctx.registry.media_state(id, video_on, audio_on).await,

        ControlBody::RequestPresenter => {
            // Denials are delivered on the wire by the owner.
            match ctx.registry.request_presenter(id).await {
                Ok(()) | Err(Error::Registry(_)) => Ok(()),
                Err(e) => Err(e),
            }
        }

        ControlBody::StopPresenting => ctx.registry.stop_presenting(id).await,

        ControlBody::ScreenFrame { .. } => relay_screen_frame(id, raw_payload, ctx).await,

        ControlBody::ForceMute { target_client } => {
            moderate(ctx, id, ModAction::Mute { target: target_client }).await
        }
        ControlBody::ForceMuteAll => moderate(ctx, id, ModAction::Mute { target: None }).await,
        ControlBody::ForceVideoOff { target_client } => {
            moderate(ctx, id, ModAction::VideoOff { target: target_client }).await
        }
        ControlBody::ForceVideoOffAll => {
            moderate(ctx, id, ModAction::VideoOff { target: None }).await
        }
        ControlBody::ForceStopPresenting { target_client } => {
            moderate(ctx, id, ModAction::StopPresenting { target: target_client }).await
        }
        ControlBody::ForceStopScreenSharing { target_client } => {
            moderate(
                ctx,
                id,
                ModAction::StopScreenSharing { target: target_client },
            )
            .await
        }
        ControlBody::SetPermission {
            target,
            field,
            value,
        } => {
            moderate(
                ctx,
                id,
                ModAction::SetPermission {
                    target,
                    field,
                    value,
                },
            )
            .await
        }
        ControlBody::Kick { target } => moderate(ctx, id, ModAction::Kick { target }).await,
        ControlBody::HostRequest {
            target_client,
            request_type,
            message,
        } => {
            moderate(
                ctx,
                id,
                ModAction::Request {
                    target: target_client,
                    request_type,
                    message,
                },
            )
            .await
        }

        ControlBody::FileOffer {
            fid,
            filename,
            size,
        } => {
            ctx.transfer
                .begin_upload(id, fid, filename, size, mailbox)
                .await;
            Ok(())
        }
        ControlBody::FileRequest { fid } => {
            ctx.transfer.begin_download(id, fid, mailbox).await;
            Ok(())
        }
        ControlBody::GetFilesList => ctx.registry.files_list(id).await,

        ControlBody::Login { .. } => {
            debug!(id, "Duplicate login ignored");
            Ok(())
        }

        ControlBody::Unknown => {
            warn!(id, "Unknown control record type ignored");
            Ok(())
        }

        // Server-originated tags arriving from a client are nonsense;
        // tolerate them like unknown tags rather than dropping the peer.
        other => {
            warn!(id, tag = other.tag(), "Ignoring server-only record from client");
            Ok(())
        }
    }
}

async fn moderate(ctx: &ConnectionCtx, from: ClientId, action: ModAction) -> crate::Result<()> {
    // Rejections reach the sender as permission_error via the owner.
    match ctx.registry.moderate(from, action).await {
        Ok(()) | Err(Error::Registry(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Screen frames are relayed byte-for-byte: the presenter's own payload is
/// re-framed and dropped into every latest-wins slot. Frames from anyone
/// who is not the permitted presenter are dropped by policy.
async fn relay_screen_frame(id: ClientId, payload: Bytes, ctx: &ConnectionCtx) -> crate::Result<()> {
    let snapshot = ctx.registry.snapshot();
    let Some(sender) = snapshot.get(id) else {
        return Ok(());
    };

    if !(sender.media_state.is_presenter && sender.permissions.may_screen_share) {
        debug!(id, "Dropping screen frame from non-presenter");
        return Ok(());
    }

    if !sender.media_state.screen_sharing {
        // First frame of a share: mirror the flag into the roster.
        ctx.registry.screen_sharing(id, true).await?;
    }

    ctx.fanout
        .screen_broadcast(&snapshot, id, encode_frame(&payload));
    Ok(())
}

/// Drain the mailbox onto the socket. Soft deadline logs, hard deadline
/// evicts. Exits once the mailbox is closed and empty.
async fn writer_task(
    mut writer: OwnedWriteHalf,
    mailbox: Arc<Mailbox>,
    config: Arc<HubConfig>,
    registry: RegistryHandle,
    id: ClientId,
) {
    use tokio::io::AsyncWriteExt;

    while let Some(frame) = mailbox.next().await {
        let write = writer.write_all(&frame);
        tokio::pin!(write);

        match timeout(config.write_soft_timeout, &mut write).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => {
                debug!(id, error = %e, "Control write failed");
                let _ = registry.remove(id, LeaveReason::ConnectionError).await;
                break;
            }
            Err(_) => {
                warn!(id, "Control write exceeded soft deadline");
            }
        }

        let remaining = config
            .write_hard_timeout
            .saturating_sub(config.write_soft_timeout);
        match timeout(remaining, &mut write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(id, error = %e, "Control write failed");
                let _ = registry.remove(id, LeaveReason::ConnectionError).await;
                break;
            }
            Err(_) => {
                warn!(id, "Control write exceeded hard deadline, evicting");
                let _ = registry.remove(id, LeaveReason::ConnectionError).await;
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}
