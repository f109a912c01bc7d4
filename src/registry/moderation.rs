//! Moderation commands and presenter arbitration
//!
//! Runs on the registry owner task, so every transition is serialized: two
//! simultaneous `request_presenter` commands resolve in arrival order, and a
//! forced state change mutates the roster, notifies the target, and
//! broadcasts the delta before the next command is looked at.
//!
//! Every forced change produces two effects: a typed notification to the
//! affected participant (so their client stops capturing) and a compact
//! `media_state` / `presenter_changed` broadcast (so rosters stay
//! consistent everywhere).

use tracing::info;

use crate::protocol::message::{ControlBody, PermissionField};
use crate::registry::error::RegistryError;
use crate::registry::participant::{ClientId, Role};
use crate::registry::store::{LeaveReason, RegistryState};

/// A host-privileged action, as issued over the wire or by an embedding
/// host console.
#[derive(Debug, Clone)]
pub enum ModAction {
    /// `force_mute` / `force_mute_all` when target is `None`.
    Mute { target: Option<ClientId> },
    /// `force_video_off` / `force_video_off_all` when target is `None`.
    VideoOff { target: Option<ClientId> },
    /// `force_stop_presenting`, optionally checked against a target.
    StopPresenting { target: Option<ClientId> },
    /// `force_stop_screen_sharing`; defaults to the current presenter.
    StopScreenSharing { target: Option<ClientId> },
    /// `set_permission`.
    SetPermission {
        target: ClientId,
        field: PermissionField,
        value: bool,
    },
    /// `kick`.
    Kick { target: ClientId },
    /// Hand the host role to another participant (console-initiated; the
    /// demotion and promotion happen in one step).
    TransferHost { target: ClientId },
    /// `host_request`: a non-forcing prompt relayed to the target.
    Request {
        target: ClientId,
        request_type: String,
        message: String,
    },
}

/// Validate and apply a host command. Non-host senders and bad targets get
/// a `permission_error` reply; the result mirrors the wire outcome.
pub(crate) fn apply(
    state: &mut RegistryState,
    from: ClientId,
    action: ModAction,
) -> Result<(), RegistryError> {
    let result = require_host(state, from).and_then(|_| dispatch(state, from, action));
    if let Err(ref err) = result {
        state.send_permission_error(from, err);
    }
    result
}

fn require_host(state: &RegistryState, from: ClientId) -> Result<(), RegistryError> {
    match state.participants.get(&from) {
        None => Err(RegistryError::UnknownParticipant(from)),
        Some(p) if p.role != Role::Host => Err(RegistryError::NotHost(from)),
        Some(_) => Ok(()),
    }
}

fn dispatch(
    state: &mut RegistryState,
    from: ClientId,
    action: ModAction,
) -> Result<(), RegistryError> {
    match action {
        ModAction::Mute { target } => force_media_off(state, from, target, Medium::Audio),
        ModAction::VideoOff { target } => force_media_off(state, from, target, Medium::Video),
        ModAction::StopPresenting { target } => force_stop_presenting(state, target),
        ModAction::StopScreenSharing { target } => force_stop_screen_sharing(state, target),
        ModAction::SetPermission {
            target,
            field,
            value,
        } => set_permission(state, target, field, value),
        ModAction::Kick { target } => kick(state, from, target),
        ModAction::TransferHost { target } => transfer_host(state, from, target),
        ModAction::Request {
            target,
            request_type,
            message,
        } => host_request(state, target, request_type, message),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Medium {
    Audio,
    Video,
}

/// Force one participant's (or, with no target, every other participant's)
/// audio or video off.
fn force_media_off(
    state: &mut RegistryState,
    from: ClientId,
    target: Option<ClientId>,
    medium: Medium,
) -> Result<(), RegistryError> {
    match target {
        Some(target) => {
            if !state.participants.contains_key(&target) {
                return Err(RegistryError::UnknownParticipant(target));
            }
            media_off_one(state, target, medium);
            Ok(())
        }
        None => {
            let mut targets: Vec<ClientId> = state
                .participants
                .keys()
                .copied()
                .filter(|&id| id != from)
                .collect();
            targets.sort_unstable();
            for id in targets {
                media_off_one(state, id, medium);
            }
            Ok(())
        }
    }
}

fn media_off_one(state: &mut RegistryState, target: ClientId, medium: Medium) {
    {
        let Some(p) = state.participants.get_mut(&target) else {
            return;
        };
        match medium {
            Medium::Audio => p.media_state.audio_on = false,
            Medium::Video => p.media_state.video_on = false,
        }
    }
    state.publish();

    let (notification, delta) = match medium {
        Medium::Audio => (
            ControlBody::ForceMute {
                target_client: Some(target),
            },
            ControlBody::MediaState {
                id: Some(target),
                video_on: None,
                audio_on: Some(false),
            },
        ),
        Medium::Video => (
            ControlBody::ForceVideoOff {
                target_client: Some(target),
            },
            ControlBody::MediaState {
                id: Some(target),
                video_on: Some(false),
                audio_on: None,
            },
        ),
    };
    info!(target, ?medium, "Forced media off");
    state.send_control(target, notification);
    state.broadcast_chat(None, delta);
}

fn force_stop_presenting(
    state: &mut RegistryState,
    target: Option<ClientId>,
) -> Result<(), RegistryError> {
    let Some(holder) = state.presenter.holder() else {
        return Ok(());
    };
    if let Some(target) = target {
        if target != holder {
            return Ok(());
        }
    }
    end_presentation(state, holder, true);
    Ok(())
}

fn force_stop_screen_sharing(
    state: &mut RegistryState,
    target: Option<ClientId>,
) -> Result<(), RegistryError> {
    let Some(target) = target.or_else(|| state.presenter.holder()) else {
        return Ok(());
    };
    let Some(p) = state.participants.get_mut(&target) else {
        return Err(RegistryError::UnknownParticipant(target));
    };
    p.media_state.screen_sharing = false;
    state.publish();
    state.send_control(
        target,
        ControlBody::ForceStopScreenSharing {
            target_client: Some(target),
        },
    );
    Ok(())
}

fn set_permission(
    state: &mut RegistryState,
    target: ClientId,
    field: PermissionField,
    value: bool,
) -> Result<(), RegistryError> {
    let changed = {
        let Some(p) = state.participants.get_mut(&target) else {
            return Err(RegistryError::UnknownParticipant(target));
        };
        p.permissions.set(field, value)
    };
    // Idempotent: re-applying the current value produces no broadcast.
    if !changed {
        return Ok(());
    }

    state.publish();
    info!(target, ?field, value, "Permission updated");
    state.send_control(
        target,
        ControlBody::SetPermission {
            target,
            field,
            value,
        },
    );

    // Revoking a permission forces the medium off in the same step; the
    // client cannot keep streaming something it is no longer allowed to.
    if !value {
        match field {
            PermissionField::MayAudio => {
                if on(state, target, Medium::Audio) {
                    media_off_one(state, target, Medium::Audio);
                }
            }
            PermissionField::MayVideo => {
                if on(state, target, Medium::Video) {
                    media_off_one(state, target, Medium::Video);
                }
            }
            PermissionField::MayScreenShare => {
                if state.presenter.is_held_by(target) {
                    end_presentation(state, target, true);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn on(state: &RegistryState, id: ClientId, medium: Medium) -> bool {
    state.participants.get(&id).is_some_and(|p| match medium {
        Medium::Audio => p.media_state.audio_on,
        Medium::Video => p.media_state.video_on,
    })
}

fn kick(state: &mut RegistryState, from: ClientId, target: ClientId) -> Result<(), RegistryError> {
    if target == from {
        return Err(RegistryError::PermissionDenied("kicking yourself"));
    }
    if !state.participants.contains_key(&target) {
        return Err(RegistryError::UnknownParticipant(target));
    }

    info!(target, "Participant kicked by host");
    // Notification first; the mailbox flushes it before the writer exits.
    state.send_control(target, ControlBody::Kick { target });
    state.remove(target, LeaveReason::Kicked);
    Ok(())
}

fn transfer_host(
    state: &mut RegistryState,
    from: ClientId,
    target: ClientId,
) -> Result<(), RegistryError> {
    if target == from {
        return Ok(());
    }
    if !state.participants.contains_key(&target) {
        return Err(RegistryError::UnknownParticipant(target));
    }

    if let Some(p) = state.participants.get_mut(&from) {
        p.role = Role::Guest;
    }
    if let Some(p) = state.participants.get_mut(&target) {
        p.role = Role::Host;
    }
    state.publish();
    info!(from, target, "Host role transferred");
    state.broadcast_chat(None, ControlBody::HostChanged { host_id: target });
    Ok(())
}

fn host_request(
    state: &mut RegistryState,
    target: ClientId,
    request_type: String,
    message: String,
) -> Result<(), RegistryError> {
    if !state.participants.contains_key(&target) {
        return Err(RegistryError::UnknownParticipant(target));
    }
    state.send_control(
        target,
        ControlBody::HostRequest {
            target_client: target,
            request_type,
            message,
        },
    );
    Ok(())
}

/// `request_presenter`: grant when the slot is empty and the requester may
/// screen-share, otherwise reply `presenter_denied`.
pub(crate) fn request_presenter(
    state: &mut RegistryState,
    id: ClientId,
) -> Result<(), RegistryError> {
    let Some(p) = state.participants.get(&id) else {
        return Err(RegistryError::UnknownParticipant(id));
    };
    if !p.permissions.may_screen_share {
        state.send_control(
            id,
            ControlBody::PresenterDenied {
                reason: "screen sharing not allowed".into(),
            },
        );
        return Err(RegistryError::PermissionDenied("screen sharing"));
    }

    match state.presenter.request(id) {
        Ok(()) => {
            if let Some(p) = state.participants.get_mut(&id) {
                p.media_state.is_presenter = true;
            }
            state.publish();
            info!(id, "Presenter granted");
            state.send_control(id, ControlBody::PresenterGranted);
            state.broadcast_chat(
                None,
                ControlBody::PresenterChanged {
                    presenter_id: Some(id),
                },
            );
            Ok(())
        }
        Err(err) => {
            state.send_control(
                id,
                ControlBody::PresenterDenied {
                    reason: "busy".into(),
                },
            );
            Err(err)
        }
    }
}

/// Voluntary `stop_presenting`. Ignored unless the sender holds the slot.
pub(crate) fn stop_presenting(state: &mut RegistryState, id: ClientId) {
    if state.presenter.is_held_by(id) {
        end_presentation(state, id, false);
    }
}

fn end_presentation(state: &mut RegistryState, holder: ClientId, forced: bool) {
    state.presenter.release_if(holder);
    if let Some(p) = state.participants.get_mut(&holder) {
        p.media_state.is_presenter = false;
        p.media_state.screen_sharing = false;
    }
    state.publish();
    info!(holder, forced, "Presentation ended");

    if forced {
        state.send_control(
            holder,
            ControlBody::ForceStopPresenting {
                target_client: Some(holder),
            },
        );
    }
    state.broadcast_chat(None, ControlBody::PresenterChanged { presenter_id: None });
}
