//! Recipient computation and dispatch
//!
//! The single point through which every outbound record reaches a mailbox.
//! Callers pass a roster [`Snapshot`]; the engine encodes the record once
//! and enqueues the shared buffer per recipient. Lane assignment by tag:
//!
//! - **control**: direct replies (login results, presenter results, file
//!   ports, errors), forced-state notifications, `host_request`, `kick`,
//!   `files_list_update`, `server_shutdown`. Never dropped; an overflowing
//!   recipient is reported back so the registry evicts it.
//! - **chat**: `chat`, roster changes, `media_state` mirrors,
//!   `presenter_changed`, `file_available`. Drop-oldest under pressure.
//! - **screen**: `screen_frame` only, latest-wins.
//!
//! A/V datagrams have no queue at all: [`FanOut::video_targets`] /
//! [`FanOut::audio_targets`] compute the recipient addresses and the UDP
//! receive loop sends inline, dropping when the socket would block.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::Result;
use crate::protocol::message::Envelope;
use crate::registry::participant::{ClientId, Snapshot};
use crate::stats::metrics::HubMetrics;

/// Stateless dispatcher; cheap to clone anywhere a snapshot is at hand.
#[derive(Debug, Clone)]
pub struct FanOut {
    metrics: Arc<HubMetrics>,
}

impl FanOut {
    pub fn new(metrics: Arc<HubMetrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    /// Control-lane send to one participant. Returns `false` when the
    /// recipient's control lane overflowed (caller evicts) or the id is
    /// unknown.
    pub fn control_to(&self, snapshot: &Snapshot, id: ClientId, env: &Envelope) -> Result<bool> {
        let frame = env.to_frame()?;
        Ok(self.control_frame_to(snapshot, id, frame))
    }

    /// Control-lane send of a pre-encoded frame.
    pub fn control_frame_to(&self, snapshot: &Snapshot, id: ClientId, frame: Bytes) -> bool {
        let Some(participant) = snapshot.get(id) else {
            return false;
        };
        if participant.mailbox.push_control(frame).is_err() {
            HubMetrics::incr(&self.metrics.control_overflows);
            return false;
        }
        true
    }

    /// Control-lane broadcast. Returns the ids whose control lane
    /// overflowed; the registry owner evicts them.
    pub fn control_broadcast(
        &self,
        snapshot: &Snapshot,
        exclude: Option<ClientId>,
        env: &Envelope,
    ) -> Result<Vec<ClientId>> {
        let frame = env.to_frame()?;
        let mut overflowed = Vec::new();

        for participant in snapshot.iter() {
            if Some(participant.id) == exclude {
                continue;
            }
            if participant.mailbox.push_control(frame.clone()).is_err() {
                HubMetrics::incr(&self.metrics.control_overflows);
                overflowed.push(participant.id);
            }
        }
        Ok(overflowed)
    }

    /// Chat-lane broadcast with sender exclusion.
    pub fn chat_broadcast(
        &self,
        snapshot: &Snapshot,
        exclude: Option<ClientId>,
        env: &Envelope,
    ) -> Result<()> {
        let frame = env.to_frame()?;

        for participant in snapshot.iter() {
            if Some(participant.id) == exclude {
                continue;
            }
            let dropped = participant.mailbox.push_chat(frame.clone());
            if dropped > 0 {
                HubMetrics::add(&self.metrics.chat_dropped, dropped as u64);
                debug!(
                    id = participant.id,
                    dropped, "Chat lane overflow, dropped oldest"
                );
            }
        }
        Ok(())
    }

    /// Screen-frame broadcast (latest-wins), excluding the presenter. The
    /// frame arrives pre-framed so the presenter's own encoding is relayed
    /// byte-for-byte.
    pub fn screen_broadcast(&self, snapshot: &Snapshot, presenter: ClientId, frame: Bytes) {
        HubMetrics::incr(&self.metrics.screen_frames);

        for participant in snapshot.iter() {
            if participant.id == presenter {
                continue;
            }
            if participant.mailbox.push_screen(frame.clone()) {
                HubMetrics::incr(&self.metrics.screen_collapsed);
            }
        }
    }

    /// Video datagram recipients: every participant except the source that
    /// has a learned video address.
    pub fn video_targets(&self, snapshot: &Snapshot, sender: ClientId) -> Vec<SocketAddr> {
        snapshot
            .iter()
            .filter(|p| p.id != sender)
            .filter_map(|p| p.video_addr)
            .collect()
    }

    /// Audio datagram recipients, same exclusion rule.
    pub fn audio_targets(&self, snapshot: &Snapshot, sender: ClientId) -> Vec<SocketAddr> {
        snapshot
            .iter()
            .filter(|p| p.id != sender)
            .filter_map(|p| p.audio_addr)
            .collect()
    }
}
