//! UDP media receive loops
//!
//! One loop per media port. Each datagram is validated against the fixed
//! header, the sender's media address is learned (or re-learned after a
//! rebind) from the source endpoint, policy is checked against the roster
//! snapshot, and the datagram is relayed to every other participant with a
//! known address on that channel. Sends use `try_send_to`: a socket that
//! would block simply drops the datagram; the hub never queues real-time
//! media.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::fanout::engine::FanOut;
use crate::protocol::datagram::{AudioHeader, VideoHeader};
use crate::registry::participant::ClientId;
use crate::registry::store::{MediaKind, RegistryHandle};
use crate::stats::metrics::HubMetrics;
use crate::MAX_DATAGRAM_SIZE;

/// Receive-and-relay loop for one media port. Runs until the socket dies
/// or the task is aborted at shutdown.
pub(crate) async fn media_loop(
    kind: MediaKind,
    socket: Arc<UdpSocket>,
    registry: RegistryHandle,
    fanout: FanOut,
) {
    let metrics = fanout.metrics().clone();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(?kind, error = %e, "Media socket receive failed");
                continue;
            }
        };
        let datagram = &buf[..len];

        let sender_id = match parse_sender(kind, datagram) {
            Some(id) => id,
            None => {
                HubMetrics::incr(&metrics.datagrams_discarded);
                continue;
            }
        };

        let snapshot = registry.snapshot();
        let Some(sender) = snapshot.get(sender_id) else {
            // Datagrams for ids we never admitted are discarded outright.
            HubMetrics::incr(&metrics.datagrams_discarded);
            continue;
        };

        // Learn the endpoint from the first valid datagram; refresh on
        // rebind.
        let known = match kind {
            MediaKind::Video => sender.video_addr,
            MediaKind::Audio => sender.audio_addr,
        };
        if known != Some(addr) {
            if registry.learn_media_addr(sender_id, kind, addr).await.is_err() {
                return;
            }
        }

        // Policy: a muted or permission-revoked medium is dropped here, not
        // fanned out, so clients cannot bypass a forced state.
        let allowed = match kind {
            MediaKind::Video => sender.media_state.video_on && sender.permissions.may_video,
            MediaKind::Audio => sender.media_state.audio_on && sender.permissions.may_audio,
        };
        if !allowed {
            HubMetrics::incr(&metrics.datagrams_discarded);
            continue;
        }

        let targets = match kind {
            MediaKind::Video => fanout.video_targets(&snapshot, sender_id),
            MediaKind::Audio => fanout.audio_targets(&snapshot, sender_id),
        };
        let relayed = match kind {
            MediaKind::Video => &metrics.video_datagrams,
            MediaKind::Audio => &metrics.audio_datagrams,
        };

        for target in targets {
            match socket.try_send_to(datagram, target) {
                Ok(_) => HubMetrics::incr(relayed),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    HubMetrics::incr(&metrics.datagrams_dropped);
                }
                Err(e) => {
                    debug!(?kind, %target, error = %e, "Datagram send failed");
                    HubMetrics::incr(&metrics.datagrams_dropped);
                }
            }
        }
    }
}

fn parse_sender(kind: MediaKind, datagram: &[u8]) -> Option<ClientId> {
    match kind {
        MediaKind::Video => VideoHeader::parse(datagram).ok().map(|h| h.client_id),
        MediaKind::Audio => AudioHeader::parse(datagram).ok().map(|h| h.client_id),
    }
}
