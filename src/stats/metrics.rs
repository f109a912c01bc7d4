//! Statistics and metrics for the hub
//!
//! One shared [`HubMetrics`] instance is threaded through the listener, the
//! fan-out engine, and the transfer mediator. Counters are relaxed atomics;
//! the periodic stats task snapshots them into a [`HubStats`] for a one-line
//! summary log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared atomic counters.
#[derive(Debug)]
pub struct HubMetrics {
    started_at: Instant,

    /// Total control connections ever accepted
    pub total_connections: AtomicU64,
    /// Currently admitted participants (incl. the local host)
    pub active_participants: AtomicU64,
    /// Chat messages fanned out
    pub chat_messages: AtomicU64,
    /// Video datagrams relayed (per recipient send)
    pub video_datagrams: AtomicU64,
    /// Audio datagrams relayed (per recipient send)
    pub audio_datagrams: AtomicU64,
    /// Datagrams dropped because a send would have blocked
    pub datagrams_dropped: AtomicU64,
    /// Datagrams discarded at ingress (bad header, unknown id, policy)
    pub datagrams_discarded: AtomicU64,
    /// Screen frames fanned out
    pub screen_frames: AtomicU64,
    /// Screen frames displaced by a newer one before sending
    pub screen_collapsed: AtomicU64,
    /// Chat-lane items dropped to overflow
    pub chat_dropped: AtomicU64,
    /// Control-lane overflows (each one evicts a participant)
    pub control_overflows: AtomicU64,
    /// Completed uploads
    pub files_uploaded: AtomicU64,
    /// Completed downloads
    pub files_downloaded: AtomicU64,
    /// Bytes written to the spool by uploads
    pub bytes_spooled: AtomicU64,
    /// Heartbeats received
    pub heartbeats: AtomicU64,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_participants: AtomicU64::new(0),
            chat_messages: AtomicU64::new(0),
            video_datagrams: AtomicU64::new(0),
            audio_datagrams: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            datagrams_discarded: AtomicU64::new(0),
            screen_frames: AtomicU64::new(0),
            screen_collapsed: AtomicU64::new(0),
            chat_dropped: AtomicU64::new(0),
            control_overflows: AtomicU64::new(0),
            files_uploaded: AtomicU64::new(0),
            files_downloaded: AtomicU64::new(0),
            bytes_spooled: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> HubStats {
        HubStats {
            uptime: self.uptime(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_participants: self.active_participants.load(Ordering::Relaxed),
            chat_messages: self.chat_messages.load(Ordering::Relaxed),
            video_datagrams: self.video_datagrams.load(Ordering::Relaxed),
            audio_datagrams: self.audio_datagrams.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            datagrams_discarded: self.datagrams_discarded.load(Ordering::Relaxed),
            screen_frames: self.screen_frames.load(Ordering::Relaxed),
            screen_collapsed: self.screen_collapsed.load(Ordering::Relaxed),
            chat_dropped: self.chat_dropped.load(Ordering::Relaxed),
            control_overflows: self.control_overflows.load(Ordering::Relaxed),
            files_uploaded: self.files_uploaded.load(Ordering::Relaxed),
            files_downloaded: self.files_downloaded.load(Ordering::Relaxed),
            bytes_spooled: self.bytes_spooled.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
        }
    }

    /// One-line summary used by the periodic stats task.
    pub fn log_summary(&self) {
        let stats = self.snapshot();
        tracing::info!(
            uptime_s = stats.uptime.as_secs(),
            participants = stats.active_participants,
            connections = stats.total_connections,
            chat = stats.chat_messages,
            video = stats.video_datagrams,
            audio = stats.audio_datagrams,
            dg_dropped = stats.datagrams_dropped,
            screen = stats.screen_frames,
            uploads = stats.files_uploaded,
            downloads = stats.files_downloaded,
            "Hub stats"
        );
    }
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    pub uptime: Duration,
    pub total_connections: u64,
    pub active_participants: u64,
    pub chat_messages: u64,
    pub video_datagrams: u64,
    pub audio_datagrams: u64,
    pub datagrams_dropped: u64,
    pub datagrams_discarded: u64,
    pub screen_frames: u64,
    pub screen_collapsed: u64,
    pub chat_dropped: u64,
    pub control_overflows: u64,
    pub files_uploaded: u64,
    pub files_downloaded: u64,
    pub bytes_spooled: u64,
    pub heartbeats: u64,
}
