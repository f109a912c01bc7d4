//! Bounded per-participant outbound queues
//!
//! Single consumer (the participant's writer task), multiple producers (the
//! fan-out engine, the registry owner, transfer tasks). Lanes are drained in
//! priority order: control, then the screen slot, then chat. The mutex only
//! guards deque pointers; frames themselves are shared `Bytes`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

/// Hard bound on the control lane. Control records are never dropped, so a
/// breach means the recipient has stopped draining and must be evicted.
pub const CONTROL_HARD_BOUND: usize = 1024;

/// Soft item bound on the chat lane before oldest entries are dropped.
pub const CHAT_SOFT_BOUND: usize = 256;

/// Soft aggregate byte bound on the chat lane.
pub const CHAT_BYTE_BOUND: usize = 8 * 1024 * 1024;

/// Control lane would exceed its hard bound; the recipient is unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxOverflow;

#[derive(Debug, Default)]
struct Lanes {
    control: VecDeque<Bytes>,
    chat: VecDeque<Bytes>,
    chat_bytes: usize,
    screen: Option<Bytes>,
    closed: bool,
}

/// Outbound queues for one participant.
#[derive(Debug)]
pub struct Mailbox {
    lanes: Mutex<Lanes>,
    notify: Notify,
    unhealthy: AtomicBool,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            unhealthy: AtomicBool::new(false),
        }
    }

    /// Enqueue on the control lane. Never drops; a full lane marks the
    /// recipient unhealthy instead and the caller evicts.
    pub fn push_control(&self, frame: Bytes) -> Result<(), MailboxOverflow> {
        {
            let mut lanes = self.lanes.lock().unwrap();
            if lanes.closed {
                return Ok(());
            }
            if lanes.control.len() >= CONTROL_HARD_BOUND {
                drop(lanes);
                self.unhealthy.store(true, Ordering::Release);
                return Err(MailboxOverflow);
            }
            lanes.control.push_back(frame);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Enqueue on the chat lane, dropping oldest entries past the soft
    /// bounds. Returns how many were dropped.
    pub fn push_chat(&self, frame: Bytes) -> usize {
        let dropped = {
            let mut lanes = self.lanes.lock().unwrap();
            if lanes.closed {
                return 0;
            }
            lanes.chat_bytes += frame.len();
            lanes.chat.push_back(frame);

            let mut dropped = 0;
            while lanes.chat.len() > CHAT_SOFT_BOUND || lanes.chat_bytes > CHAT_BYTE_BOUND {
                match lanes.chat.pop_front() {
                    Some(old) => {
                        lanes.chat_bytes -= old.len();
                        dropped += 1;
                    }
                    None => break,
                }
            }
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Replace the pending screen frame (latest-wins). Returns true when an
    /// unsent frame was displaced.
    pub fn push_screen(&self, frame: Bytes) -> bool {
        let replaced = {
            let mut lanes = self.lanes.lock().unwrap();
            if lanes.closed {
                return false;
            }
            lanes.screen.replace(frame).is_some()
        };
        self.notify.notify_one();
        replaced
    }

    /// Dequeue the next frame, honoring lane priority. Returns `None` once
    /// the mailbox is closed *and* fully drained, so writers flush
    /// everything already queued before exiting.
    pub async fn next(&self) -> Option<Bytes> {
        loop {
            {
                let mut lanes = self.lanes.lock().unwrap();
                if let Some(frame) = lanes.control.pop_front() {
                    return Some(frame);
                }
                if let Some(frame) = lanes.screen.take() {
                    return Some(frame);
                }
                if let Some(frame) = lanes.chat.pop_front() {
                    lanes.chat_bytes -= frame.len();
                    return Some(frame);
                }
                if lanes.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking dequeue; `None` means empty right now (or closed).
    pub fn try_next(&self) -> Option<Bytes> {
        let mut lanes = self.lanes.lock().unwrap();
        if let Some(frame) = lanes.control.pop_front() {
            return Some(frame);
        }
        if let Some(frame) = lanes.screen.take() {
            return Some(frame);
        }
        if let Some(frame) = lanes.chat.pop_front() {
            lanes.chat_bytes -= frame.len();
            return Some(frame);
        }
        None
    }

    /// Stop accepting new frames and wake the writer so it can flush what
    /// remains and exit.
    pub fn close(&self) {
        self.lanes.lock().unwrap().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.lock().unwrap().closed
    }

    /// Set when the control lane overflowed.
    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::Acquire)
    }

    /// Total queued frames across all lanes (for logs and tests).
    pub fn depth(&self) -> usize {
        let lanes = self.lanes.lock().unwrap();
        lanes.control.len() + lanes.chat.len() + usize::from(lanes.screen.is_some())
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
