//! Hub configuration

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::{MAX_CHAT_LEN, MAX_FRAME_SIZE};

/// Hub configuration options
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interface to bind every listener to
    pub bind_addr: IpAddr,

    /// Reliable control/chat/file/screen port (0 = OS-assigned)
    pub control_port: u16,

    /// Video datagram port (0 = OS-assigned)
    pub video_port: u16,

    /// Audio datagram port (0 = OS-assigned)
    pub audio_port: u16,

    /// Directory for shared file payloads
    pub spool_dir: PathBuf,

    /// Maximum accepted file size in bytes
    pub max_file_size: u64,

    /// Chat ring buffer capacity
    pub chat_history_size: usize,

    /// Quiet time before a heartbeat warning is logged
    pub heartbeat_soft: Duration,

    /// Quiet time before a participant is evicted
    pub heartbeat_hard: Duration,

    /// Maximum admitted participants, local host included
    pub max_participants: usize,

    /// Display name of the local host participant (id 0)
    pub host_name: String,

    /// Maximum control frame payload size
    pub max_frame_size: usize,

    /// Maximum chat text length in bytes
    pub max_chat_len: usize,

    /// Deadline for completing a declared frame length
    pub read_timeout: Duration,

    /// Soft write deadline (warn) on the control channel
    pub write_soft_timeout: Duration,

    /// Hard write deadline (evict) on the control channel
    pub write_hard_timeout: Duration,

    /// File transfer inactivity deadline (also the accept deadline)
    pub transfer_timeout: Duration,

    /// Enable TCP_NODELAY on control connections
    pub tcp_nodelay: bool,

    /// Periodic stats summary interval
    pub stats_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".parse().unwrap(),
            control_port: 8888,
            video_port: 8889,
            audio_port: 8890,
            spool_dir: PathBuf::from("uploads"),
            max_file_size: 100 * 1024 * 1024,
            chat_history_size: 500,
            heartbeat_soft: Duration::from_secs(20),
            heartbeat_hard: Duration::from_secs(30),
            max_participants: 100,
            host_name: "Host".into(),
            max_frame_size: MAX_FRAME_SIZE,
            max_chat_len: MAX_CHAT_LEN,
            read_timeout: Duration::from_secs(10),
            write_soft_timeout: Duration::from_secs(5),
            write_hard_timeout: Duration::from_secs(15),
            transfer_timeout: Duration::from_secs(30),
            tcp_nodelay: true, // Real-time control traffic
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl HubConfig {
    /// Create a config bound to a specific interface
    pub fn with_addr(addr: IpAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind interface
    pub fn bind(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the three fixed ports at once
    pub fn ports(mut self, control: u16, video: u16, audio: u16) -> Self {
        self.control_port = control;
        self.video_port = video;
        self.audio_port = audio;
        self
    }

    /// Set the spool directory
    pub fn spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = dir.into();
        self
    }

    /// Set the maximum file size
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Set the chat history capacity
    pub fn chat_history_size(mut self, size: usize) -> Self {
        self.chat_history_size = size;
        self
    }

    /// Set heartbeat soft/hard timeouts
    pub fn heartbeat_timeouts(mut self, soft: Duration, hard: Duration) -> Self {
        self.heartbeat_soft = soft;
        self.heartbeat_hard = hard;
        self
    }

    /// Set the participant limit
    pub fn max_participants(mut self, max: usize) -> Self {
        self.max_participants = max;
        self
    }

    /// Set the local host participant's display name
    pub fn host_name(mut self, name: impl Into<String>) -> Self {
        self.host_name = name.into();
        self
    }

    /// Set the file transfer inactivity deadline
    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Set the stats summary interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }
}
