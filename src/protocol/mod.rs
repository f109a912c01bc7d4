//! Wire protocol: control-channel framing and media datagram headers
//!
//! The hub speaks two wire formats:
//!
//! ```text
//! Control channel (TCP)          Media channels (UDP)
//! ┌────────────┬──────────┐      ┌───────────────────┬─────────┐
//! │ u32 length │ JSON     │      │ fixed binary hdr  │ opaque  │
//! │ big-endian │ record   │      │ (ids, seq/ts)     │ payload │
//! └────────────┴──────────┘      └───────────────────┴─────────┘
//! ```
//!
//! Control payloads are tagged JSON records (`type` + `timestamp` plus
//! tag-specific fields). The length prefix is the only synchronization
//! point; any framing error tears the connection down. Media payloads are
//! never inspected beyond the fixed header.

pub mod datagram;
pub mod frame;
pub mod message;

pub use datagram::{AudioHeader, VideoHeader};
pub use frame::{encode_frame, read_frame, write_frame};
pub use message::{decode_screen_frame, ControlBody, Envelope, PermissionField};
