//! # lanhub
//!
//! A LAN conferencing hub: one central server, N participant clients.
//! The hub fans out real-time audio/video datagrams, a shared screen from a
//! single presenter, group chat, and shared files, and carries host-initiated
//! moderation commands.
//!
//! Transports:
//! - one reliable TCP port for control, chat, screen frames, and file
//!   negotiation (length-prefixed JSON records);
//! - two UDP ports for video and audio datagrams (fixed binary headers,
//!   opaque payloads; the hub never transcodes);
//! - one ephemeral TCP listener per file upload or download.
//!
//! All participant and session state is owned by a single registry actor;
//! hot fan-out paths read a copy-on-write roster snapshot instead of
//! contacting the actor.
//!
//! ```no_run
//! use lanhub::{HubConfig, HubServer};
//!
//! #[tokio::main]
//! async fn main() -> lanhub::Result<()> {
//!     let config = HubConfig::default().host_name("Host");
//!     let server = HubServer::bind(config).await?;
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```

pub mod error;
pub mod fanout;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, Result};
pub use protocol::message::{ControlBody, Envelope};
pub use registry::{ClientId, RegistryHandle};
pub use server::config::HubConfig;
pub use server::listener::HubServer;

/// Client id reserved for the local host participant.
pub const HOST_CLIENT_ID: ClientId = 0;

/// Maximum control frame payload size in bytes.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum total size of a media datagram in bytes.
pub const MAX_DATAGRAM_SIZE: usize = 9000;

/// Maximum chat text length in bytes.
pub const MAX_CHAT_LEN: usize = 4 * 1024;

/// Maximum display name length in characters.
pub const MAX_NAME_LEN: usize = 50;
