//! Participant registry: the single owner of session state
//!
//! All participant, chat, file-index, and presenter mutations flow through
//! one actor task ([`store::Registry`]) over a command channel, so every
//! state change, and the broadcasts it causes, is serialized. Readers
//! never block it: after each mutation the owner publishes an immutable
//! [`participant::Snapshot`] through a `tokio::sync::watch`, and the hot
//! fan-out paths (chat, screen frames, A/V datagrams) work off that.
//!
//! ```text
//!  reader tasks ──┐                       ┌──► mailboxes ──► writer tasks
//!  media loops  ──┤── mpsc commands ──► Registry owner
//!  liveness     ──┤                       │
//!  host console ──┘                       └──► watch<Arc<Snapshot>> ──► hot paths
//! ```

pub mod error;
pub mod moderation;
pub mod participant;
pub mod store;

pub use error::RegistryError;
pub use moderation::ModAction;
pub use participant::{ClientId, MediaState, ParticipantInfo, Permissions, Role, Snapshot};
pub use store::{LeaveReason, MediaKind, Registry, RegistryHandle, UploadTicket};
