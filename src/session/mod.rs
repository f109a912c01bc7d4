//! Session state: chat log, shared-file index, presenter slot
//!
//! All three live inside the registry owner task and are mutated only
//! through its command loop, so no additional locking exists here.

pub mod chat;
pub mod files;
pub mod presenter;

pub use chat::{ChatEntry, ChatLog};
pub use files::{FileEntry, FileIndex, FileInfo};
pub use presenter::PresenterSlot;
