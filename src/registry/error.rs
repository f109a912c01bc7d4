//! Registry error types
//!
//! Policy-level failures produced by the registry owner. Each maps to a
//! typed wire reply (`login_error`, `permission_error`, `presenter_denied`,
//! `file_error`); none of them tears a connection down.

use crate::registry::participant::ClientId;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Admission refused: the session is at `max_participants`.
    SessionFull { max: usize },
    /// Display name empty or over the length limit.
    InvalidName(String),
    /// No live participant with this id.
    UnknownParticipant(ClientId),
    /// Command requires host role.
    NotHost(ClientId),
    /// Presenter slot already held.
    PresenterBusy,
    /// The participant's permissions forbid the operation.
    PermissionDenied(&'static str),
    /// Chat text over the limit.
    ChatTooLong { len: usize, max: usize },
    /// File id already registered or reserved.
    FidTaken(String),
    /// No shared file with this id.
    UnknownFid(String),
    /// Offered file exceeds `max_file_size`.
    FileTooLarge { size: u64, max: u64 },
    /// Filename failed sanitization.
    InvalidFilename(String),
    /// File id empty or containing path-like characters.
    InvalidFid(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::SessionFull { max } => {
                write!(f, "Session is full ({} participants)", max)
            }
            RegistryError::InvalidName(name) => write!(f, "Invalid display name: {:?}", name),
            RegistryError::UnknownParticipant(id) => write!(f, "No such participant: {}", id),
            RegistryError::NotHost(id) => write!(f, "Participant {} is not the host", id),
            RegistryError::PresenterBusy => write!(f, "Presenter role already taken"),
            RegistryError::PermissionDenied(what) => write!(f, "Permission denied: {}", what),
            RegistryError::ChatTooLong { len, max } => {
                write!(f, "Chat message too long: {} bytes (max {})", len, max)
            }
            RegistryError::FidTaken(fid) => write!(f, "File id already in use: {}", fid),
            RegistryError::UnknownFid(fid) => write!(f, "No such file: {}", fid),
            RegistryError::FileTooLarge { size, max } => {
                write!(f, "File too large: {} bytes (max {})", size, max)
            }
            RegistryError::InvalidFilename(name) => write!(f, "Invalid filename: {:?}", name),
            RegistryError::InvalidFid(fid) => write!(f, "Invalid file id: {:?}", fid),
        }
    }
}

impl std::error::Error for RegistryError {}
