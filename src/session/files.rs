//! Shared-file index and manual spool scanner
//!
//! The index is the in-memory truth about shared files; the spool directory
//! holds only payloads (no metadata sidecar). At startup, and whenever the
//! host asks, the scanner walks the spool and registers regular files the
//! index does not know about as `manual_<n>_<basename>` entries.
//!
//! Spool payloads are namespaced `<fid>_<sanitized name>` so two uploads of
//! `notes.txt` never collide on disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::registry::error::RegistryError;
use crate::registry::participant::ClientId;

/// One entry in the shared-file index.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub fid: String,
    pub filename: String,
    pub size: u64,
    pub uploader_name: String,
    /// `None` for entries discovered by the manual scanner.
    pub uploader_id: Option<ClientId>,
    pub path: PathBuf,
    pub uploaded_at: String,
}

impl FileEntry {
    pub fn info(&self) -> FileInfo {
        FileInfo {
            fid: self.fid.clone(),
            filename: self.filename.clone(),
            size: self.size,
            uploader: self.uploader_name.clone(),
            uploaded_at: self.uploaded_at.clone(),
        }
    }
}

/// Wire-facing file summary, carried in `login_success.shared_files` and
/// `files_list_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub fid: String,
    pub filename: String,
    pub size: u64,
    pub uploader: String,
    pub uploaded_at: String,
}

/// Reject anything that is not a plain basename: path separators, parent
/// refs, hidden names, empties, and control characters all fail.
pub fn sanitize_filename(name: &str) -> Result<String, RegistryError> {
    let invalid = || RegistryError::InvalidFilename(name.to_string());

    if name.is_empty() || name.len() > 255 {
        return Err(invalid());
    }
    if name.starts_with('.') {
        return Err(invalid());
    }
    if name.contains("..") {
        return Err(invalid());
    }
    if name.chars().any(|c| {
        c == '/' || c == '\\' || c == ':' || c.is_control() || std::path::is_separator(c)
    }) {
        return Err(invalid());
    }

    Ok(name.to_string())
}

/// The shared-file index, keyed by fid.
#[derive(Debug, Default)]
pub struct FileIndex {
    entries: HashMap<String, FileEntry>,
    /// Fids reserved by in-flight uploads; they block reuse but are not yet
    /// visible in listings.
    pending: HashSet<String>,
    manual_seq: u64,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a fid for an in-flight upload.
    pub fn reserve(&mut self, fid: &str) -> Result<(), RegistryError> {
        if self.entries.contains_key(fid) || !self.pending.insert(fid.to_string()) {
            return Err(RegistryError::FidTaken(fid.to_string()));
        }
        Ok(())
    }

    /// Drop a reservation after a failed upload.
    pub fn release(&mut self, fid: &str) {
        self.pending.remove(fid);
    }

    /// Install a completed entry, consuming any reservation.
    pub fn register(&mut self, entry: FileEntry) {
        self.pending.remove(&entry.fid);
        self.entries.insert(entry.fid.clone(), entry);
    }

    pub fn get(&self, fid: &str) -> Option<&FileEntry> {
        self.entries.get(fid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire map for `login_success` / `files_list_update`.
    pub fn wire_map(&self) -> HashMap<String, FileInfo> {
        self.entries
            .iter()
            .map(|(fid, entry)| (fid.clone(), entry.info()))
            .collect()
    }

    /// Scan the spool for files the index does not know about, registering
    /// each as a manual entry. Manual entries whose backing file vanished
    /// are dropped in the same pass. Returns the newly created entries.
    ///
    /// Hidden files, directories, and symlinks are skipped.
    pub async fn scan_spool(&mut self, spool: &Path, timestamp: &str) -> Vec<FileEntry> {
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.uploader_id.is_none() && !e.path.exists())
            .map(|e| e.fid.clone())
            .collect();
        for fid in stale {
            debug!(fid = %fid, "Dropping manual entry with missing file");
            self.entries.remove(&fid);
        }

        let known: HashSet<PathBuf> = self.entries.values().map(|e| e.path.clone()).collect();

        let mut read_dir = match tokio::fs::read_dir(spool).await {
            Ok(rd) => rd,
            Err(e) => {
                warn!(spool = %spool.display(), error = %e, "Spool scan failed");
                return Vec::new();
            }
        };

        let mut created = Vec::new();
        while let Ok(Some(dirent)) = read_dir.next_entry().await {
            let path = dirent.path();
            if known.contains(&path) {
                continue;
            }

            let name = match dirent.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.starts_with('.') {
                continue;
            }

            // symlink_metadata never follows links, so symlinks show up as
            // symlinks rather than as their targets.
            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if !meta.is_file() {
                continue;
            }

            self.manual_seq += 1;
            let entry = FileEntry {
                fid: format!("manual_{}_{}", self.manual_seq, name),
                filename: name,
                size: meta.len(),
                uploader_name: "manual".into(),
                uploader_id: None,
                path,
                uploaded_at: timestamp.to_string(),
            };
            debug!(fid = %entry.fid, size = entry.size, "Spool scan registered file");
            self.entries.insert(entry.fid.clone(), entry.clone());
            created.push(entry);
        }

        created
    }
}
