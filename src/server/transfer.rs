//! File transfer mediator
//!
//! Files never share a connection with the control channel. Each accepted
//! offer or request gets a fresh ephemeral TCP listener; the port travels
//! back over the control channel and the peer connects to move raw bytes.
//!
//! ```text
//! uploader ── file_offer ──► hub ── file_upload_port{fid, port} ──► uploader
//! uploader ═══ connect(port), stream exactly `size` bytes ═══► spool
//! hub ── file_available ──► everyone
//! ```
//!
//! Uploads stream to the spool in 32 KiB chunks and are verified against
//! the declared size; anything short, stalled past the inactivity deadline,
//! or failing on disk deletes the partial file and releases the fid.
//! Downloads open the file per transfer, so concurrent downloads of one
//! fid are independent.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(test)]
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::fanout::queues::Mailbox;
use crate::protocol::message::{ControlBody, Envelope};
use crate::registry::participant::ClientId;
use crate::registry::store::{LeaveReason, RegistryHandle, UploadTicket};
use crate::server::config::HubConfig;
use crate::session::files::FileEntry;
use crate::stats::metrics::HubMetrics;

/// Streaming chunk size for spool reads and writes.
const CHUNK_SIZE: usize = 32 * 1024;

/// Per-transfer mediator. Cheap to clone into connection tasks.
#[derive(Clone)]
pub(crate) struct FileMediator {
    config: Arc<HubConfig>,
    registry: RegistryHandle,
    metrics: Arc<HubMetrics>,
}

impl FileMediator {
    pub(crate) fn new(
        config: Arc<HubConfig>,
        registry: RegistryHandle,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
        }
    }

    /// Handle `file_offer`: validate through the registry, open an
    /// ephemeral listener, reply `file_upload_port`, and run the upload in
    /// its own task.
    pub(crate) async fn begin_upload(
        &self,
        id: ClientId,
        fid: String,
        filename: String,
        size: u64,
        mailbox: &Arc<Mailbox>,
    ) {
        let ticket = match self
            .registry
            .file_offer(id, fid.clone(), filename, size)
            .await
        {
            Ok(ticket) => ticket,
            Err(Error::Registry(err)) => {
                self.reply(
                    id,
                    mailbox,
                    ControlBody::FileError {
                        fid,
                        reason: err.to_string(),
                    },
                )
                .await;
                return;
            }
            Err(_) => return,
        };

        let listener = match self.bind_ephemeral().await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(fid = %ticket.fid, error = %e, "Failed to open upload port");
                let _ = self.registry.release_fid(ticket.fid.clone()).await;
                self.reply(
                    id,
                    mailbox,
                    ControlBody::FileError {
                        fid: ticket.fid,
                        reason: "no port available".into(),
                    },
                )
                .await;
                return;
            }
        };

        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(_) => return,
        };
        info!(fid = %ticket.fid, port, size, uploader = id, "Upload port open");
        self.reply(
            id,
            mailbox,
            ControlBody::FileUploadPort {
                fid: ticket.fid.clone(),
                port,
            },
        )
        .await;

        let mediator = self.clone();
        let mailbox = mailbox.clone();
        tokio::spawn(async move {
            mediator.run_upload(listener, ticket, id, mailbox).await;
        });
    }

    async fn run_upload(
        self,
        listener: TcpListener,
        ticket: UploadTicket,
        uploader: ClientId,
        mailbox: Arc<Mailbox>,
    ) {
        let path = self.spool_path(&ticket.fid, &ticket.filename);

        match self.receive_file(&listener, &path, ticket.size).await {
            Ok(()) => {
                HubMetrics::add(&self.metrics.bytes_spooled, ticket.size);
                let entry = FileEntry {
                    fid: ticket.fid,
                    filename: ticket.filename,
                    size: ticket.size,
                    uploader_name: ticket.uploader_name,
                    uploader_id: Some(ticket.uploader_id),
                    path,
                    uploaded_at: chrono::Utc::now().to_rfc3339(),
                };
                let _ = self.registry.register_upload(entry).await;
            }
            Err(e) => {
                warn!(fid = %ticket.fid, error = %e, "Upload failed, discarding partial file");
                let _ = tokio::fs::remove_file(&path).await;
                let _ = self.registry.release_fid(ticket.fid.clone()).await;
                self.reply(
                    uploader,
                    &mailbox,
                    ControlBody::FileError {
                        fid: ticket.fid,
                        reason: "upload failed".into(),
                    },
                )
                .await;
            }
        }
    }

    /// Accept the uploader and stream exactly `size` bytes into the spool.
    async fn receive_file(
        &self,
        listener: &TcpListener,
        path: &PathBuf,
        size: u64,
    ) -> crate::Result<()> {
        tokio::fs::create_dir_all(&self.config.spool_dir).await?;

        let (mut stream, peer) = timeout(self.config.transfer_timeout, listener.accept())
            .await
            .map_err(|_| Error::Transfer("no uploader connected".into()))??;
        debug!(peer = %peer, "Uploader connected");

        let mut file = tokio::fs::File::create(path).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut remaining = size;

        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = timeout(self.config.transfer_timeout, stream.read(&mut buf[..want]))
                .await
                .map_err(|_| Error::Transfer("upload stalled".into()))??;
            if n == 0 {
                return Err(Error::Transfer(format!(
                    "short upload: {} bytes missing",
                    remaining
                )));
            }
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }

        file.flush().await?;
        Ok(())
    }

    /// Handle `file_request`: validate, open an ephemeral listener, reply
    /// `file_download_port`, and stream the file in its own task.
    pub(crate) async fn begin_download(&self, id: ClientId, fid: String, mailbox: &Arc<Mailbox>) {
        let entry = match self.registry.file_request(id, fid.clone()).await {
            Ok(entry) => entry,
            Err(Error::Registry(err)) => {
                self.reply(
                    id,
                    mailbox,
                    ControlBody::FileError {
                        fid,
                        reason: err.to_string(),
                    },
                )
                .await;
                return;
            }
            Err(_) => return,
        };

        let listener = match self.bind_ephemeral().await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(fid = %entry.fid, error = %e, "Failed to open download port");
                self.reply(
                    id,
                    mailbox,
                    ControlBody::FileError {
                        fid: entry.fid,
                        reason: "no port available".into(),
                    },
                )
                .await;
                return;
            }
        };

        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(_) => return,
        };
        info!(fid = %entry.fid, port, size = entry.size, requester = id, "Download port open");
        self.reply(
            id,
            mailbox,
            ControlBody::FileDownloadPort {
                fid: entry.fid.clone(),
                port,
                size: entry.size,
            },
        )
        .await;

        let mediator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = mediator.send_file(&listener, &entry).await {
                warn!(fid = %entry.fid, error = %e, "Download failed");
            } else {
                HubMetrics::incr(&mediator.metrics.files_downloaded);
            }
        });
    }

    /// Accept the requester and stream the whole file.
    async fn send_file(&self, listener: &TcpListener, entry: &FileEntry) -> crate::Result<()> {
        let (mut stream, peer) = timeout(self.config.transfer_timeout, listener.accept())
            .await
            .map_err(|_| Error::Transfer("no requester connected".into()))??;
        debug!(peer = %peer, fid = %entry.fid, "Requester connected");

        let mut file = tokio::fs::File::open(&entry.path).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            timeout(self.config.transfer_timeout, stream.write_all(&buf[..n]))
                .await
                .map_err(|_| Error::Transfer("download stalled".into()))??;
        }

        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn bind_ephemeral(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind((self.config.bind_addr, 0)).await
    }

    fn spool_path(&self, fid: &str, filename: &str) -> PathBuf {
        self.config.spool_dir.join(format!("{}_{}", fid, filename))
    }

    /// Requester-directed control reply. A control lane that cannot take
    /// one more frame means the recipient is unhealthy; evict it.
    async fn reply(&self, id: ClientId, mailbox: &Arc<Mailbox>, body: ControlBody) {
        let Ok(frame) = Envelope::now(body).to_frame() else {
            return;
        };
        if mailbox.push_control(frame).is_err() {
            HubMetrics::incr(&self.metrics.control_overflows);
            let _ = self.registry.remove(id, LeaveReason::Overflow).await;
        }
    }
}
