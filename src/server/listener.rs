//! Hub server listener
//!
//! Binds the control TCP port and both media UDP ports, spawns connection
//! handlers, and wires up the registry owner, liveness monitor, media
//! loops, and stats task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::fanout::engine::FanOut;
use crate::fanout::queues::Mailbox;
use crate::protocol::message::Envelope;
use crate::registry::store::{MediaKind, Registry, RegistryHandle};
use crate::server::config::HubConfig;
use crate::server::connection::{run_connection, ConnectionCtx};
use crate::server::liveness;
use crate::server::media::media_loop;
use crate::server::transfer::FileMediator;
use crate::stats::metrics::HubMetrics;

/// Budget for flushing best-effort `server_shutdown` notices on exit.
const SHUTDOWN_FLUSH_BUDGET: std::time::Duration = std::time::Duration::from_secs(2);

/// The conferencing hub server.
pub struct HubServer {
    config: Arc<HubConfig>,
    registry: RegistryHandle,
    fanout: FanOut,
    metrics: Arc<HubMetrics>,
    mediator: FileMediator,
    control_listener: TcpListener,
    video_socket: Arc<UdpSocket>,
    audio_socket: Arc<UdpSocket>,
    host_mailbox: Arc<Mailbox>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HubServer {
    /// Bind all three listeners and start the registry owner. Failing to
    /// bind is the one fatal startup error; everything after this keeps
    /// the server alive.
    pub async fn bind(config: HubConfig) -> Result<Self> {
        let config = Arc::new(config);

        tokio::fs::create_dir_all(&config.spool_dir).await?;

        let control_listener =
            TcpListener::bind((config.bind_addr, config.control_port)).await?;
        let video_socket =
            Arc::new(UdpSocket::bind((config.bind_addr, config.video_port)).await?);
        let audio_socket =
            Arc::new(UdpSocket::bind((config.bind_addr, config.audio_port)).await?);

        let metrics = Arc::new(HubMetrics::new());
        let fanout = FanOut::new(metrics.clone());
        let (registry, host_mailbox, _registry_join) =
            Registry::spawn(config.clone(), fanout.clone());

        // Rebuild the shared-file index from whatever survives in the spool.
        let recovered = registry.scan_spool().await?;
        if !recovered.is_empty() {
            info!(files = recovered.len(), "Recovered spool entries");
        }

        let mediator = FileMediator::new(config.clone(), registry.clone(), metrics.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            control = %control_listener.local_addr()?,
            video = %video_socket.local_addr()?,
            audio = %audio_socket.local_addr()?,
            "Hub listening"
        );

        Ok(Self {
            config,
            registry,
            fanout,
            metrics,
            mediator,
            control_listener,
            video_socket,
            audio_socket,
            host_mailbox,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Bound control-channel address.
    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control_listener.local_addr()?)
    }

    /// Bound video datagram address.
    pub fn video_addr(&self) -> Result<SocketAddr> {
        Ok(self.video_socket.local_addr()?)
    }

    /// Bound audio datagram address.
    pub fn audio_addr(&self) -> Result<SocketAddr> {
        Ok(self.audio_socket.local_addr()?)
    }

    /// Registry handle for an embedding host console: moderation, presenter
    /// control, spool rescans, and roster snapshots, acting as id 0.
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Stream of records addressed to the local host participant (id 0):
    /// chat, roster changes, file availability. Intended for a host
    /// console; call at most once.
    pub fn host_events(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mailbox = self.host_mailbox.clone();

        tokio::spawn(async move {
            while let Some(frame) = mailbox.next().await {
                if frame.len() < crate::protocol::frame::PREFIX_LEN {
                    continue;
                }
                match Envelope::from_slice(&frame[crate::protocol::frame::PREFIX_LEN..]) {
                    Ok(env) => {
                        if tx.send(env).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "Skipping undecodable host event"),
                }
            }
        });

        rx
    }

    /// Run until the process dies.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run until `shutdown` resolves, then broadcast `server_shutdown`,
    /// give writers a short flush budget, and stop every task.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let liveness_handle = liveness::spawn(self.registry.clone());
        let stats_handle = self.spawn_stats_task();
        let video_handle = tokio::spawn(media_loop(
            MediaKind::Video,
            self.video_socket.clone(),
            self.registry.clone(),
            self.fanout.clone(),
        ));
        let audio_handle = tokio::spawn(media_loop(
            MediaKind::Audio,
            self.audio_socket.clone(),
            self.registry.clone(),
            self.fanout.clone(),
        ));

        let result = tokio::select! {
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop() => result,
        };

        // Best-effort notice to every participant, then a bounded flush
        // window before the tasks are cut down.
        let _ = self.registry.shutdown().await;
        let _ = self.shutdown_tx.send(true);
        tokio::time::sleep(SHUTDOWN_FLUSH_BUDGET).await;

        liveness_handle.abort();
        stats_handle.abort();
        video_handle.abort();
        audio_handle.abort();

        result
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            match self.control_listener.accept().await {
                Ok((socket, peer)) => {
                    HubMetrics::incr(&self.metrics.total_connections);

                    if self.config.tcp_nodelay {
                        let _ = socket.set_nodelay(true);
                    }
                    debug!(peer = %peer, "New control connection");

                    let ctx = ConnectionCtx {
                        config: self.config.clone(),
                        registry: self.registry.clone(),
                        fanout: self.fanout.clone(),
                        transfer: self.mediator.clone(),
                        shutdown: self.shutdown_rx.clone(),
                    };
                    tokio::spawn(run_connection(socket, peer, ctx));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn spawn_stats_task(&self) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let interval = self.config.stats_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                metrics.log_summary();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use crate::protocol::frame::{read_frame, write_frame};
    use crate::protocol::message::ControlBody;
    use crate::registry::moderation::ModAction;
    use crate::registry::participant::ClientId;
    use crate::registry::Role;
    use crate::HOST_CLIENT_ID;

    const RECV_TIMEOUT: Duration = Duration::from_secs(3);

    struct TestHub {
        control: SocketAddr,
        video: SocketAddr,
        registry: RegistryHandle,
        host_events: mpsc::UnboundedReceiver<Envelope>,
        _spool: tempfile::TempDir,
    }

    async fn start_hub(tune: impl FnOnce(HubConfig) -> HubConfig) -> TestHub {
        let spool = tempfile::TempDir::new().unwrap();
        let config = tune(
            HubConfig::with_addr("127.0.0.1".parse().unwrap())
                .ports(0, 0, 0)
                .spool_dir(spool.path())
                .host_name("host"),
        );

        let server = HubServer::bind(config).await.unwrap();
        let hub = TestHub {
            control: server.control_addr().unwrap(),
            video: server.video_addr().unwrap(),
            registry: server.registry().clone(),
            host_events: server.host_events(),
            _spool: spool,
        };
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        hub
    }

    struct TestClient {
        stream: TcpStream,
        id: ClientId,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr, name: &str) -> (Self, Envelope) {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let login = Envelope::now(ControlBody::Login { name: name.into() });
            write_frame(&mut stream, &login.to_bytes().unwrap())
                .await
                .unwrap();

            let mut client = Self { stream, id: 0 };
            let reply = client.recv().await;
            let ControlBody::LoginSuccess { client_id, .. } = reply.body else {
                panic!("expected login_success, got {:?}", reply.body);
            };
            client.id = client_id;
            (client, reply)
        }

        async fn send(&mut self, body: ControlBody) {
            let env = Envelope::now(body);
            write_frame(&mut self.stream, &env.to_bytes().unwrap())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            let payload = timeout(
                RECV_TIMEOUT,
                read_frame(&mut self.stream, crate::MAX_FRAME_SIZE, RECV_TIMEOUT),
            )
            .await
            .expect("frame before deadline")
            .expect("readable frame");
            Envelope::from_slice(&payload).expect("valid envelope")
        }

        /// Read frames until one matches `tag`, returning it and every tag
        /// seen on the way.
        async fn recv_tag(&mut self, tag: &str) -> (Envelope, Vec<String>) {
            let mut skipped = Vec::new();
            for _ in 0..32 {
                let env = self.recv().await;
                if env.body.tag() == tag {
                    return (env, skipped);
                }
                skipped.push(env.body.tag().to_string());
            }
            panic!("no {} frame within 32 reads (saw {:?})", tag, skipped);
        }

        /// Assert silence on the socket for a short window.
        async fn expect_nothing(&mut self, window: Duration) {
            let read = read_frame(&mut self.stream, crate::MAX_FRAME_SIZE, RECV_TIMEOUT);
            assert!(
                timeout(window, read).await.is_err(),
                "expected no frame within {:?}",
                window
            );
        }
    }

    #[tokio::test]
    async fn test_login_roster_over_socket() {
        let hub = start_hub(|c| c).await;

        let (alice, login) = TestClient::connect(hub.control, "alice").await;
        assert_eq!(alice.id, 1);

        let ControlBody::LoginSuccess {
            participants,
            host_id,
            ..
        } = login.body
        else {
            unreachable!();
        };
        assert_eq!(host_id, HOST_CLIENT_ID);
        let names: Vec<_> = participants.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["host", "alice"]);
        assert_eq!(participants[0].role, Role::Host);
    }

    #[tokio::test]
    async fn test_chat_reaches_others_not_sender() {
        let hub = start_hub(|c| c).await;

        let (mut alice, _) = TestClient::connect(hub.control, "alice").await;
        let (mut bob, _) = TestClient::connect(hub.control, "bob").await;
        let alice_id = alice.id;

        // Clear the roster notice for bob's arrival before the silence check.
        let (_, _) = alice.recv_tag("user_joined").await;

        alice.send(ControlBody::Chat {
            text: "hi".into(),
            sender_id: None,
            sender_name: None,
        })
        .await;

        let (chat, _) = bob.recv_tag("chat").await;
        let ControlBody::Chat {
            text,
            sender_id,
            sender_name,
        } = chat.body
        else {
            unreachable!();
        };
        assert_eq!(text, "hi");
        assert_eq!(sender_id, Some(alice_id));
        assert_eq!(sender_name.as_deref(), Some("alice"));

        // The sender never sees its own chat echoed back.
        alice.expect_nothing(Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn test_session_full_login_error() {
        // Limit 2 = the local host + one guest.
        let hub = start_hub(|c| c.max_participants(2)).await;

        let (_alice, _) = TestClient::connect(hub.control, "alice").await;

        let mut stream = TcpStream::connect(hub.control).await.unwrap();
        let login = Envelope::now(ControlBody::Login { name: "late".into() });
        write_frame(&mut stream, &login.to_bytes().unwrap())
            .await
            .unwrap();

        let payload = read_frame(&mut stream, crate::MAX_FRAME_SIZE, RECV_TIMEOUT)
            .await
            .unwrap();
        let reply = Envelope::from_slice(&payload).unwrap();
        assert!(matches!(reply.body, ControlBody::LoginError { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tag_does_not_drop_connection() {
        let hub = start_hub(|c| c).await;

        let (mut alice, _) = TestClient::connect(hub.control, "alice").await;
        let (mut bob, _) = TestClient::connect(hub.control, "bob").await;

        // Hand-built record with a tag this hub has never heard of.
        let raw = format!(
            r#"{{"type":"emoji_reaction","timestamp":"{}","emoji":"wave"}}"#,
            chrono::Utc::now().to_rfc3339()
        );
        write_frame(&mut alice.stream, raw.as_bytes()).await.unwrap();

        // Connection is still alive and useful.
        alice.send(ControlBody::Chat {
            text: "still here".into(),
            sender_id: None,
            sender_name: None,
        })
        .await;
        let (chat, _) = bob.recv_tag("chat").await;
        assert!(matches!(chat.body, ControlBody::Chat { .. }));
    }

    #[tokio::test]
    async fn test_oversize_frame_closes_connection() {
        let hub = start_hub(|c| c).await;
        let (mut alice, _) = TestClient::connect(hub.control, "alice").await;

        // Declare a 2 MiB payload; the hub hangs up without reading it.
        alice.stream.write_u32(2 * 1024 * 1024).await.unwrap();

        let closed = read_frame(&mut alice.stream, crate::MAX_FRAME_SIZE, RECV_TIMEOUT).await;
        assert!(closed.is_err());
    }

    #[tokio::test]
    async fn test_presenter_flow_and_screen_relay() {
        let hub = start_hub(|c| c).await;

        let (mut alice, _) = TestClient::connect(hub.control, "alice").await;
        let (mut bob, _) = TestClient::connect(hub.control, "bob").await;
        let alice_id = alice.id;

        alice.send(ControlBody::RequestPresenter).await;
        let (_, _) = alice.recv_tag("presenter_granted").await;

        let (changed, _) = bob.recv_tag("presenter_changed").await;
        assert!(matches!(
            changed.body,
            ControlBody::PresenterChanged { presenter_id: Some(id) } if id == alice_id
        ));

        // Screen frames from the presenter reach everyone else verbatim.
        alice.send(ControlBody::screen_frame(b"screen-bytes")).await;
        let (frame, _) = bob.recv_tag("screen_frame").await;
        let ControlBody::ScreenFrame { frame_data } = frame.body else {
            unreachable!();
        };
        assert_eq!(
            crate::protocol::message::decode_screen_frame(&frame_data).unwrap(),
            b"screen-bytes"
        );

        // Frames from a non-presenter are dropped by policy: bob's screen
        // frame must not precede his chat on alice's socket.
        bob.send(ControlBody::screen_frame(b"not-presenter")).await;
        bob.send(ControlBody::Chat {
            text: "after the dropped frame".into(),
            sender_id: None,
            sender_name: None,
        })
        .await;
        let (_, skipped) = alice.recv_tag("chat").await;
        assert!(!skipped.iter().any(|t| t == "screen_frame"));
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_evicts() {
        let hub = start_hub(|c| {
            c.heartbeat_timeouts(Duration::from_millis(200), Duration::from_millis(500))
        })
        .await;

        let (alice, _) = TestClient::connect(hub.control, "alice").await;
        let alice_id = alice.id;

        // No heartbeats: the 1 s sweep evicts after the hard timeout.
        let mut host_events = hub.host_events;
        let left = timeout(Duration::from_secs(5), async {
            loop {
                let env = host_events.recv().await.expect("host events open");
                if let ControlBody::UserLeft { id, reason, .. } = env.body {
                    if id == alice_id {
                        return reason;
                    }
                }
            }
        })
        .await
        .expect("eviction within hard timeout + sweep interval");

        assert_eq!(left.as_deref(), Some("timeout"));
        assert!(hub.registry.snapshot().get(alice_id).is_none());
    }

    #[tokio::test]
    async fn test_heartbeats_keep_participant_alive() {
        let hub = start_hub(|c| {
            c.heartbeat_timeouts(Duration::from_millis(400), Duration::from_millis(800))
        })
        .await;

        let (mut alice, _) = TestClient::connect(hub.control, "alice").await;
        let alice_id = alice.id;

        // Heartbeat at ~4x the hard-timeout rate for a while.
        for _ in 0..10 {
            alice.send(ControlBody::Heartbeat).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        assert!(hub.registry.snapshot().get(alice_id).is_some());
    }

    #[tokio::test]
    async fn test_kick_notifies_then_disconnects() {
        let hub = start_hub(|c| c).await;
        let (mut alice, _) = TestClient::connect(hub.control, "alice").await;
        let alice_id = alice.id;

        hub.registry
            .moderate(HOST_CLIENT_ID, ModAction::Kick { target: alice_id })
            .await
            .unwrap();

        let (_, _) = alice.recv_tag("kick").await;
        // After the flush the hub hangs up.
        let next = read_frame(&mut alice.stream, crate::MAX_FRAME_SIZE, RECV_TIMEOUT).await;
        assert!(next.is_err());
        assert!(hub.registry.snapshot().get(alice_id).is_none());
    }

    #[tokio::test]
    async fn test_logout_broadcasts_user_left() {
        let hub = start_hub(|c| c).await;
        let (mut alice, _) = TestClient::connect(hub.control, "alice").await;
        let (mut bob, _) = TestClient::connect(hub.control, "bob").await;
        let alice_id = alice.id;

        alice.send(ControlBody::Logout).await;

        let (left, _) = bob.recv_tag("user_left").await;
        let ControlBody::UserLeft { id, reason, .. } = left.body else {
            unreachable!();
        };
        assert_eq!(id, alice_id);
        assert!(reason.is_none());
    }

    #[tokio::test]
    async fn test_video_datagram_relay() {
        let hub = start_hub(|c| c).await;

        let (mut alice, _) = TestClient::connect(hub.control, "alice").await;
        let (_bob_client, _) = TestClient::connect(hub.control, "bob").await;
        let alice_id = alice.id;
        let bob_id = _bob_client.id;

        let alice_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Bob announces his endpoint with one datagram (its payload is
        // dropped by policy since his camera is off; the address sticks).
        let hello = crate::protocol::datagram::VideoHeader::encode(bob_id, 0, b"");
        bob_udp.send_to(&hello, hub.video).await.unwrap();

        // Alice turns her camera on, announces her endpoint, then streams.
        alice.send(ControlBody::MediaState {
            id: None,
            video_on: Some(true),
            audio_on: None,
        })
        .await;

        let frame = crate::protocol::datagram::VideoHeader::encode(alice_id, 7, b"frame-bytes");
        let mut delivered = None;
        let mut buf = vec![0u8; 2048];

        // Media state and address learning race the first datagrams; retry
        // a few times like a real video stream would.
        for _ in 0..20 {
            alice_udp.send_to(&frame, hub.video).await.unwrap();
            match timeout(Duration::from_millis(200), bob_udp.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    delivered = Some(buf[..len].to_vec());
                    break;
                }
                _ => continue,
            }
        }

        let delivered = delivered.expect("relayed datagram");
        assert_eq!(delivered, frame.to_vec());

        // Sender exclusion: nothing comes back to alice's socket.
        let echo = timeout(Duration::from_millis(300), alice_udp.recv_from(&mut buf)).await;
        assert!(echo.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_notifies_clients() {
        let spool = tempfile::TempDir::new().unwrap();
        let config = HubConfig::with_addr("127.0.0.1".parse().unwrap())
            .ports(0, 0, 0)
            .spool_dir(spool.path());

        let server = HubServer::bind(config).await.unwrap();
        let addr = server.control_addr().unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(async move {
            server
                .run_until(async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        let (mut alice, _) = TestClient::connect(addr, "alice").await;
        stop_tx.send(()).unwrap();

        let (notice, _) = alice.recv_tag("server_shutdown").await;
        assert!(matches!(notice.body, ControlBody::ServerShutdown));

        let result = timeout(Duration::from_secs(5), run).await;
        assert!(result.is_ok());
    }
}
