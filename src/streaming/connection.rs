//! Connection manager (component D).
//!
//! A dedicated task that accepts exactly one streaming connection at a
//! time, drives the version->init->available handshake, reads inbound
//! bytes until disconnect, and purges the registry on teardown. Grounded
//! on the teacher's `tunnel::dispatcher`/`tunnel::mod` task-lifecycle shape;
//! exact init/handshake/teardown ordering resolved from the original
//! `streaming_handler.c`.

use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;

use super::meta;
use super::registry::SignalRegistry;
use super::stream::{self, SendBackend, StreamHandle};
use super::ws_rx::{self, RxOutcome};

/// A duplex byte stream, type-erased so the connection manager doesn't
/// care whether it came from a raw TCP accept or a completed WS upgrade.
pub trait DuplexSocket: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexSocket for T {}
pub type BoxedSocket = Box<dyn DuplexSocket>;

pub struct IncomingConnection {
    pub socket: BoxedSocket,
    pub backend: SendBackend,
}

/// Single-slot "mailbox": the HTTP server's WS-upgrade hook hands off
/// completed upgrades here. Capacity 1 plus the consumer only calling
/// `recv()` again once it has fully finished the previous connection is
/// what enforces "at most one stream exists process-wide" — a second
/// `try_send` while the manager is busy fails, and the caller responds
/// with CLOSE 1013 without the streaming task ever observing that handle.
pub type Mailbox = mpsc::Sender<IncomingConnection>;

/// Shared slot the JSON-RPC handler reads to find the currently active
/// stream (replaces the original's per-request "userdata" pointer).
pub type ActiveStream = Arc<RwLock<Option<StreamHandle>>>;

pub struct ConnectionManager {
    registry: Arc<SignalRegistry>,
    config: Arc<Config>,
    source: Arc<dyn super::registry::SampleSource>,
    active_stream: ActiveStream,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<SignalRegistry>,
        config: Arc<Config>,
        source: Arc<dyn super::registry::SampleSource>,
        active_stream: ActiveStream,
    ) -> Self {
        Self {
            registry,
            config,
            source,
            active_stream,
        }
    }

    /// WebSocket-build main loop: block on the mailbox, handle one
    /// connection to completion, repeat.
    pub async fn run_websocket(
        self: Arc<Self>,
        mut mailbox_rx: mpsc::Receiver<IncomingConnection>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe_conn = mailbox_rx.recv() => {
                    match maybe_conn {
                        Some(conn) => self.handle_connection(conn).await,
                        None => {
                            info!("mailbox closed, connection manager exiting");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested, connection manager exiting");
                    return;
                }
            }
        }
    }

    /// Raw-TCP build main loop: accept directly on `STREAMING_TCP_PORT`.
    pub async fn run_raw_tcp(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.config.tcp_port));
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "streaming TCP listener bound");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            debug!(%peer, "raw TCP streaming client accepted");
                            self.handle_connection(IncomingConnection {
                                socket: Box::new(socket),
                                backend: SendBackend::RawTcp,
                            }).await;
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested, TCP connection manager exiting");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, conn: IncomingConnection) {
        let generation = stream::next_generation();
        let mut rng = OsRng;
        let stream_id = stream::generate_stream_id(&mut rng);

        let (mut read_half, write_half) = tokio::io::split(conn.socket);
        let (tx, writer_handle) = stream::spawn_writer(write_half);
        let handle = StreamHandle::new(generation, stream_id.clone(), conn.backend, tx);

        info!(stream_id = %stream_id, "streaming client connected");

        let _ = handle.send_meta(0, meta::build_api_version());
        let jsonrpc_cfg = meta::JsonRpcHttpConfig {
            enabled: self.config.include_config_channel,
            http_method: &self.config.jsonrpc_http_method,
            http_version: &self.config.jsonrpc_http_version,
            http_path: &self.config.jsonrpc_path,
        };
        let _ = handle.send_meta(0, meta::build_init(&stream_id, &jsonrpc_cfg));
        self.registry.send_all_avail(&handle);
        self.source.on_connect();

        *self.active_stream.write() = Some(handle.clone());

        let is_websocket = matches!(conn.backend, SendBackend::WebSocket);
        let mut buf = vec![0u8; 8192];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    debug!(stream_id = %stream_id, "stream EOF");
                    break;
                }
                Ok(n) => {
                    if is_websocket {
                        if ws_rx::process_read(&mut buf[..n], &handle) == RxOutcome::CloseDeferred {
                            // Deferred close: let the already-queued reply
                            // drain through the writer task before we tear
                            // down, mirroring the stack's delayed-exec
                            // mechanism in the original.
                            tokio::task::yield_now().await;
                            break;
                        }
                    }
                }
                Err(e) => {
                    debug!(stream_id = %stream_id, error = %e, "stream read error");
                    break;
                }
            }
        }

        *self.active_stream.write() = None;
        self.registry.purge_stream(handle.id());
        drop(handle);
        let _ = writer_handle.await;

        info!(stream_id = %stream_id, "streaming client disconnected, purged");
    }
}

/// Create the mailbox channel pair used by the WS build: the HTTP server
/// keeps the sender, the connection manager owns the receiver.
pub fn new_mailbox() -> (Mailbox, mpsc::Receiver<IncomingConnection>) {
    mpsc::channel(1)
}
