//! Accepting side of the event protocol: bind, authenticate handshakes,
//! and promote validated connections into tracked peers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use swarm_wire::{Handshake, HandshakeResult, Message, Reassembler};

use crate::peer::{read_message, write_message, PeerCore, PeerInfo};
use crate::transport::{BoxedStream, Endpoint, Listener};
use crate::{epoch_ms, new_id, Result, RpcError, AUTH_TIMEOUT};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub description: Option<String>,
    pub endpoint: Endpoint,
    /// When set, handshakes must carry the matching token.
    pub auth: Option<String>,
    /// How long a fresh connection may take to present its handshake.
    pub auth_timeout: Duration,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            description: None,
            endpoint,
            auth: None,
            auth_timeout: AUTH_TIMEOUT,
        }
    }
}

pub struct EventServer {
    core: PeerCore,
    config: ServerConfig,
    bound: Endpoint,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventServer {
    /// Bind the endpoint and start accepting connections. Events should
    /// be registered on `core` before peers start invoking them.
    pub async fn start(config: ServerConfig, core: PeerCore) -> Result<Arc<Self>> {
        let (listener, bound) = Listener::bind(&config.endpoint).await?;
        info!(name = %config.name, addr = %bound.display_addr(), "event server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Arc::new(Self {
            core,
            config,
            bound,
            shutdown_tx,
            accept_task: Mutex::new(None),
        });

        let accept = tokio::spawn(accept_loop(server.clone(), listener, shutdown_rx));
        *server
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(accept);
        Ok(server)
    }

    pub fn core(&self) -> &PeerCore {
        &self.core
    }

    /// Endpoint actually bound (the port resolved when 0 was asked for).
    pub fn bound_endpoint(&self) -> &Endpoint {
        &self.bound
    }

    pub fn bound_port(&self) -> Option<u32> {
        match &self.bound {
            Endpoint::Tcp { port, .. } => Some(*port as u32),
            Endpoint::Unix { .. } => None,
        }
    }

    /// Stop accepting and wind down every live connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
            let _ = task.await;
        }
        for peer_id in self.core.peer_ids() {
            self.core.close_peer(&peer_id);
        }
    }
}

async fn accept_loop(
    server: Arc<EventServer>,
    listener: Listener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let server = server.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(server, stream).await {
                            debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Settle the handshake within the auth window, then hand the stream to
/// the peer runtime.
async fn serve_connection(server: Arc<EventServer>, mut stream: BoxedStream) -> Result<()> {
    let hs = tokio::time::timeout(server.config.auth_timeout, read_handshake(&mut stream))
        .await
        .map_err(|_| RpcError::ConnectionTimeout(server.config.auth_timeout))??;

    if let Some(expected) = &server.config.auth {
        if hs.auth.as_deref() != Some(expected.as_str()) {
            warn!(peer = %hs.name, "handshake rejected: bad auth token");
            let verdict = Message::HandshakeResult(HandshakeResult {
                pipe_id: hs.pipe_id,
                name: None,
                description: None,
                host: None,
                port: None,
                success: false,
                fail_reason: Some("authentication failed".to_owned()),
            });
            // Deliver the verdict on a best-effort basis, then drop.
            let _ = write_message(&mut stream, &verdict).await;
            return Ok(());
        }
    }

    let verdict = Message::HandshakeResult(HandshakeResult {
        pipe_id: hs.pipe_id,
        name: Some(server.config.name.clone()),
        description: server.config.description.clone(),
        host: match &server.bound {
            Endpoint::Tcp { host, .. } => Some(host.clone()),
            Endpoint::Unix { .. } => None,
        },
        port: server.bound_port(),
        success: true,
        fail_reason: None,
    });

    let info = PeerInfo {
        id: new_id(),
        name: hs.name,
        description: hs.description,
        host: hs.host,
        port: hs.port,
        last_alive_ms: epoch_ms(),
    };
    let peer_id = info.id.clone();
    // Register before the verdict goes out so the peer is visible the
    // moment the client sees success. The writer task is not running
    // yet, so the verdict is still the first thing on the wire.
    let (frames_rx, conn_shutdown) = server.core.add_peer(info);
    if let Err(e) = write_message(&mut stream, &verdict).await {
        // run_io below unregisters the peer; asking for shutdown up
        // front makes it do so immediately.
        server.core.close_peer(&peer_id);
        let _ = server
            .core
            .run_io(&peer_id, stream, frames_rx, conn_shutdown)
            .await;
        return Err(e);
    }
    server
        .core
        .run_io(&peer_id, stream, frames_rx, conn_shutdown)
        .await
}

/// First message on a fresh connection must be the handshake.
async fn read_handshake(stream: &mut BoxedStream) -> Result<Handshake> {
    let mut asm = Reassembler::new();
    match read_message(stream, &mut asm).await? {
        Message::Handshake(hs) => Ok(hs),
        other => Err(RpcError::ConnectionLost(format!(
            "expected handshake, got {other}"
        ))),
    }
}
