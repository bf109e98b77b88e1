//! Connecting side of the event protocol: handshake, keep-alive, and
//! reconnection after transport loss.
//!
//! An authentication rejection is terminal. Everything else (refused
//! connect, dropped transport, dead keep-alive) is retried after the
//! configured interval, forever, until `close`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use swarm_wire::{Handshake, KeepAlive, Message, Reassembler};

use crate::peer::{
    read_message, write_message, EventReply, FieldValue, InvokeOptions, PeerCore, PeerInfo,
};
use crate::transport::{BoxedStream, Endpoint};
use crate::{
    epoch_ms, new_id, Result, RpcError, AUTH_TIMEOUT, KEEPALIVE_INTERVAL, RETRY_INTERVAL,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub description: Option<String>,
    pub endpoint: Endpoint,
    pub auth: Option<String>,
    /// Our own listening port, when this peer is also a server.
    pub port: Option<u32>,
    pub auth_timeout: Duration,
    pub keepalive_interval: Duration,
    pub retry_interval: Duration,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            description: None,
            endpoint,
            auth: None,
            port: None,
            auth_timeout: AUTH_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }
}

struct Shared {
    core: PeerCore,
    config: ClientConfig,
    server_id: Mutex<Option<String>>,
    connected_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct EventClient {
    shared: Arc<Shared>,
}

impl EventClient {
    /// Connect and complete the handshake. The first attempt is done
    /// inline so a bad address or rejected token fails fast; afterwards
    /// a background task owns the connection and reconnects on loss.
    pub async fn connect(config: ClientConfig, core: PeerCore) -> Result<Self> {
        let (connected_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            core,
            config,
            server_id: Mutex::new(None),
            connected_tx,
            shutdown_tx,
        });

        let session = open_session(&shared).await?;
        info!(
            name = %shared.config.name,
            addr = %shared.config.endpoint.display_addr(),
            "connected to event server"
        );
        tokio::spawn(run_loop(shared.clone(), Some(session)));
        Ok(Self { shared })
    }

    pub fn core(&self) -> &PeerCore {
        &self.shared.core
    }

    /// Peer id of the server for this session, if connected.
    pub fn server_id(&self) -> Option<String> {
        lock(&self.shared.server_id).clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    /// Wait until the client holds a live session.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.connected_tx.subscribe();
        let wait = async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return Err(RpcError::ConnectionLost("client closed".to_owned()));
                }
            }
            Ok(())
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RpcError::ConnectionTimeout(timeout))?
    }

    pub async fn invoke(
        &self,
        event: &str,
        fields: HashMap<String, FieldValue>,
        opts: InvokeOptions,
    ) -> Result<EventReply> {
        let server = self
            .server_id()
            .ok_or_else(|| RpcError::ConnectionLost("not connected".to_owned()))?;
        self.shared.core.invoke(&server, event, fields, opts).await
    }

    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        event: &str,
        fields: HashMap<String, FieldValue>,
        opts: InvokeOptions,
    ) -> Result<T> {
        let server = self
            .server_id()
            .ok_or_else(|| RpcError::ConnectionLost("not connected".to_owned()))?;
        self.shared
            .core
            .invoke_as(&server, event, fields, opts)
            .await
    }

    /// Stop reconnecting and drop the current session.
    pub fn close(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        if let Some(server) = self.server_id() {
            self.shared.core.close_peer(&server);
        }
    }
}

impl Drop for EventClient {
    fn drop(&mut self) {
        self.close();
    }
}

struct Session {
    peer_id: String,
    stream: BoxedStream,
    frames_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    conn_shutdown: watch::Receiver<bool>,
}

async fn run_loop(shared: Arc<Shared>, mut first: Option<Session>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        let session = match first.take() {
            Some(s) => Ok(s),
            None => open_session(&shared).await,
        };
        match session {
            Ok(session) => {
                let keepalive = spawn_keepalive(
                    shared.core.clone(),
                    session.peer_id.clone(),
                    shared.config.keepalive_interval,
                );
                let result = shared
                    .core
                    .run_io(
                        &session.peer_id,
                        session.stream,
                        session.frames_rx,
                        session.conn_shutdown,
                    )
                    .await;
                keepalive.abort();
                *lock(&shared.server_id) = None;
                let _ = shared.connected_tx.send(false);
                if let Err(e) = result {
                    warn!(error = %e, "session ended");
                }
            }
            // Rejected auth will not succeed on retry.
            Err(RpcError::HandshakeRejected(reason)) => {
                error!(%reason, "handshake rejected, giving up");
                return;
            }
            Err(e) => {
                debug!(error = %e, "connect attempt failed");
            }
        }

        if *shutdown_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(shared.config.retry_interval) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Dial, present the handshake, and register the server as a peer.
async fn open_session(shared: &Arc<Shared>) -> Result<Session> {
    let config = &shared.config;
    let mut stream = config.endpoint.connect().await?;

    let pipe_id = new_id();
    write_message(
        &mut stream,
        &Message::Handshake(Handshake {
            pipe_id: pipe_id.clone(),
            name: config.name.clone(),
            description: config.description.clone(),
            host: "localhost".to_owned(),
            port: config.port,
            auth: config.auth.clone(),
        }),
    )
    .await?;

    let verdict = tokio::time::timeout(config.auth_timeout, async {
        let mut asm = Reassembler::new();
        loop {
            match read_message(&mut stream, &mut asm).await? {
                Message::HandshakeResult(r) if r.pipe_id == pipe_id => {
                    return Ok::<_, RpcError>(r)
                }
                other => debug!(kind = %other.kind(), "ignoring message before verdict"),
            }
        }
    })
    .await
    .map_err(|_| RpcError::ConnectionTimeout(config.auth_timeout))??;

    if !verdict.success {
        return Err(RpcError::HandshakeRejected(
            verdict
                .fail_reason
                .unwrap_or_else(|| "no reason given".to_owned()),
        ));
    }

    let info = PeerInfo {
        id: new_id(),
        name: verdict.name.unwrap_or_default(),
        description: verdict.description,
        host: verdict.host.unwrap_or_else(|| match &config.endpoint {
            Endpoint::Tcp { host, .. } => host.clone(),
            Endpoint::Unix { name } => name.clone(),
        }),
        port: verdict.port,
        last_alive_ms: epoch_ms(),
    };
    let peer_id = info.id.clone();
    let (frames_rx, conn_shutdown) = shared.core.add_peer(info);
    *lock(&shared.server_id) = Some(peer_id.clone());
    let _ = shared.connected_tx.send(true);

    Ok(Session {
        peer_id,
        stream,
        frames_rx,
        conn_shutdown,
    })
}

/// Probe the server periodically; force the session down when the
/// responses stop arriving.
fn spawn_keepalive(
    core: PeerCore,
    peer_id: String,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tick.tick().await;
            let probe = Message::KeepAlive(KeepAlive {
                timestamp_ms: epoch_ms(),
                is_response: false,
            });
            if core.send_message(&peer_id, &probe).is_err() {
                break;
            }
            if !core.is_alive(&peer_id, interval) {
                warn!(peer = %peer_id, "keep-alive window elapsed, dropping session");
                core.close_peer(&peer_id);
                break;
            }
        }
    })
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
