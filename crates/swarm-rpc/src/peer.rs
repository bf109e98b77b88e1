//! The peer runtime shared by both ends of a connection: registered
//! events, live peers, outbound writers, and the dispatch of incoming
//! messages onto handlers and correlation pipes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use swarm_wire::{
    pipe_key, split_chunks, EventField, EventInvoke, FrameHeader, KeepAlive, Message, Reassembler,
    DEFAULT_CHUNK_SIZE, FRAME_HEADER_BYTES, RETURN_FIELD,
};

use crate::convert::from_value_lenient;
use crate::pipes::{PipeTable, PipeTableConfig};
use crate::transport::BoxedStream;
use crate::{epoch_ms, new_id, BoxFuture, Result, RpcError, ALIVE_FACTOR, DEFAULT_INVOKE_TIMEOUT};

/// Identity and liveness of a connected peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub host: String,
    /// Set when the peer is itself listening.
    pub port: Option<u32>,
    /// Epoch ms of the most recent keep-alive (or connect).
    pub last_alive_ms: u64,
}

/// One element of a streamed field or result: a value, or the remote
/// error text that terminated the stream. An `Err` is always the last
/// element delivered.
pub type StreamItem = std::result::Result<Value, String>;

/// One parameter or result of an invocation.
pub enum FieldValue {
    Single(Value),
    Stream(mpsc::Receiver<StreamItem>),
}

impl FieldValue {
    fn is_stream(&self) -> bool {
        matches!(self, FieldValue::Stream(_))
    }
}

/// Arguments handed to a registered handler.
pub struct EventArgs {
    pub peer_id: String,
    pub event: String,
    fields: HashMap<String, FieldValue>,
}

impl EventArgs {
    pub fn take(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Take a scalar field, decoded leniently into `T`.
    pub fn take_as<T: DeserializeOwned>(&mut self, name: &str) -> Result<T> {
        match self.fields.remove(name) {
            Some(FieldValue::Single(v)) => from_value_lenient(name, v),
            Some(FieldValue::Stream(_)) => Err(RpcError::EventInvoke {
                event: self.event.clone(),
                reason: format!("field `{name}` is a stream, expected a value"),
            }),
            None => Err(RpcError::EventInvoke {
                event: self.event.clone(),
                reason: format!("missing field `{name}`"),
            }),
        }
    }

    pub fn take_stream(&mut self, name: &str) -> Result<mpsc::Receiver<StreamItem>> {
        match self.fields.remove(name) {
            Some(FieldValue::Stream(rx)) => Ok(rx),
            Some(FieldValue::Single(_)) => Err(RpcError::EventInvoke {
                event: self.event.clone(),
                reason: format!("field `{name}` is a value, expected a stream"),
            }),
            None => Err(RpcError::EventInvoke {
                event: self.event.clone(),
                reason: format!("missing field `{name}`"),
            }),
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Flatten all fields into one JSON object. Fails when any field is
    /// a stream.
    pub fn into_scalar_map(self) -> Result<serde_json::Map<String, Value>> {
        let mut map = serde_json::Map::with_capacity(self.fields.len());
        for (name, value) in self.fields {
            match value {
                FieldValue::Single(v) => {
                    map.insert(name, v);
                }
                FieldValue::Stream(_) => {
                    return Err(RpcError::EventInvoke {
                        event: self.event,
                        reason: format!("field `{name}` is a stream, expected a value"),
                    });
                }
            }
        }
        Ok(map)
    }
}

/// What a handler hands back: one value or a stream of them. An `Err`
/// element in the stream travels to the caller as an error-flagged
/// chunk and ends the stream.
pub enum EventReply {
    Single(Value),
    Stream(mpsc::Receiver<StreamItem>),
}

/// Registered event handler. A returned `Err` string travels to the
/// caller as an error-flagged result field.
pub type Handler =
    Arc<dyn Fn(EventArgs) -> BoxFuture<std::result::Result<EventReply, String>> + Send + Sync>;

pub type PeerCallback = Arc<dyn Fn(PeerInfo) + Send + Sync>;

/// Wrap an async closure as a registrable [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(EventArgs) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<EventReply, String>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Bound on the whole round trip. Elapsing it abandons the waiting
    /// pipe but does not cancel execution on the remote peer.
    pub timeout: Duration,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }
}

struct PeerSlot {
    info: PeerInfo,
    frames_tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
}

struct Inner {
    name: String,
    events: Mutex<HashMap<String, Handler>>,
    pipes: PipeTable,
    peers: Mutex<HashMap<String, PeerSlot>>,
    on_connected: Mutex<Option<PeerCallback>>,
    on_disconnected: Mutex<Option<PeerCallback>>,
    chunk_size: usize,
}

/// Shared peer runtime. Cheap to clone; all clones see one state.
#[derive(Clone)]
pub struct PeerCore {
    inner: Arc<Inner>,
}

impl PeerCore {
    pub fn new(name: impl Into<String>, pipe_config: PipeTableConfig) -> Self {
        let pipes = PipeTable::new(pipe_config);
        pipes.spawn_sweeper();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                events: Mutex::new(HashMap::new()),
                pipes,
                peers: Mutex::new(HashMap::new()),
                on_connected: Mutex::new(None),
                on_disconnected: Mutex::new(None),
                chunk_size: DEFAULT_CHUNK_SIZE,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn register_event(&self, event: impl Into<String>, handler: Handler) {
        let mut events = lock(&self.inner.events);
        events.insert(event.into(), handler);
    }

    pub fn set_on_connected(&self, cb: PeerCallback) {
        *lock(&self.inner.on_connected) = Some(cb);
    }

    pub fn set_on_disconnected(&self, cb: PeerCallback) {
        *lock(&self.inner.on_disconnected) = Some(cb);
    }

    pub fn peer_info(&self, peer_id: &str) -> Option<PeerInfo> {
        lock(&self.inner.peers).get(peer_id).map(|s| s.info.clone())
    }

    pub fn peer_ids(&self) -> Vec<String> {
        lock(&self.inner.peers).keys().cloned().collect()
    }

    /// Number of live correlation pipes (waiters plus undelivered data).
    pub fn pending_pipes(&self) -> usize {
        self.inner.pipes.len()
    }

    /// Alive while the last keep-alive is younger than twice the probe
    /// interval.
    pub fn is_alive(&self, peer_id: &str, interval: Duration) -> bool {
        let Some(info) = self.peer_info(peer_id) else {
            return false;
        };
        let window = interval.as_millis() as u64 * ALIVE_FACTOR as u64;
        epoch_ms().saturating_sub(info.last_alive_ms) < window
    }

    pub(crate) fn touch_peer(&self, peer_id: &str, at_ms: u64) {
        if let Some(slot) = lock(&self.inner.peers).get_mut(peer_id) {
            slot.info.last_alive_ms = at_ms;
        }
    }

    /// Register a validated peer and return the channels its connection
    /// task drives. Fires `on_connected`.
    pub fn add_peer(
        &self,
        info: PeerInfo,
    ) -> (mpsc::UnboundedReceiver<Vec<u8>>, watch::Receiver<bool>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cb = {
            let mut peers = lock(&self.inner.peers);
            peers.insert(
                info.id.clone(),
                PeerSlot {
                    info: info.clone(),
                    frames_tx,
                    shutdown_tx,
                },
            );
            lock(&self.inner.on_connected).clone()
        };
        debug!(peer = %info.id, name = %info.name, "peer connected");
        if let Some(cb) = cb {
            cb(info);
        }
        (frames_rx, shutdown_rx)
    }

    /// Ask a peer's connection task to wind down.
    pub fn close_peer(&self, peer_id: &str) {
        if let Some(slot) = lock(&self.inner.peers).get(peer_id) {
            let _ = slot.shutdown_tx.send(true);
        }
    }

    fn remove_peer(&self, peer_id: &str) {
        let (removed, cb) = {
            let mut peers = lock(&self.inner.peers);
            (
                peers.remove(peer_id),
                lock(&self.inner.on_disconnected).clone(),
            )
        };
        if let Some(slot) = removed {
            debug!(peer = %peer_id, "peer disconnected");
            if let Some(cb) = cb {
                cb(slot.info);
            }
        }
    }

    /// Queue one protocol message for a peer. Fails when the peer is
    /// not connected.
    pub fn send_message(&self, peer_id: &str, msg: &Message) -> Result<()> {
        let payload = msg.encode()?;
        let frames = split_chunks(&new_id(), &payload, self.inner.chunk_size)?;
        let peers = lock(&self.inner.peers);
        let slot = peers
            .get(peer_id)
            .ok_or_else(|| RpcError::ConnectionLost(format!("peer `{peer_id}` not connected")))?;
        for frame in frames {
            slot.frames_tx
                .send(frame)
                .map_err(|_| RpcError::ConnectionLost(format!("writer for `{peer_id}` closed")))?;
        }
        Ok(())
    }

    /// Drive a validated connection until the transport drops or
    /// shutdown is requested. Removes the peer and fires
    /// `on_disconnected` on the way out.
    pub async fn run_io(
        &self,
        peer_id: &str,
        stream: BoxedStream,
        mut frames_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let write_task = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let mut asm = Reassembler::new();
        let result = loop {
            tokio::select! {
                msg = read_message(&mut reader, &mut asm) => match msg {
                    Ok(msg) => self.handle_message(peer_id, msg),
                    // EOF and transport errors both end the connection.
                    Err(e) => break Err(e),
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        write_task.abort();
        self.remove_peer(peer_id);
        match result {
            // A clean close from the other side is not an error.
            Err(RpcError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(()),
            other => other,
        }
    }

    fn handle_message(&self, peer_id: &str, msg: Message) {
        match msg {
            Message::KeepAlive(ka) => {
                // Liveness is judged on our clock, not the sender's.
                self.touch_peer(peer_id, epoch_ms());
                if !ka.is_response {
                    let reply = Message::KeepAlive(KeepAlive {
                        timestamp_ms: epoch_ms(),
                        is_response: true,
                    });
                    if let Err(e) = self.send_message(peer_id, &reply) {
                        warn!(peer = %peer_id, error = %e, "keep-alive reply failed");
                    }
                }
            }
            Message::EventField(field) => {
                self.inner.pipes.push(&field.pipe_key(), field);
            }
            Message::EventInvoke(invoke) => {
                let core = self.clone();
                let peer_id = peer_id.to_owned();
                tokio::spawn(async move {
                    core.dispatch(&peer_id, invoke).await;
                });
            }
            // Handshakes are settled before a peer reaches run_io.
            Message::Handshake(_) | Message::HandshakeResult(_) => {
                warn!(peer = %peer_id, kind = %msg.kind(), "unexpected message after handshake");
            }
        }
    }

    /// Collect the declared fields off their pipes, run the handler,
    /// and write the result back as `__return__` fields.
    async fn dispatch(&self, peer_id: &str, invoke: EventInvoke) {
        let EventInvoke { id, event, fields } = invoke;
        debug!(peer = %peer_id, %event, %id, "dispatching event");

        let handler = lock(&self.inner.events).get(&event).cloned();
        let Some(handler) = handler else {
            // No reply for an unknown event; the caller runs into its
            // timeout. Field data already pushed is left for the sweep.
            warn!(peer = %peer_id, %event, "dropping invoke for unregistered event");
            return;
        };

        let mut collected = HashMap::with_capacity(fields.len());
        for field in &fields {
            match self.collect_field(&id, &event, field).await {
                Ok(value) => {
                    collected.insert(field.clone(), value);
                }
                Err(e) => {
                    self.send_error_return(peer_id, &id, &event, &e.to_string());
                    self.drop_field_pipes(&id, &event, &fields);
                    return;
                }
            }
        }

        let args = EventArgs {
            peer_id: peer_id.to_owned(),
            event: event.clone(),
            fields: collected,
        };

        match handler(args).await {
            Ok(EventReply::Single(value)) => match serde_json::to_vec(&value) {
                Ok(data) => self.send_return(peer_id, &id, &event, data, false, false),
                Err(e) => self.send_error_return(peer_id, &id, &event, &e.to_string()),
            },
            Ok(EventReply::Stream(mut rx)) => {
                let mut failed = false;
                while let Some(item) = rx.recv().await {
                    let reason = match item {
                        Ok(value) => match serde_json::to_vec(&value) {
                            Ok(data) => {
                                self.send_return(peer_id, &id, &event, data, true, false);
                                continue;
                            }
                            Err(e) => e.to_string(),
                        },
                        Err(reason) => reason,
                    };
                    warn!(peer = %peer_id, %event, %reason, "result stream failed");
                    self.send_error_return(peer_id, &id, &event, &reason);
                    failed = true;
                    break;
                }
                if !failed {
                    self.send_return(peer_id, &id, &event, Vec::new(), true, true);
                }
            }
            Err(reason) => {
                warn!(peer = %peer_id, %event, %reason, "handler failed");
                self.send_error_return(peer_id, &id, &event, &reason);
            }
        }
        self.drop_field_pipes(&id, &event, &fields);
    }

    /// Await the first message of one parameter pipe and turn it into a
    /// scalar or a pumped stream.
    async fn collect_field(&self, id: &str, event: &str, field: &str) -> Result<FieldValue> {
        let key = pipe_key(id, event, field);
        let mut rx = self.inner.pipes.take(&key)?;
        let first = rx
            .recv()
            .await
            .ok_or_else(|| RpcError::PipeUnavailable(key.clone()))?;

        if first.is_error {
            return Err(RpcError::EventInvoke {
                event: event.to_owned(),
                reason: String::from_utf8_lossy(&first.data).into_owned(),
            });
        }
        if !first.is_stream {
            return Ok(FieldValue::Single(parse_value(field, &first.data)?));
        }

        let (tx, stream_rx) = mpsc::channel(64);
        let field_name = field.to_owned();
        tokio::spawn(async move {
            let mut msg = first;
            loop {
                // An error-flagged chunk ends the stream with its reason.
                if msg.is_error {
                    let reason = String::from_utf8_lossy(&msg.data).into_owned();
                    let _ = tx.send(Err(reason)).await;
                    break;
                }
                if !msg.data.is_empty() || !msg.is_stream_end {
                    match parse_value(&field_name, &msg.data) {
                        Ok(value) => {
                            if tx.send(Ok(value)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(field = %field_name, error = %e, "bad stream chunk");
                            let _ = tx.send(Err(e.to_string())).await;
                            break;
                        }
                    }
                }
                if msg.is_stream_end {
                    break;
                }
                match rx.recv().await {
                    Some(next) => msg = next,
                    None => break,
                }
            }
        });
        Ok(FieldValue::Stream(stream_rx))
    }

    fn drop_field_pipes(&self, id: &str, event: &str, fields: &[String]) {
        for field in fields {
            self.inner.pipes.remove(&pipe_key(id, event, field));
        }
    }

    fn send_return(
        &self,
        peer_id: &str,
        id: &str,
        event: &str,
        data: Vec<u8>,
        is_stream: bool,
        is_stream_end: bool,
    ) {
        let msg = Message::EventField(EventField {
            id: id.to_owned(),
            event: event.to_owned(),
            field: RETURN_FIELD.to_owned(),
            is_stream,
            is_stream_end,
            is_error: false,
            data,
        });
        if let Err(e) = self.send_message(peer_id, &msg) {
            warn!(peer = %peer_id, %event, error = %e, "result delivery failed");
        }
    }

    fn send_error_return(&self, peer_id: &str, id: &str, event: &str, reason: &str) {
        let msg = Message::EventField(EventField {
            id: id.to_owned(),
            event: event.to_owned(),
            field: RETURN_FIELD.to_owned(),
            is_stream: false,
            is_stream_end: false,
            is_error: true,
            data: reason.as_bytes().to_vec(),
        });
        if let Err(e) = self.send_message(peer_id, &msg) {
            warn!(peer = %peer_id, %event, error = %e, "error delivery failed");
        }
    }

    /// Invoke a named event on a connected peer.
    ///
    /// Scalar fields are sent immediately; stream fields are pumped from
    /// the caller's channel by a background task. The timeout abandons
    /// the waiting pipe only; execution already underway on the remote
    /// peer is not cancelled.
    pub async fn invoke(
        &self,
        peer_id: &str,
        event: &str,
        fields: HashMap<String, FieldValue>,
        opts: InvokeOptions,
    ) -> Result<EventReply> {
        let id = new_id();
        let return_key = pipe_key(&id, event, RETURN_FIELD);
        let mut return_rx = self.inner.pipes.take(&return_key)?;

        let field_names: Vec<String> = fields.keys().cloned().collect();
        self.send_message(
            peer_id,
            &Message::EventInvoke(EventInvoke {
                id: id.clone(),
                event: event.to_owned(),
                fields: field_names,
            }),
        )?;

        for (name, value) in fields {
            match value {
                FieldValue::Single(v) => {
                    let data = serde_json::to_vec(&v).map_err(|e| RpcError::Decode {
                        what: name.clone(),
                        source: e,
                    })?;
                    self.send_message(
                        peer_id,
                        &Message::EventField(EventField {
                            id: id.clone(),
                            event: event.to_owned(),
                            field: name,
                            is_stream: false,
                            is_stream_end: false,
                            is_error: false,
                            data,
                        }),
                    )?;
                }
                FieldValue::Stream(mut rx) => {
                    let core = self.clone();
                    let peer_id = peer_id.to_owned();
                    let event = event.to_owned();
                    let id = id.clone();
                    tokio::spawn(async move {
                        while let Some(item) = rx.recv().await {
                            let (is_error, data) = match item {
                                Ok(v) => match serde_json::to_vec(&v) {
                                    Ok(d) => (false, d),
                                    Err(e) => {
                                        warn!(field = %name, error = %e, "stream encode failed");
                                        (true, e.to_string().into_bytes())
                                    }
                                },
                                Err(reason) => (true, reason.into_bytes()),
                            };
                            let msg = Message::EventField(EventField {
                                id: id.clone(),
                                event: event.clone(),
                                field: name.clone(),
                                is_stream: true,
                                is_stream_end: false,
                                is_error,
                                data,
                            });
                            if core.send_message(&peer_id, &msg).is_err() || is_error {
                                return;
                            }
                        }
                        let end = Message::EventField(EventField {
                            id,
                            event,
                            field: name,
                            is_stream: true,
                            is_stream_end: true,
                            is_error: false,
                            data: Vec::new(),
                        });
                        let _ = core.send_message(&peer_id, &end);
                    });
                }
            }
        }

        let first = match tokio::time::timeout(opts.timeout, return_rx.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                self.inner.pipes.remove(&return_key);
                return Err(RpcError::PipeUnavailable(return_key));
            }
            Err(_) => {
                self.inner.pipes.remove(&return_key);
                return Err(RpcError::ConnectionTimeout(opts.timeout));
            }
        };

        if first.is_error {
            self.inner.pipes.remove(&return_key);
            return Err(RpcError::EventInvoke {
                event: event.to_owned(),
                reason: String::from_utf8_lossy(&first.data).into_owned(),
            });
        }
        if !first.is_stream {
            self.inner.pipes.remove(&return_key);
            return Ok(EventReply::Single(parse_value(RETURN_FIELD, &first.data)?));
        }

        let (tx, stream_rx) = mpsc::channel(64);
        let pipes = self.inner.pipes.clone();
        tokio::spawn(async move {
            let mut msg = first;
            loop {
                // The remote handler failed mid-stream; the reason is
                // the terminal element.
                if msg.is_error {
                    let reason = String::from_utf8_lossy(&msg.data).into_owned();
                    let _ = tx.send(Err(reason)).await;
                    break;
                }
                if !msg.data.is_empty() || !msg.is_stream_end {
                    match parse_value(RETURN_FIELD, &msg.data) {
                        Ok(value) => {
                            if tx.send(Ok(value)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "bad result stream chunk");
                            let _ = tx.send(Err(e.to_string())).await;
                            break;
                        }
                    }
                }
                if msg.is_stream_end {
                    break;
                }
                match return_rx.recv().await {
                    Some(next) => msg = next,
                    None => break,
                }
            }
            pipes.remove(&return_key);
        });
        Ok(EventReply::Stream(stream_rx))
    }

    /// Invoke expecting a single result, decoded leniently into `T`.
    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        peer_id: &str,
        event: &str,
        fields: HashMap<String, FieldValue>,
        opts: InvokeOptions,
    ) -> Result<T> {
        match self.invoke(peer_id, event, fields, opts).await? {
            EventReply::Single(v) => from_value_lenient(event, v),
            EventReply::Stream(_) => Err(RpcError::EventInvoke {
                event: event.to_owned(),
                reason: "expected a single result, got a stream".to_owned(),
            }),
        }
    }
}

fn parse_value(what: &str, data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(data).map_err(|e| RpcError::Decode {
        what: what.to_owned(),
        source: e,
    })
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Read frames until one message reassembles completely.
pub(crate) async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    asm: &mut Reassembler,
) -> Result<Message> {
    loop {
        let mut header_raw = [0u8; FRAME_HEADER_BYTES];
        reader.read_exact(&mut header_raw).await?;
        let header = FrameHeader::decode(&header_raw)?;
        if header.len as usize > swarm_wire::MAX_MESSAGE_BYTES {
            return Err(swarm_wire::WireError::MessageTooLarge {
                len: header.len as usize,
                max: swarm_wire::MAX_MESSAGE_BYTES,
            }
            .into());
        }
        let mut chunk = vec![0u8; header.len as usize];
        reader.read_exact(&mut chunk).await?;
        if let Some(payload) = asm.push(&header, &chunk)? {
            return Ok(Message::decode(&payload)?);
        }
    }
}

/// Encode and write one message directly to a stream. Used only during
/// the handshake, before a peer has a writer task.
pub(crate) async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<()> {
    let payload = msg.encode()?;
    for frame in split_chunks(&new_id(), &payload, DEFAULT_CHUNK_SIZE)? {
        writer.write_all(&frame).await?;
    }
    writer.flush().await?;
    Ok(())
}
