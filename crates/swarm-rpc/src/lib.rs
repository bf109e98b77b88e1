//! Peer-to-peer event runtime on top of the swarm wire protocol.
//!
//! Both ends of a connection are symmetric once the handshake settles:
//! each side can register named events and invoke the other side's
//! events, with scalar or streamed parameters and results. The server
//! additionally authenticates incoming handshakes and tracks the set of
//! live peers; the client owns the keep-alive loop and reconnects after
//! transport loss.

use std::time::Duration;

pub mod client;
pub mod convert;
pub mod peer;
pub mod pipes;
pub mod server;
pub mod transport;

pub use client::{ClientConfig, EventClient};
pub use convert::from_value_lenient;
pub use peer::{
    handler_fn, EventArgs, EventReply, FieldValue, Handler, InvokeOptions, PeerCallback,
    PeerCore, PeerInfo, StreamItem,
};
pub use pipes::{PipeTable, PipeTableConfig};
pub use server::{EventServer, ServerConfig};
pub use transport::{find_available_port, unix_socket_path, Endpoint};

/// How often a client probes the server for liveness.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// A peer is considered alive while its last keep-alive is younger than
/// twice the probe interval.
pub const ALIVE_FACTOR: u32 = 2;

/// How long each side waits for the handshake to settle.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between client reconnect attempts after transport loss.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(6);

/// Default upper bound on one `invoke` round trip.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(300);

/// Fresh 32-char hyphenless correlation id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The transport dropped, or the target peer is not connected.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A bounded wait (invoke, handshake, connect) elapsed.
    #[error("timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// The remote handler reported a failure for this invocation.
    #[error("event `{event}` failed on peer: {reason}")]
    EventInvoke { event: String, reason: String },

    /// The server rejected our handshake. Not retried.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error(transparent)]
    Wire(#[from] swarm_wire::WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bad value for `{what}`: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// A correlation pipe was consumed twice or closed underneath us.
    #[error("pipe `{0}` unavailable")]
    PipeUnavailable(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Boxed future used for dynamically registered event handlers.
pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Epoch milliseconds now.
pub(crate) fn epoch_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
