//! Byte-stream transports: TCP everywhere, unix domain sockets where
//! the platform has them.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::Result;

/// Type-erased duplex stream handed to the peer runtime.
pub type BoxedStream = Box<dyn DuplexStream>;

pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    /// Named unix domain socket under the system temp dir.
    Unix { name: String },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(name: impl Into<String>) -> Self {
        Self::Unix { name: name.into() }
    }

    /// Human-readable address for logs and peer info.
    pub fn display_addr(&self) -> String {
        match self {
            Endpoint::Tcp { host, port } => format!("{host}:{port}"),
            Endpoint::Unix { name } => unix_socket_path(name).display().to_string(),
        }
    }

    pub async fn connect(&self) -> Result<BoxedStream> {
        match self {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix { name } => {
                let stream = UnixStream::connect(unix_socket_path(name)).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )
            .into()),
        }
    }
}

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Bind the endpoint, clearing a stale socket file first for unix
    /// sockets. Returns the listener and the endpoint actually bound
    /// (the port filled in when 0 was requested).
    pub async fn bind(endpoint: &Endpoint) -> Result<(Self, Endpoint)> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                let bound = listener.local_addr()?.port();
                Ok((
                    Listener::Tcp(listener),
                    Endpoint::tcp(host.clone(), bound),
                ))
            }
            #[cfg(unix)]
            Endpoint::Unix { name } => {
                let path = unix_socket_path(name);
                if path.exists() {
                    // Leftover from a previous run that died without cleanup.
                    let _ = std::fs::remove_file(&path);
                }
                let listener = UnixListener::bind(&path)?;
                Ok((Listener::Unix(listener), endpoint.clone()))
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )
            .into()),
        }
    }

    pub async fn accept(&self) -> Result<BoxedStream> {
        match self {
            Listener::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Where a named unix socket lives.
pub fn unix_socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("swarm-{name}.sock"))
}

/// Ask the OS for a currently free TCP port.
pub async fn find_available_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0)).await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_available_port_yields_bindable_port() {
        let port = find_available_port("127.0.0.1").await.unwrap();
        assert_ne!(port, 0);
        // The probe listener is closed, so the port is free again.
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_bind_clears_stale_socket_file() {
        let name = format!("stale-{}", crate::new_id());
        let path = unix_socket_path(&name);
        std::fs::write(&path, b"").unwrap();
        let (_listener, _) = Listener::bind(&Endpoint::unix(name)).await.unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
