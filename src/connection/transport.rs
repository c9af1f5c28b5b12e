//! Byte streams a connection can run on.

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// A reliable, ordered byte stream carrying one WebSocket connection.
///
/// TLS and other stream wrappers implement this to plug into the engine.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Whether shutting down the write direction leaves the read direction
    /// usable (TCP half-close). Streams like TLS that tear down both
    /// directions at once return `false`.
    fn supports_half_close(&self) -> bool {
        true
    }
}

impl Transport for TcpStream {}

impl Transport for DuplexStream {}

#[cfg(unix)]
impl Transport for tokio::net::UnixStream {}
