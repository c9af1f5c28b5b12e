//! # wsconn - RFC 6455 WebSocket connection engine
//!
//! `wsconn` turns a byte stream into a WebSocket connection: it runs the
//! opening handshake, encodes and decodes frames, negotiates extensions and
//! drives the closing handshake to completion in bounded time.
//!
//! ## Features
//!
//! - **Frame codec** with strict validation of incoming frames
//! - **Opening handshake** for both roles, with subprotocol and extension negotiation
//! - **permessage-deflate** compression (RFC 7692, feature `compression`)
//! - **Connection engine** with automatic pong replies, ping tracking and a
//!   staged closing handshake
//! - **Backpressure** through a bounded inbound queue
//!
//! TLS, listeners and proxies are left to the embedder: any stream that
//! implements [`Transport`] can carry a connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wsconn::{CloseCode, Config, Message};
//!
//! # async fn run() -> wsconn::Result<()> {
//! let conn = wsconn::client::connect("ws://127.0.0.1:9001/", &Config::client()).await?;
//! conn.send(Message::text("hello")).await?;
//! println!("{:?}", conn.recv().await?);
//! conn.close(CloseCode::Normal, "done").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod message;
pub mod protocol;

#[cfg(feature = "async-tokio")]
pub mod client;
#[cfg(feature = "async-tokio")]
pub mod codec;
#[cfg(feature = "async-tokio")]
pub mod server;

pub use config::Config;
#[cfg(feature = "async-tokio")]
pub use connection::{Connection, PongWaiter, Transport};
pub use connection::{ConnectionState, Role};
pub use error::{Error, Result};
pub use extensions::ExtensionFactory;
pub use message::{CloseCode, CloseFrame, Message};
pub use protocol::{
    HandshakeRequest, HandshakeResponse, Headers, OpCode, WS_GUID, compute_accept_key,
};
