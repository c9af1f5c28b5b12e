//! The connection engine.
//!
//! A [`Connection`] owns one transport after a successful opening handshake.
//! It runs a read loop that reassembles messages, answers pings and follows
//! the closing handshake, and a close task that releases the transport in
//! bounded stages.
//!
//! ## Connection Lifecycle
//!
//! 1. **Connecting** - opening handshake in progress
//! 2. **Open** - messages flow in both directions
//! 3. **Closing** - a close frame was sent or received
//! 4. **Closed** - the transport is released
//!
//! States only move forward.

mod role;
mod state;

pub use role::Role;
pub use state::ConnectionState;

#[cfg(feature = "async-tokio")]
#[allow(clippy::module_inception)]
mod connection;
#[cfg(feature = "async-tokio")]
mod ping;
#[cfg(feature = "async-tokio")]
mod transport;

#[cfg(feature = "async-tokio")]
pub use connection::Connection;
#[cfg(feature = "async-tokio")]
pub(crate) use connection::Negotiated;
#[cfg(feature = "async-tokio")]
pub use ping::PongWaiter;
#[cfg(feature = "async-tokio")]
pub use transport::Transport;
