//! Connection state machine (RFC 6455 Section 4 and 7).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a connection.
///
/// States only move forward: `Connecting`, `Open`, `Closing`, `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Opening handshake in progress.
    #[default]
    Connecting = 0,
    /// Data may flow in both directions.
    Open = 1,
    /// A close frame was sent or received.
    Closing = 2,
    /// The transport is released.
    Closed = 3,
}

impl ConnectionState {
    #[must_use]
    #[inline]
    pub const fn is_active(self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }

    /// Only an open connection accepts data frames.
    #[must_use]
    #[inline]
    pub const fn can_send(self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        })
    }
}

/// Atomic cell holding a [`ConnectionState`] that never moves backwards.
#[derive(Debug, Default)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `state` unless already past it. Returns the previous state.
    pub(crate) fn advance(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.fetch_max(state as u8, Ordering::AcqRel))
    }

    /// Move from `from` to `to`; fails if the state is no longer `from`.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        debug_assert!(from < to);
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
