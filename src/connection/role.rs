//! Connection role (client or server).

use std::fmt;

/// Which end of the connection we are.
///
/// Decides masking in both directions and which side waits for the peer to
/// drop the TCP connection during the closing handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Opened the connection; masks outgoing frames.
    Client,
    /// Accepted the connection; never masks.
    Server,
}

impl Role {
    /// Clients must mask every frame they send.
    #[inline]
    #[must_use]
    pub const fn must_mask(self) -> bool {
        matches!(self, Role::Client)
    }

    /// Servers require masked frames from clients.
    #[inline]
    #[must_use]
    pub const fn expects_masked(self) -> bool {
        matches!(self, Role::Server)
    }

    /// The side that opened the transport lets the peer close TCP first
    /// (RFC 6455 Section 7.1.1).
    #[inline]
    #[must_use]
    pub const fn initiated_transport(self) -> bool {
        matches!(self, Role::Client)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
