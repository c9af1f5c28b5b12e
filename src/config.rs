//! Configuration for WebSocket connections and handshakes.

use std::time::Duration;

use crate::extensions::ExtensionFactory;

/// Subprotocol selection policy: `(client_offers, server_supported) -> choice`.
pub type SubprotocolSelector = fn(&[String], &[String]) -> Option<String>;

/// Default `User-Agent` / `Server` identification.
pub const USER_AGENT: &str = concat!("wsconn/", env!("CARGO_PKG_VERSION"));

/// WebSocket connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bound applied to each stage of the closing handshake.
    ///
    /// Default: 10 seconds
    pub timeout: Duration,

    /// Maximum size of an incoming message, after reassembly.
    ///
    /// `None` disables the check. Default: 1 MiB
    pub max_size: Option<usize>,

    /// Capacity of the inbound message queue.
    ///
    /// Default: 32
    pub max_queue: usize,

    /// Read buffer size (in bytes).
    ///
    /// Default: 64 KiB
    pub read_buffer_size: usize,

    /// Write buffer size (in bytes).
    ///
    /// Default: 64 KiB
    pub write_buffer_size: usize,

    /// Maximum size of the HTTP head exchanged during the opening handshake.
    ///
    /// Default: 16 KiB
    pub max_handshake_size: usize,

    /// Supported subprotocols, in order of preference.
    pub subprotocols: Vec<String>,

    /// Available extensions, in order of preference.
    pub extensions: Vec<ExtensionFactory>,

    /// Override for the subprotocol selection policy (server only).
    pub select_subprotocol: Option<SubprotocolSelector>,

    /// Origin header sent by clients.
    pub origin: Option<String>,

    /// Allowed origins for CSWSH protection (server only).
    ///
    /// If `Some`, only requests whose Origin header matches one of these
    /// values are accepted. An empty string entry admits requests without an
    /// Origin header. Default: None
    pub allowed_origins: Option<Vec<String>>,

    /// Additional headers for the handshake request or response.
    pub extra_headers: Vec<(String, String)>,

    /// Value of the `User-Agent` (client) or `Server` (server) header.
    pub agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_size: Some(1 << 20),
            max_queue: 32,
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
            max_handshake_size: 16 * 1024,
            subprotocols: Vec::new(),
            extensions: Vec::new(),
            select_subprotocol: None,
            origin: None,
            allowed_origins: None,
            extra_headers: Vec::new(),
            agent: Some(USER_AGENT.to_string()),
        }
    }
}

impl Config {
    /// Create a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration preset for the client side.
    #[must_use]
    pub fn client() -> Self {
        Self::default()
    }

    /// Configuration preset for the server side.
    #[must_use]
    pub fn server() -> Self {
        Self::default()
    }

    /// Set the per-stage closing handshake timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum incoming message size (`None` for unlimited).
    #[must_use]
    pub const fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the inbound queue capacity. Values below 1 are raised to 1.
    #[must_use]
    pub const fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = if max_queue == 0 { 1 } else { max_queue };
        self
    }

    /// Set read buffer size.
    #[must_use]
    pub const fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set write buffer size.
    #[must_use]
    pub const fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the maximum handshake head size.
    #[must_use]
    pub const fn with_max_handshake_size(mut self, size: usize) -> Self {
        self.max_handshake_size = size;
        self
    }

    /// Set supported subprotocols, most preferred first.
    #[must_use]
    pub fn with_subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the subprotocol selection policy.
    #[must_use]
    pub fn with_subprotocol_selector(mut self, selector: SubprotocolSelector) -> Self {
        self.select_subprotocol = Some(selector);
        self
    }

    /// Add an extension factory at the lowest preference.
    #[must_use]
    pub fn with_extension(mut self, factory: ExtensionFactory) -> Self {
        self.extensions.push(factory);
        self
    }

    /// Offer / accept permessage-deflate with default parameters.
    #[cfg(feature = "compression")]
    #[must_use]
    pub fn with_compression(self) -> Self {
        self.with_extension(ExtensionFactory::PerMessageDeflate(
            crate::extensions::deflate::DeflateConfig::default(),
        ))
    }

    /// Set the Origin header sent by a client.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set allowed origins for CSWSH protection.
    #[must_use]
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Some(origins);
        self
    }

    /// Add a header to the handshake request (client) or response (server).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Set the `User-Agent` / `Server` header value, or `None` to omit it.
    #[must_use]
    pub fn with_agent(mut self, agent: Option<String>) -> Self {
        self.agent = agent;
        self
    }
}
