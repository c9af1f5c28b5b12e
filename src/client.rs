//! Client side of the opening handshake.
//!
//! [`connect`] opens a TCP connection to a `ws://` URI and runs the
//! handshake. [`client_handshake`] runs it over any [`Transport`], e.g. a TLS
//! stream set up by the caller.

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use url::Url;

use crate::codec::read_http_head;
use crate::config::Config;
use crate::connection::{Connection, Negotiated, Role, Transport};
use crate::error::{Error, Result};
use crate::extensions::{ExtensionOffer, negotiate_client, offer_header};
use crate::protocol::{HandshakeRequest, HandshakeResponse, generate_key};

/// Where a parsed `ws://` URI points.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    /// Value of the Host header; carries the port unless it is the default.
    authority: String,
    /// Path and query.
    resource: String,
}

fn parse_uri(uri: &str) -> Result<Target> {
    let url = Url::parse(uri).map_err(|e| Error::InvalidUri(format!("{uri}: {e}")))?;
    match url.scheme() {
        "ws" => {}
        "wss" => {
            return Err(Error::InvalidUri(format!(
                "{uri}: wss requires a TLS transport, use client_handshake"
            )));
        }
        scheme => return Err(Error::InvalidUri(format!("{uri}: unsupported scheme {scheme}"))),
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(Error::InvalidUri(format!("{uri}: user info is not supported")));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::InvalidUri(format!("{uri}: missing host")))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let resource = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    };

    Ok(Target {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port,
        authority,
        resource,
    })
}

/// Connect to a `ws://` URI and perform the opening handshake.
///
/// # Errors
///
/// - [`Error::InvalidUri`] for a malformed or `wss://` URI, or one with user info
/// - [`Error::Io`] if the TCP connection fails
/// - any error from [`client_handshake`]
pub async fn connect(uri: &str, config: &Config) -> Result<Connection<TcpStream>> {
    let target = parse_uri(uri)?;
    debug!(host = %target.host, port = target.port, "connecting");
    let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
    stream.set_nodelay(true)?;
    client_handshake(stream, &target.authority, &target.resource, config).await
}

/// Perform the client side of the opening handshake over `io`.
///
/// `host` is sent as the Host header and `resource` as the request target.
/// On failure the transport is shut down and no connection is created.
///
/// # Errors
///
/// Returns [`Error::InvalidHandshake`] if the server rejects the upgrade or
/// answers with an invalid response, [`Error::Extension`] for unacceptable
/// extension parameters and [`Error::Io`] on transport errors.
pub async fn client_handshake<T: Transport>(
    mut io: T,
    host: &str,
    resource: &str,
    config: &Config,
) -> Result<Connection<T>> {
    match handshake(&mut io, host, resource, config).await {
        Ok(negotiated) => Ok(Connection::open(io, Role::Client, config, negotiated)),
        Err(err) => {
            warn!(error = %err, "opening handshake failed");
            let _ = io.shutdown().await;
            Err(err)
        }
    }
}

async fn handshake<T: Transport>(
    io: &mut T,
    host: &str,
    resource: &str,
    config: &Config,
) -> Result<Negotiated> {
    let key = generate_key()?;
    let mut request = HandshakeRequest::new(host, resource, &key);
    if let Some(origin) = &config.origin {
        request.headers.append("Origin", origin);
    }
    if let Some(extensions) = offer_header(&config.extensions) {
        request.headers.append("Sec-WebSocket-Extensions", extensions);
    }
    if !config.subprotocols.is_empty() {
        request
            .headers
            .append("Sec-WebSocket-Protocol", config.subprotocols.join(", "));
    }
    for (name, value) in &config.extra_headers {
        request.headers.append(name, value);
    }
    if let Some(agent) = &config.agent {
        if !request.headers.contains("User-Agent") {
            request.headers.append("User-Agent", agent);
        }
    }

    let mut out = Vec::new();
    request.write(&mut out)?;
    io.write_all(&out).await?;
    io.flush().await?;
    debug!(resource, "sent handshake request");

    let mut buf = BytesMut::new();
    let head = read_http_head(io, &mut buf, config.max_handshake_size).await?;
    let response = HandshakeResponse::parse(&head)?;
    response.validate(&key)?;

    let offers = ExtensionOffer::parse_headers(response.headers.get_all("Sec-WebSocket-Extensions"))?;
    let extensions = negotiate_client(&config.extensions, &offers)?;
    let subprotocol = accepted_subprotocol(&response, &config.subprotocols)?;
    debug!(status = response.status, ?subprotocol, "handshake complete");

    Ok(Negotiated {
        subprotocol,
        extensions,
        path: request.path,
        request_headers: request.headers,
        response_headers: response.headers,
        buffered: buf,
    })
}

fn accepted_subprotocol(response: &HandshakeResponse, offered: &[String]) -> Result<Option<String>> {
    let mut protocols = response.headers.tokens("Sec-WebSocket-Protocol");
    let Some(protocol) = protocols.next() else {
        return Ok(None);
    };
    if protocols.next().is_some() {
        return Err(Error::handshake("server selected multiple subprotocols"));
    }
    if !offered.iter().any(|p| p == protocol) {
        return Err(Error::handshake(format!(
            "server selected a subprotocol that was not offered: {protocol}"
        )));
    }
    Ok(Some(protocol.to_string()))
}
