//! Server side of the opening handshake.
//!
//! The embedder owns the listener and hands each accepted transport to
//! [`accept`] or [`accept_with`]:
//!
//! ```rust,no_run
//! use tokio::net::TcpListener;
//! use wsconn::Config;
//!
//! # async fn run() -> wsconn::Result<()> {
//! let listener = TcpListener::bind("127.0.0.1:9001").await?;
//! let (stream, _) = listener.accept().await?;
//! let conn = wsconn::server::accept(stream, &Config::server()).await?;
//! # Ok(())
//! # }
//! ```

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::codec::read_http_head;
use crate::config::Config;
use crate::connection::{Connection, Negotiated, Role, Transport};
use crate::error::{Error, Result};
use crate::extensions::{ExtensionOffer, format_header, negotiate_server};
use crate::protocol::{HandshakeRequest, HandshakeResponse, select_subprotocol, validate_origin};

enum Outcome {
    Upgrade(HandshakeResponse, Negotiated),
    /// The request hook answered with a plain HTTP response.
    Respond(HandshakeResponse),
}

/// Perform the server side of the opening handshake over `io`.
///
/// # Errors
///
/// See [`accept_with`].
pub async fn accept<T: Transport>(io: T, config: &Config) -> Result<Connection<T>> {
    accept_with(io, config, |_| None).await
}

/// Perform the server side of the opening handshake, letting
/// `process_request` inspect the validated request first.
///
/// If the hook returns a response, it is written as-is, the transport is
/// closed and [`Error::HandshakeAborted`] is returned. This serves health
/// checks or authentication failures on the WebSocket endpoint.
///
/// On any other failure a best-effort HTTP error response is written
/// (400 for an invalid request, 403 for a rejected origin, 500 otherwise)
/// and the transport is closed.
///
/// # Errors
///
/// - [`Error::InvalidHandshake`] for a malformed upgrade request
/// - [`Error::InvalidOrigin`] if the Origin header is not allowed
/// - [`Error::HandshakeAborted`] if the hook answered the request
/// - [`Error::Io`] on transport errors
pub async fn accept_with<T, F>(mut io: T, config: &Config, process_request: F) -> Result<Connection<T>>
where
    T: Transport,
    F: FnOnce(&HandshakeRequest) -> Option<HandshakeResponse>,
{
    let mut buf = BytesMut::new();
    let result = handshake(&mut io, &mut buf, config, process_request).await;

    let (response, err) = match result {
        Ok(Outcome::Upgrade(response, mut negotiated)) => {
            match write_response(&mut io, &response).await {
                Ok(()) => {
                    debug!(path = %negotiated.path, subprotocol = ?negotiated.subprotocol, "handshake complete");
                    negotiated.buffered = buf;
                    return Ok(Connection::open(io, Role::Server, config, negotiated));
                }
                Err(err) => (None, err),
            }
        }
        Ok(Outcome::Respond(response)) => {
            debug!(status = response.status, "request answered without upgrading");
            let status = response.status;
            (Some(response), Error::HandshakeAborted { status })
        }
        Err(err) => {
            warn!(error = %err, "opening handshake failed");
            let response = match err {
                Error::Io(_) => None,
                _ => Some(error_response(&err, config)),
            };
            (response, err)
        }
    };

    if let Some(response) = response {
        let _ = write_response(&mut io, &response).await;
    }
    let _ = io.shutdown().await;
    Err(err)
}

async fn handshake<T, F>(
    io: &mut T,
    buf: &mut BytesMut,
    config: &Config,
    process_request: F,
) -> Result<Outcome>
where
    T: Transport,
    F: FnOnce(&HandshakeRequest) -> Option<HandshakeResponse>,
{
    let head = read_http_head(io, buf, config.max_handshake_size).await?;
    let request = HandshakeRequest::parse(&head)?;
    let key = request.validate()?.to_string();
    debug!(path = %request.path, "received handshake request");

    if let Some(response) = process_request(&request) {
        return Ok(Outcome::Respond(response));
    }
    if let Some(allowed) = &config.allowed_origins {
        validate_origin(request.origin(), allowed)?;
    }

    let offers = ExtensionOffer::parse_headers(request.headers.get_all("Sec-WebSocket-Extensions"))
        .map_err(|err| Error::handshake(err.to_string()))?;
    let (accepted, extensions) = negotiate_server(&config.extensions, &offers);

    let offered = request.protocols();
    let subprotocol = if offered.is_empty() || config.subprotocols.is_empty() {
        None
    } else {
        let select = config.select_subprotocol.unwrap_or(select_subprotocol);
        select(&offered, &config.subprotocols)
    };

    let mut response = HandshakeResponse::switching_protocols(&key);
    if !accepted.is_empty() {
        response
            .headers
            .append("Sec-WebSocket-Extensions", format_header(&accepted));
    }
    if let Some(protocol) = &subprotocol {
        response.headers.append("Sec-WebSocket-Protocol", protocol);
    }
    decorate(&mut response, config);

    Ok(Outcome::Upgrade(
        response.clone(),
        Negotiated {
            subprotocol,
            extensions,
            path: request.path,
            request_headers: request.headers,
            response_headers: response.headers,
            buffered: BytesMut::new(),
        },
    ))
}

/// HTTP response rejecting a failed upgrade.
fn error_response(err: &Error, config: &Config) -> HandshakeResponse {
    let status = match err {
        Error::InvalidHandshake(_) => 400,
        Error::InvalidOrigin(_) => 403,
        _ => 500,
    };
    let body = match status {
        400 => format!("Failed to open a WebSocket connection: {err}.\n"),
        403 => "Forbidden.\n".to_string(),
        _ => "Failed to open a WebSocket connection.\n".to_string(),
    };
    let mut response = HandshakeResponse::http(status, body);
    decorate(&mut response, config);
    response
}

/// Add the configured extra headers and the `Server` header.
fn decorate(response: &mut HandshakeResponse, config: &Config) {
    for (name, value) in &config.extra_headers {
        response.headers.append(name, value);
    }
    if let Some(agent) = &config.agent {
        if !response.headers.contains("Server") {
            response.headers.append("Server", agent);
        }
    }
}

async fn write_response<T: Transport>(io: &mut T, response: &HandshakeResponse) -> Result<()> {
    let mut out = Vec::new();
    response.write(&mut out)?;
    io.write_all(&out).await?;
    io.flush().await?;
    Ok(())
}
