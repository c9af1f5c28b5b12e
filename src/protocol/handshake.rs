//! Opening handshake (RFC 6455 Section 4).
//!
//! Builds, parses and validates the HTTP Upgrade request and response.
//! Extension negotiation lives in [`crate::extensions`]; this module only
//! carries the raw header values.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// The WebSocket GUID used in the Sec-WebSocket-Accept calculation (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers that may appear at most once in a handshake request.
const SINGLETON_HEADERS: [&str; 4] = [
    "host",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
];

/// Computes the Sec-WebSocket-Accept value from the client's Sec-WebSocket-Key.
///
/// # Example
///
/// ```
/// use wsconn::protocol::handshake::compute_accept_key;
///
/// let key = "dGhlIHNhbXBsZSBub25jZQ==";
/// assert_eq!(compute_accept_key(key), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Generate a Sec-WebSocket-Key: 16 random bytes, base64-encoded.
///
/// # Errors
///
/// Returns [`Error::Io`] if the system random source is unavailable.
pub fn generate_key() -> Result<String> {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).map_err(|e| Error::Io(format!("random source: {e}")))?;
    Ok(BASE64.encode(nonce))
}

/// Split a comma-separated header value into trimmed, non-empty tokens.
pub fn split_header_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Default subprotocol selection: among protocols both sides support, pick
/// the one with the lowest sum of positions in the two preference lists.
/// Ties go to the client's preference.
#[must_use]
pub fn select_subprotocol(client: &[String], server: &[String]) -> Option<String> {
    client
        .iter()
        .enumerate()
        .filter_map(|(ci, p)| server.iter().position(|s| s == p).map(|si| (ci + si, ci, p)))
        .min_by_key(|&(sum, ci, _)| (sum, ci))
        .map(|(_, _, p)| p.clone())
}

/// Check the Origin header against the allowed list.
///
/// An empty string in `allowed` admits requests without an Origin header.
///
/// # Errors
///
/// Returns [`Error::InvalidOrigin`] if the origin is not listed.
pub fn validate_origin(origin: Option<&str>, allowed: &[String]) -> Result<()> {
    let origin_or_empty = origin.unwrap_or("");
    if allowed.iter().any(|a| a == origin_or_empty) {
        Ok(())
    } else {
        Err(Error::InvalidOrigin(
            origin.unwrap_or("(none)").to_string(),
        ))
    }
}

/// Reject header values that could smuggle additional headers.
fn validate_header_value(name: &str, value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) || name.contains(['\r', '\n', ':']) {
        return Err(Error::handshake(format!(
            "header {name:?} contains CR, LF or a misplaced colon"
        )));
    }
    Ok(())
}

/// HTTP header list with case-insensitive lookup.
///
/// Keeps every field in arrival order, including repeated names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    /// All values for `name`, in arrival order.
    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a field named `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Comma-separated tokens across every field named `name`.
    pub fn tokens<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.get_all(name).flat_map(split_header_list)
    }

    /// Value of a field that must appear exactly once.
    fn single(&self, name: &str) -> Result<&str> {
        let mut values = self.get_all(name);
        match (values.next(), values.next()) {
            (Some(value), None) => Ok(value),
            (None, _) => Err(Error::handshake(format!("missing {name} header"))),
            (Some(_), Some(_)) => Err(Error::handshake(format!("duplicate {name} header"))),
        }
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn parse<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Self> {
        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::handshake(format!("invalid header line: {line:?}")))?;
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(Error::handshake(format!("invalid header name: {name:?}")));
            }
            headers.append(name, value.trim());
        }
        Ok(headers)
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        for (name, value) in &self.fields {
            validate_header_value(name, value)?;
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Ok(())
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

fn check_upgrade_headers(headers: &Headers) -> Result<()> {
    if !headers
        .tokens("Connection")
        .any(|t| t.eq_ignore_ascii_case("upgrade"))
    {
        return Err(Error::handshake(format!(
            "invalid Connection header: {}",
            headers.get("Connection").unwrap_or("(missing)")
        )));
    }
    let mut upgrade = headers.tokens("Upgrade");
    match (upgrade.next(), upgrade.next()) {
        (Some(token), None) if token.eq_ignore_ascii_case("websocket") => Ok(()),
        _ => Err(Error::handshake(format!(
            "invalid Upgrade header: {}",
            headers.get("Upgrade").unwrap_or("(missing)")
        ))),
    }
}

fn split_head(data: &[u8]) -> Result<std::str::Split<'_, &'static str>> {
    let text = std::str::from_utf8(data).map_err(|_| Error::handshake("invalid UTF-8 in HTTP head"))?;
    Ok(text.split("\r\n"))
}

/// Opening handshake request (client to server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Request target, e.g. `/chat?room=1`.
    pub path: String,
    /// Request headers.
    pub headers: Headers,
}

impl HandshakeRequest {
    /// Build a client request carrying the mandatory upgrade headers.
    #[must_use]
    pub fn new(host: &str, path: &str, key: &str) -> Self {
        let headers = [
            ("Host", host),
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Key", key),
            ("Sec-WebSocket-Version", "13"),
        ]
        .into_iter()
        .collect();
        Self {
            path: path.to_string(),
            headers,
        }
    }

    /// Parse a request head (request line and headers).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the head is not a well-formed
    /// `GET` request over HTTP/1.1.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut lines = split_head(data)?;
        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::handshake("empty request"))?;

        let mut parts = request_line.split(' ');
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::handshake(format!("invalid request line: {request_line}")));
        };
        if method != "GET" {
            return Err(Error::handshake(format!("expected GET method, got {method}")));
        }
        if version != "HTTP/1.1" {
            return Err(Error::handshake(format!("expected HTTP/1.1, got {version}")));
        }

        Ok(Self {
            path: path.to_string(),
            headers: Headers::parse(lines)?,
        })
    }

    /// Server-side validation. Returns the client's key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the upgrade headers are wrong,
    /// a singleton header is repeated, the key does not decode to 16 bytes,
    /// or the version is not 13.
    pub fn validate(&self) -> Result<&str> {
        for name in SINGLETON_HEADERS {
            if self.headers.get_all(name).nth(1).is_some() {
                return Err(Error::handshake(format!("duplicate {name} header")));
            }
        }
        check_upgrade_headers(&self.headers)?;

        let key = self.headers.single("Sec-WebSocket-Key")?;
        match BASE64.decode(key) {
            Ok(raw) if raw.len() == 16 => {}
            Ok(raw) => {
                return Err(Error::handshake(format!(
                    "Sec-WebSocket-Key must decode to 16 bytes, got {}",
                    raw.len()
                )));
            }
            Err(_) => return Err(Error::handshake("Sec-WebSocket-Key is not valid base64")),
        }

        let version = self.headers.single("Sec-WebSocket-Version")?;
        if version != "13" {
            return Err(Error::handshake(format!(
                "unsupported WebSocket version: {version}"
            )));
        }

        if self.headers.get("Host").is_none_or(str::is_empty) {
            return Err(Error::handshake("missing Host header"));
        }

        Ok(key)
    }

    /// The Origin header, if any.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.headers.get("Origin")
    }

    /// Subprotocols offered by the client, in preference order.
    #[must_use]
    pub fn protocols(&self) -> Vec<String> {
        self.headers
            .tokens("Sec-WebSocket-Protocol")
            .map(str::to_string)
            .collect()
    }

    /// Serialize the request head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if a header contains CR or LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        validate_header_value("request target", &self.path)?;
        if self.path.contains(' ') {
            return Err(Error::handshake("request target contains a space"));
        }
        buf.extend_from_slice(b"GET ");
        buf.extend_from_slice(self.path.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");
        self.headers.write(buf)?;
        buf.extend_from_slice(b"\r\n");
        Ok(())
    }
}

/// Opening handshake response (server to client), or a plain HTTP response
/// rejecting the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// HTTP status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Response headers.
    pub headers: Headers,
    /// Body, only used for non-101 responses.
    pub body: Vec<u8>,
}

impl HandshakeResponse {
    /// `101 Switching Protocols` answering a request carrying `key`.
    #[must_use]
    pub fn switching_protocols(key: &str) -> Self {
        let accept = compute_accept_key(key);
        let headers = [
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Accept", accept.as_str()),
        ]
        .into_iter()
        .collect();
        Self {
            status: 101,
            reason: "Switching Protocols".to_string(),
            headers,
            body: Vec::new(),
        }
    }

    /// Plain HTTP response with a text body.
    #[must_use]
    pub fn http(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        let headers = [
            ("Content-Type", "text/plain".to_string()),
            ("Content-Length", body.len().to_string()),
            ("Connection", "close".to_string()),
        ]
        .into_iter()
        .collect();
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers,
            body,
        }
    }

    /// Parse a response head (status line and headers).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if the status line or headers are malformed.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut lines = split_head(data)?;
        let status_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::handshake("empty response"))?;

        let mut parts = status_line.splitn(3, ' ');
        let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
            return Err(Error::handshake(format!("invalid status line: {status_line}")));
        };
        if version != "HTTP/1.1" {
            return Err(Error::handshake(format!("expected HTTP/1.1, got {version}")));
        }
        let status: u16 = status
            .parse()
            .ok()
            .filter(|s| (100..1000).contains(s))
            .ok_or_else(|| Error::handshake(format!("invalid status code: {status}")))?;

        Ok(Self {
            status,
            reason: parts.next().unwrap_or("").to_string(),
            headers: Headers::parse(lines)?,
            body: Vec::new(),
        })
    }

    /// Client-side validation against the key that was sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] unless the status is 101, the
    /// upgrade headers are present and the accept value matches `key`.
    pub fn validate(&self, key: &str) -> Result<()> {
        if self.status != 101 {
            return Err(Error::handshake(format!(
                "status code not 101: {}",
                self.status
            )));
        }
        check_upgrade_headers(&self.headers)?;
        let accept = self.headers.single("Sec-WebSocket-Accept")?;
        if accept != compute_accept_key(key) {
            return Err(Error::handshake(format!(
                "invalid Sec-WebSocket-Accept: {accept}"
            )));
        }
        Ok(())
    }

    /// Serialize the response head and body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] if a header contains CR or LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        validate_header_value("reason", &self.reason)?;
        buf.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        self.headers.write(buf)?;
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);
        Ok(())
    }
}

impl fmt::Display for HandshakeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.reason)
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}
