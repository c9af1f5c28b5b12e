//! permessage-deflate (RFC 7692).
//!
//! Messages are compressed frame by frame on a streaming raw deflate
//! context. Each frame ends with a sync flush; the final frame of a message
//! drops the `00 00 ff ff` tail, which the receiver appends back before
//! inflating. RSV1 marks the first frame of a compressed message.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};
use crate::extensions::{ExtensionOffer, ExtensionParam, FrameTransform, RsvBits};
use crate::protocol::{Frame, OpCode};

/// Registered extension name.
pub const EXTENSION_NAME: &str = "permessage-deflate";

const MIN_WINDOW_BITS: u8 = 8;
const MAX_WINDOW_BITS: u8 = 15;
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";

fn check_window_bits(name: &str, bits: u8) -> Result<u8> {
    if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        Ok(bits)
    } else {
        Err(Error::Extension(format!(
            "{name} must be {MIN_WINDOW_BITS}-{MAX_WINDOW_BITS}, got {bits}"
        )))
    }
}

/// Local permessage-deflate preferences.
///
/// On a client these become the offer; on a server they constrain what is
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Ask the server (or, as a server, insist) to reset its context after each message.
    pub server_no_context_takeover: bool,
    /// Ask the client to reset its context after each message.
    pub client_no_context_takeover: bool,
    /// Upper bound for the server's LZ77 window.
    pub server_max_window_bits: Option<u8>,
    /// Upper bound for the client's LZ77 window.
    pub client_max_window_bits: Option<u8>,
    /// zlib compression level, 0-9.
    pub compression_level: u32,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: None,
            client_max_window_bits: None,
            compression_level: 6,
        }
    }
}

impl DeflateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_no_context_takeover(mut self, value: bool) -> Self {
        self.server_no_context_takeover = value;
        self
    }

    pub fn client_no_context_takeover(mut self, value: bool) -> Self {
        self.client_no_context_takeover = value;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::Extension`] unless `bits` is within 8-15.
    pub fn server_max_window_bits(mut self, bits: u8) -> Result<Self> {
        self.server_max_window_bits = Some(check_window_bits(SERVER_MAX_WINDOW_BITS, bits)?);
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`Error::Extension`] unless `bits` is within 8-15.
    pub fn client_max_window_bits(mut self, bits: u8) -> Result<Self> {
        self.client_max_window_bits = Some(check_window_bits(CLIENT_MAX_WINDOW_BITS, bits)?);
        Ok(self)
    }

    /// # Errors
    ///
    /// Returns [`Error::Extension`] if `level` is above 9.
    pub fn compression_level(mut self, level: u32) -> Result<Self> {
        if level > 9 {
            return Err(Error::Extension(format!(
                "compression_level must be 0-9, got {level}"
            )));
        }
        self.compression_level = level;
        Ok(self)
    }

    /// The client's offer. `client_max_window_bits` is always sent so the
    /// server may pick a smaller client window.
    pub(crate) fn client_offer(&self) -> ExtensionOffer {
        let params = DeflateParams {
            server_no_context_takeover: self.server_no_context_takeover,
            client_no_context_takeover: self.client_no_context_takeover,
            server_max_window_bits: self.server_max_window_bits,
            client_max_window_bits: Some(self.client_max_window_bits),
        };
        ExtensionOffer::with_params(EXTENSION_NAME, params.to_params())
    }

    /// Client side: check the server's response against our offer.
    pub(crate) fn accept_response(&self, params: &[ExtensionParam]) -> Result<PerMessageDeflate> {
        let response = DeflateParams::parse(params)?;

        if self.server_no_context_takeover && !response.server_no_context_takeover {
            return Err(Error::Extension(format!(
                "expected {SERVER_NO_CONTEXT_TAKEOVER}"
            )));
        }

        if let Some(ours) = self.server_max_window_bits {
            match response.server_max_window_bits {
                None => {
                    return Err(Error::Extension(format!("expected {SERVER_MAX_WINDOW_BITS}")));
                }
                Some(bits) if bits > ours => {
                    return Err(Error::Extension(format!(
                        "unsupported {SERVER_MAX_WINDOW_BITS}={bits}"
                    )));
                }
                Some(_) => {}
            }
        }

        let client_max_window_bits = match response.client_max_window_bits {
            None => None,
            Some(None) => {
                return Err(Error::Extension(format!(
                    "{CLIENT_MAX_WINDOW_BITS} requires a value in a response"
                )));
            }
            Some(Some(bits)) => match self.client_max_window_bits {
                Some(ours) if bits > ours => {
                    return Err(Error::Extension(format!(
                        "unsupported {CLIENT_MAX_WINDOW_BITS}={bits}"
                    )));
                }
                _ => Some(bits),
            },
        };

        Ok(PerMessageDeflate::new(
            self.client_no_context_takeover || response.client_no_context_takeover,
            response.server_no_context_takeover,
            client_max_window_bits,
            self.compression_level,
        ))
    }

    /// Server side: answer a client offer, or decline it with `None`.
    pub(crate) fn accept_offer(
        &self,
        params: &[ExtensionParam],
    ) -> Option<(ExtensionOffer, PerMessageDeflate)> {
        let offer = DeflateParams::parse(params).ok()?;

        let server_max_window_bits = match (self.server_max_window_bits, offer.server_max_window_bits)
        {
            (Some(ours), Some(theirs)) => Some(ours.min(theirs)),
            (ours, theirs) => ours.or(theirs),
        };

        let client_max_window_bits = match (self.client_max_window_bits, offer.client_max_window_bits)
        {
            (None, Some(theirs)) => theirs,
            (None, None) => None,
            // The client did not signal that it can limit its window.
            (Some(_), None) => return None,
            (Some(ours), Some(None)) => Some(ours),
            (Some(ours), Some(Some(theirs))) => Some(ours.min(theirs)),
        };

        let agreed = DeflateParams {
            server_no_context_takeover: self.server_no_context_takeover
                || offer.server_no_context_takeover,
            client_no_context_takeover: self.client_no_context_takeover
                || offer.client_no_context_takeover,
            server_max_window_bits,
            client_max_window_bits: client_max_window_bits.map(Some),
        };

        let extension = PerMessageDeflate::new(
            agreed.server_no_context_takeover,
            agreed.client_no_context_takeover,
            server_max_window_bits,
            self.compression_level,
        );
        Some((
            ExtensionOffer::with_params(EXTENSION_NAME, agreed.to_params()),
            extension,
        ))
    }
}

/// Parameters as they appear in an offer or response.
#[derive(Debug, Default, PartialEq, Eq)]
struct DeflateParams {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: Option<u8>,
    /// `Some(None)` is the bare flag.
    client_max_window_bits: Option<Option<u8>>,
}

impl DeflateParams {
    fn parse(params: &[ExtensionParam]) -> Result<Self> {
        let mut parsed = Self::default();
        let mut seen: Vec<&str> = Vec::with_capacity(params.len());

        for param in params {
            let name = param.name.as_str();
            if seen.contains(&name) {
                return Err(Error::Extension(format!("duplicate parameter {name}")));
            }
            seen.push(name);

            let value = param.value.as_deref();
            match (name, value) {
                (SERVER_NO_CONTEXT_TAKEOVER, None) => parsed.server_no_context_takeover = true,
                (CLIENT_NO_CONTEXT_TAKEOVER, None) => parsed.client_no_context_takeover = true,
                (SERVER_MAX_WINDOW_BITS, Some(v)) => {
                    parsed.server_max_window_bits = Some(parse_window_bits(name, v)?);
                }
                (CLIENT_MAX_WINDOW_BITS, None) => parsed.client_max_window_bits = Some(None),
                (CLIENT_MAX_WINDOW_BITS, Some(v)) => {
                    parsed.client_max_window_bits = Some(Some(parse_window_bits(name, v)?));
                }
                _ => {
                    return Err(Error::Extension(format!("unsupported parameter {param}")));
                }
            }
        }
        Ok(parsed)
    }

    fn to_params(&self) -> Vec<ExtensionParam> {
        let mut params = Vec::new();
        if self.server_no_context_takeover {
            params.push(ExtensionParam::flag(SERVER_NO_CONTEXT_TAKEOVER));
        }
        if self.client_no_context_takeover {
            params.push(ExtensionParam::flag(CLIENT_NO_CONTEXT_TAKEOVER));
        }
        if let Some(bits) = self.server_max_window_bits {
            params.push(ExtensionParam::new(SERVER_MAX_WINDOW_BITS, bits.to_string()));
        }
        match self.client_max_window_bits {
            Some(Some(bits)) => {
                params.push(ExtensionParam::new(CLIENT_MAX_WINDOW_BITS, bits.to_string()));
            }
            Some(None) => params.push(ExtensionParam::flag(CLIENT_MAX_WINDOW_BITS)),
            None => {}
        }
        params
    }
}

fn parse_window_bits(name: &str, value: &str) -> Result<u8> {
    // RFC 7692 forbids leading zeros and signs.
    if value.is_empty() || value.starts_with('0') || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Extension(format!("invalid {name}={value}")));
    }
    let bits = value
        .parse::<u8>()
        .map_err(|_| Error::Extension(format!("invalid {name}={value}")))?;
    check_window_bits(name, bits)
}

/// Negotiated permessage-deflate state for one connection.
#[derive(Debug)]
pub struct PerMessageDeflate {
    local_no_context_takeover: bool,
    remote_no_context_takeover: bool,
    compress: Compress,
    decompress: Decompress,
    decode_cont_data: bool,
}

impl PerMessageDeflate {
    /// `local_*` applies to what we compress, `remote_*` to what the peer
    /// compresses.
    #[must_use]
    pub fn new(
        local_no_context_takeover: bool,
        remote_no_context_takeover: bool,
        local_max_window_bits: Option<u8>,
        compression_level: u32,
    ) -> Self {
        // zlib does not produce raw streams with an 8 bit window.
        let window_bits = local_max_window_bits.unwrap_or(MAX_WINDOW_BITS).max(9);
        Self {
            local_no_context_takeover,
            remote_no_context_takeover,
            compress: Compress::new_with_window_bits(
                Compression::new(compression_level.min(9)),
                false,
                window_bits,
            ),
            decompress: Decompress::new(false),
            decode_cont_data: false,
        }
    }
}

impl FrameTransform for PerMessageDeflate {
    fn rsv_bits(&self) -> RsvBits {
        RsvBits::RSV1
    }

    fn encode(&mut self, mut frame: Frame) -> Result<Frame> {
        if frame.opcode.is_control() {
            return Ok(frame);
        }
        if frame.opcode != OpCode::Continuation {
            frame.rsv1 = true;
        }

        let mut data = deflate_chunk(&mut self.compress, &frame.payload)?;
        if frame.fin {
            if data.ends_with(&DEFLATE_TRAILER) {
                data.truncate(data.len() - DEFLATE_TRAILER.len());
            }
            if self.local_no_context_takeover {
                self.compress.reset();
            }
        }
        frame.payload = data;
        Ok(frame)
    }

    fn decode(&mut self, mut frame: Frame, max_size: Option<usize>) -> Result<Frame> {
        if frame.opcode.is_control() {
            return Ok(frame);
        }
        if frame.opcode == OpCode::Continuation {
            if !self.decode_cont_data {
                return Ok(frame);
            }
            if frame.fin {
                self.decode_cont_data = false;
            }
        } else {
            if !frame.rsv1 {
                return Ok(frame);
            }
            frame.rsv1 = false;
            self.decode_cont_data = !frame.fin;
        }

        if frame.fin {
            frame.payload.extend_from_slice(&DEFLATE_TRAILER);
        }
        frame.payload = inflate_chunk(&mut self.decompress, &frame.payload, max_size)?;
        if frame.fin && self.remote_no_context_takeover {
            self.decompress.reset(false);
        }
        Ok(frame)
    }
}

/// Compress `input` with a sync flush, growing the output until zlib
/// leaves spare room.
fn deflate_chunk(compress: &mut Compress, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut consumed = 0;
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity().max(64));
        }
        let before = compress.total_in();
        let status = compress
            .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
            .map_err(|e| Error::Extension(format!("compression failed: {e}")))?;
        consumed += (compress.total_in() - before) as usize;

        let has_room = out.len() < out.capacity();
        match status {
            Status::StreamEnd => break,
            Status::BufError if has_room => break,
            _ if consumed == input.len() && has_room => break,
            _ => {}
        }
    }
    Ok(out)
}

/// Inflate `input`, failing once the output exceeds `max_size`.
fn inflate_chunk(
    decompress: &mut Decompress,
    input: &[u8],
    max_size: Option<usize>,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity((input.len() * 2).max(64));
    let mut consumed = 0;
    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity());
        }
        let before = decompress.total_in();
        let status = decompress
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|e| Error::protocol(format!("decompression failed: {e}")))?;
        consumed += (decompress.total_in() - before) as usize;

        if let Some(max) = max_size {
            if out.len() > max {
                return Err(Error::PayloadTooBig {
                    size: out.len(),
                    max,
                });
            }
        }

        let has_room = out.len() < out.capacity();
        match status {
            Status::StreamEnd => break,
            Status::BufError if has_room => break,
            _ if consumed == input.len() && has_room => break,
            _ => {}
        }
    }
    Ok(out)
}
