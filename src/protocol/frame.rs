//! WebSocket frame encoding and decoding (RFC 6455 Section 5.2).

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::extensions::{ExtensionPipeline, RsvBits};
use crate::protocol::OpCode;
use crate::protocol::mask::{apply_mask_fast, generate_mask};
use crate::protocol::validation::FrameValidator;

/// Maximum payload size for control frames (RFC 6455).
pub const MAX_CONTROL_FRAME_PAYLOAD: usize = 125;

/// Decoded fixed part of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub fin: bool,
    pub rsv: RsvBits,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: usize,
    pub header_len: usize,
}

/// Parse a frame header from the front of `buf`.
///
/// Returns `Ok(None)` until enough bytes are buffered to know the full header.
fn parse_header(buf: &[u8]) -> Result<Option<FrameHeader>> {
    let [byte0, byte1, rest @ ..] = buf else {
        return Ok(None);
    };

    let fin = byte0 & 0x80 != 0;
    let rsv = RsvBits {
        rsv1: byte0 & 0x40 != 0,
        rsv2: byte0 & 0x20 != 0,
        rsv3: byte0 & 0x10 != 0,
    };
    let opcode = OpCode::from_u8(byte0 & 0x0F)?;
    let masked = byte1 & 0x80 != 0;

    let (payload_len, rest, len_size) = match byte1 & 0x7F {
        126 => {
            let [a, b, rest @ ..] = rest else {
                return Ok(None);
            };
            (u64::from(u16::from_be_bytes([*a, *b])), rest, 2)
        }
        127 => {
            if rest.len() < 8 {
                return Ok(None);
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&rest[..8]);
            (u64::from_be_bytes(len), &rest[8..], 8)
        }
        n => (u64::from(n), rest, 0),
    };

    let payload_len = usize::try_from(payload_len)
        .map_err(|_| Error::protocol(format!("frame length {payload_len} exceeds platform limits")))?;

    let mask = if masked {
        let [a, b, c, d, ..] = rest else {
            return Ok(None);
        };
        Some([*a, *b, *c, *d])
    } else {
        None
    };

    let mask_size = if masked { 4 } else { 0 };
    Ok(Some(FrameHeader {
        fin,
        rsv,
        opcode,
        mask,
        payload_len,
        header_len: 2 + len_size + mask_size,
    }))
}

/// A WebSocket frame as defined in RFC 6455.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// | |1|2|3|       |K|             |                               |
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |                 Masking key (if MASK is set)                  |
/// +---------------------------------------------------------------+
/// |                         Payload data                          |
/// +---------------------------------------------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bit 1. Only set by a negotiated extension.
    pub rsv1: bool,
    /// Reserved bit 2. Only set by a negotiated extension.
    pub rsv2: bool,
    /// Reserved bit 3. Only set by a negotiated extension.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Unmasked payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame with all reserved bits cleared.
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload,
        }
    }

    /// Create a final text frame.
    #[must_use]
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Text, data.into())
    }

    /// Create a final binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Binary, data.into())
    }

    /// Create a close frame from an already serialized close payload.
    #[must_use]
    pub fn close(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Close, payload.into())
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Ping, data.into())
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self::new(true, OpCode::Pong, data.into())
    }

    /// Payload bytes.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Reserved bits carried by this frame.
    #[must_use]
    pub const fn rsv(&self) -> RsvBits {
        RsvBits {
            rsv1: self.rsv1,
            rsv2: self.rsv2,
            rsv3: self.rsv3,
        }
    }

    /// Check the invariants every frame must satisfy once extensions have
    /// been removed: no reserved bits, and control frames are final and
    /// at most 125 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] describing the violated rule.
    pub fn check(&self) -> Result<()> {
        if self.rsv().any() {
            return Err(Error::protocol("reserved bits must be 0"));
        }
        if self.opcode.is_control() {
            if !self.fin {
                return Err(Error::protocol("fragmented control frame"));
            }
            if self.payload.len() > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::protocol("control frame too long"));
            }
        }
        Ok(())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete frame, or
    /// the frame together with the number of bytes it occupied. The header
    /// is validated as soon as it is complete, so an oversized or
    /// incorrectly masked frame is rejected before its payload arrives.
    /// Extensions are applied in reverse negotiated order before the frame
    /// invariants are checked.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] for masking, opcode, reserved bit or control frame violations
    /// - [`Error::PayloadTooBig`] if the payload exceeds `max_size`
    /// - any error raised by an extension's decode step
    pub fn decode(
        buf: &[u8],
        mask_expected: bool,
        max_size: Option<usize>,
        extensions: &mut ExtensionPipeline,
    ) -> Result<Option<(Self, usize)>> {
        let Some(header) = parse_header(buf)? else {
            return Ok(None);
        };

        FrameValidator::new(mask_expected)
            .with_max_size(max_size)
            .with_extension_bits(extensions.rsv_bits())
            .validate_header(&header)?;

        let total = header
            .header_len
            .checked_add(header.payload_len)
            .ok_or_else(|| Error::protocol("frame length overflow"))?;
        if buf.len() < total {
            return Ok(None);
        }

        let mut payload = buf[header.header_len..total].to_vec();
        if let Some(key) = header.mask {
            apply_mask_fast(&mut payload, key);
        }

        let frame = Frame {
            fin: header.fin,
            rsv1: header.rsv.rsv1,
            rsv2: header.rsv.rsv2,
            rsv3: header.rsv.rsv3,
            opcode: header.opcode,
            payload,
        };
        let frame = extensions.decode(frame, max_size)?;
        frame.check()?;

        Ok(Some((frame, total)))
    }

    /// Encode this frame into `dst`, applying extensions in negotiated order
    /// and masking with a fresh random key when `mask` is set.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if the frame violates the frame invariants
    /// - any error raised by an extension's encode step
    pub fn encode(
        self,
        dst: &mut BytesMut,
        mask: bool,
        extensions: &mut ExtensionPipeline,
    ) -> Result<()> {
        let key = if mask { Some(generate_mask()?) } else { None };
        self.encode_with_key(dst, key, extensions)
    }

    /// Same as [`Frame::encode`] with an explicit masking key.
    ///
    /// # Errors
    ///
    /// See [`Frame::encode`].
    pub fn encode_with_key(
        self,
        dst: &mut BytesMut,
        key: Option<[u8; 4]>,
        extensions: &mut ExtensionPipeline,
    ) -> Result<()> {
        self.check()?;
        let frame = extensions.encode(self)?;
        frame.write(dst, key);
        Ok(())
    }

    /// Serialize the frame as-is, without validation or extensions.
    pub fn write(&self, dst: &mut BytesMut, key: Option<[u8; 4]>) {
        let len = self.payload.len();
        dst.reserve(self.wire_size(key.is_some()));

        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        if self.rsv1 {
            byte0 |= 0x40;
        }
        if self.rsv2 {
            byte0 |= 0x20;
        }
        if self.rsv3 {
            byte0 |= 0x10;
        }
        dst.put_u8(byte0);

        let mask_bit = if key.is_some() { 0x80 } else { 0 };
        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len < 65536 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match key {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&self.payload);
                apply_mask_fast(&mut dst[start..], key);
            }
            None => dst.put_slice(&self.payload),
        }
    }

    /// Number of bytes [`Frame::write`] produces.
    #[must_use]
    pub fn wire_size(&self, masked: bool) -> usize {
        let len = self.payload.len();
        let extended = if len < 126 {
            0
        } else if len < 65536 {
            2
        } else {
            8
        };
        let mask_size = if masked { 4 } else { 0 };
        2 + extended + mask_size + len
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} [{} bytes]",
            self.opcode,
            if self.fin { "" } else { " (fragment)" },
            self.payload.len()
        )
    }
}
