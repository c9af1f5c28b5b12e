//! Reassembly of fragmented messages (RFC 6455 Section 5.4).

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::utf8::Utf8Validator;
use crate::protocol::{Frame, OpCode};

/// Reassembles data frames into complete messages.
///
/// The running size of the message is checked against `max_size` after each
/// fragment, and text is validated incrementally so that a bad message is
/// rejected without waiting for its final fragment.
#[derive(Debug)]
pub struct MessageAssembler {
    buffer: BytesMut,
    opcode: Option<OpCode>,
    utf8: Utf8Validator,
    max_size: Option<usize>,
}

impl MessageAssembler {
    /// Create an assembler enforcing `max_size` on whole messages.
    #[must_use]
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            buffer: BytesMut::new(),
            opcode: None,
            utf8: Utf8Validator::new(),
            max_size,
        }
    }

    /// Add a data frame. Returns the message once its final fragment arrives.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] for a continuation without a message in
    ///   progress, or a new message started before the previous one ended
    /// - [`Error::PayloadTooBig`] when the running size exceeds `max_size`
    /// - [`Error::InvalidUtf8`] for a text message that is not UTF-8
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        match (frame.opcode, self.opcode) {
            (OpCode::Continuation, None) => {
                return Err(Error::protocol("unexpected continuation frame"));
            }
            (OpCode::Continuation, Some(_)) => {}
            (OpCode::Text | OpCode::Binary, None) => {
                self.opcode = Some(frame.opcode);
                self.utf8.reset();
            }
            (OpCode::Text | OpCode::Binary, Some(_)) => {
                return Err(Error::protocol(format!(
                    "unexpected opcode {} in fragmented message",
                    frame.opcode
                )));
            }
            (op, _) => {
                return Err(Error::protocol(format!("{op} is not a data frame")));
            }
        }

        let size = self.buffer.len() + frame.payload.len();
        if let Some(max) = self.max_size {
            if size > max {
                return Err(Error::PayloadTooBig { size, max });
            }
        }

        if self.opcode == Some(OpCode::Text) {
            self.utf8.feed(&frame.payload, frame.fin)?;
        }

        if frame.fin && self.buffer.is_empty() {
            // Unfragmented message: hand the payload over without copying.
            let opcode = self.opcode.take();
            return Self::finish(opcode, frame.payload).map(Some);
        }

        self.buffer.extend_from_slice(&frame.payload);
        if !frame.fin {
            return Ok(None);
        }

        let payload = self.buffer.split().to_vec();
        Self::finish(self.opcode.take(), payload).map(Some)
    }

    fn finish(opcode: Option<OpCode>, payload: Vec<u8>) -> Result<Message> {
        match opcode {
            Some(OpCode::Text) => Ok(Message::Text(String::from_utf8(payload)?)),
            _ => Ok(Message::Binary(payload)),
        }
    }

    /// Bytes buffered for the message in progress.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a fragmented message is in progress.
    #[must_use]
    pub fn is_assembling(&self) -> bool {
        self.opcode.is_some()
    }

    /// Drop the message in progress.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.opcode = None;
        self.utf8.reset();
    }
}
