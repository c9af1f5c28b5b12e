//! Header validation for incoming frames (RFC 6455 Sections 5.1 and 5.2).
//!
//! Checks run as soon as a frame header is complete, before any payload is
//! buffered:
//! - masking matches the local role
//! - reserved bits are claimed by a negotiated extension
//! - control frame constraints
//! - the payload fits the size limit

use crate::error::{Error, Result};
use crate::extensions::RsvBits;
use crate::protocol::frame::{FrameHeader, MAX_CONTROL_FRAME_PAYLOAD};

/// Frame header validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameValidator {
    mask_expected: bool,
    max_size: Option<usize>,
    extension_bits: RsvBits,
}

impl FrameValidator {
    /// Validator for a peer whose frames must (`true`, server side) or must
    /// not (`false`, client side) be masked.
    #[must_use]
    pub const fn new(mask_expected: bool) -> Self {
        Self {
            mask_expected,
            max_size: None,
            extension_bits: RsvBits::NONE,
        }
    }

    /// Reject payloads longer than `max_size`.
    #[must_use]
    pub const fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_size = max_size;
        self
    }

    /// Reserved bits claimed by negotiated extensions.
    #[must_use]
    pub const fn with_extension_bits(mut self, bits: RsvBits) -> Self {
        self.extension_bits = bits;
        self
    }

    pub(crate) fn validate_header(&self, header: &FrameHeader) -> Result<()> {
        self.validate_masking(header.mask.is_some())?;
        self.validate_rsv_bits(header.rsv)?;
        if header.opcode.is_control() {
            if !header.fin {
                return Err(Error::protocol("fragmented control frame"));
            }
            if header.payload_len > MAX_CONTROL_FRAME_PAYLOAD {
                return Err(Error::protocol("control frame too long"));
            }
        }
        self.validate_size(header.payload_len)
    }

    /// Servers require masked frames, clients require unmasked ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on mismatch.
    pub fn validate_masking(&self, masked: bool) -> Result<()> {
        if masked != self.mask_expected {
            return Err(Error::protocol("incorrect masking"));
        }
        Ok(())
    }

    /// Reserved bits must be claimed by a negotiated extension.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if an unclaimed bit is set.
    pub fn validate_rsv_bits(&self, rsv: RsvBits) -> Result<()> {
        if rsv.without(self.extension_bits).any() {
            return Err(Error::protocol("reserved bits must be 0"));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::PayloadTooBig`] if `payload_len` exceeds the limit.
    pub fn validate_size(&self, payload_len: usize) -> Result<()> {
        match self.max_size {
            Some(max) if payload_len > max => Err(Error::PayloadTooBig {
                size: payload_len,
                max,
            }),
            _ => Ok(()),
        }
    }
}
