//! Incremental UTF-8 validation for fragmented text messages.
//!
//! A multi-byte sequence may be split across fragments, so up to three
//! trailing bytes of a non-final fragment are carried into the next one.

use crate::error::{Error, Result};

/// Incremental UTF-8 validator.
#[derive(Debug, Clone, Default)]
pub struct Utf8Validator {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Validator {
    /// Create a new validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the next fragment of a text message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUtf8`] as soon as the bytes seen so far can
    /// not be a prefix of valid UTF-8, or if `is_final` is set and the
    /// message ends inside a sequence.
    pub fn feed(&mut self, data: &[u8], is_final: bool) -> Result<()> {
        let mut data = data;

        // Complete the sequence carried over from the previous fragment.
        if self.pending_len > 0 {
            let take = (4 - self.pending_len).min(data.len());
            let mut joined = [0u8; 8];
            joined[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
            joined[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            let joined = &joined[..self.pending_len + take];

            match std::str::from_utf8(joined) {
                Ok(_) => {
                    self.pending_len = 0;
                    data = &data[take..];
                }
                Err(e) if e.valid_up_to() > 0 => {
                    // The carried sequence completed; resume right after it.
                    let used = e.valid_up_to() - self.pending_len;
                    self.pending_len = 0;
                    data = &data[used..];
                }
                Err(e) if e.error_len().is_none() => {
                    // Still incomplete: everything fit into the carry buffer.
                    self.pending[..joined.len()].copy_from_slice(joined);
                    self.pending_len = joined.len();
                    return self.finish(is_final);
                }
                Err(_) => return Err(Error::InvalidUtf8),
            }
        }

        match std::str::from_utf8(data) {
            Ok(_) => Ok(()),
            Err(e) if e.error_len().is_none() => {
                let tail = &data[e.valid_up_to()..];
                self.pending[..tail.len()].copy_from_slice(tail);
                self.pending_len = tail.len();
                self.finish(is_final)
            }
            Err(_) => Err(Error::InvalidUtf8),
        }
    }

    fn finish(&self, is_final: bool) -> Result<()> {
        if is_final && self.pending_len > 0 {
            return Err(Error::InvalidUtf8);
        }
        Ok(())
    }

    /// Discard any carried bytes.
    pub fn reset(&mut self) {
        self.pending_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_single_fragment() {
        let mut v = Utf8Validator::new();
        assert!(v.feed("héllo wörld ✓ 🚀".as_bytes(), true).is_ok());
    }

    #[test]
    fn test_invalid_byte() {
        let mut v = Utf8Validator::new();
        assert_eq!(v.feed(&[0x61, 0xff, 0x62], false), Err(Error::InvalidUtf8));
    }

    #[test]
    fn test_incomplete_at_end_of_message() {
        let mut v = Utf8Validator::new();
        assert_eq!(v.feed(&[0x61, 0xe2, 0x82], true), Err(Error::InvalidUtf8));
    }

    #[test]
    fn test_sequence_split_across_fragments() {
        let text = "a€b🚀c".as_bytes();
        for split in 0..=text.len() {
            let mut v = Utf8Validator::new();
            v.feed(&text[..split], false).unwrap();
            v.feed(&text[split..], true).unwrap();
        }
    }

    #[test]
    fn test_sequence_split_byte_by_byte() {
        let text = "🚀€ä".as_bytes();
        let mut v = Utf8Validator::new();
        for (i, byte) in text.iter().enumerate() {
            v.feed(std::slice::from_ref(byte), i == text.len() - 1).unwrap();
        }
    }

    #[test]
    fn test_invalid_continuation_after_split() {
        let mut v = Utf8Validator::new();
        v.feed(&[0xe2, 0x82], false).unwrap();
        assert_eq!(v.feed(&[0x41], true), Err(Error::InvalidUtf8));
    }

    #[test]
    fn test_empty_fragments() {
        let mut v = Utf8Validator::new();
        v.feed(&[0xf0, 0x9f], false).unwrap();
        v.feed(&[], false).unwrap();
        v.feed(&[0x9a, 0x80], true).unwrap();
    }

    #[test]
    fn test_reset() {
        let mut v = Utf8Validator::new();
        v.feed(&[0xe2], false).unwrap();
        v.reset();
        assert!(v.feed(b"ok", true).is_ok());
    }
}
