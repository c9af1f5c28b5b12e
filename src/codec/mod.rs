//! Async framing over transport halves.
//!
//! [`FrameReader`] and [`FrameWriter`] move whole frames across a byte
//! stream; [`read_http_head`] reads the HTTP part of the opening handshake.

mod framed;
mod http;

pub use framed::{FrameReader, FrameWriter};
pub use http::read_http_head;
