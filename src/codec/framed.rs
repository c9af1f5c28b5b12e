use std::sync::{Mutex, PoisonError};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::extensions::ExtensionPipeline;
use crate::protocol::Frame;

/// Reads frames from the receiving half of a transport.
///
/// Bytes are buffered until a whole frame is available; the header is
/// validated as soon as it arrives so an oversized frame is rejected without
/// buffering its payload.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
    read_size: usize,
    mask_expected: bool,
}

impl<R> FrameReader<R> {
    #[must_use]
    pub fn new(io: R, mask_expected: bool, read_size: usize) -> Self {
        Self::with_buffered(io, mask_expected, read_size, BytesMut::new())
    }

    /// Start from bytes that were already read off the transport, e.g. frames
    /// pipelined behind the handshake.
    #[must_use]
    pub fn with_buffered(io: R, mask_expected: bool, read_size: usize, buffered: BytesMut) -> Self {
        let read_size = read_size.max(1);
        let mut buf = buffered;
        buf.reserve(read_size);
        Self {
            io,
            buf,
            read_size,
            mask_expected,
        }
    }

    /// Bytes received but not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn into_inner(self) -> R {
        self.io
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    ///
    /// # Errors
    ///
    /// Any decode error from [`Frame::decode`], or [`Error::Io`] if the
    /// transport fails or ends in the middle of a frame.
    pub async fn read_frame(
        &mut self,
        max_size: Option<usize>,
        extensions: &Mutex<ExtensionPipeline>,
    ) -> Result<Option<Frame>> {
        loop {
            let decoded = {
                let mut pipeline = extensions.lock().unwrap_or_else(PoisonError::into_inner);
                Frame::decode(&self.buf, self.mask_expected, max_size, &mut pipeline)?
            };
            if let Some((frame, consumed)) = decoded {
                self.buf.advance(consumed);
                return Ok(Some(frame));
            }

            self.buf.reserve(self.read_size);
            if self.io.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Io(format!(
                    "stream ended inside a frame ({} bytes pending)",
                    self.buf.len()
                )));
            }
        }
    }

    /// Read and discard everything until the peer closes its side.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if reading fails.
    pub async fn read_to_eof(&mut self) -> Result<()> {
        self.buf.clear();
        loop {
            self.buf.reserve(self.read_size);
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Ok(());
            }
            self.buf.clear();
        }
    }
}

/// Writes frames to the sending half of a transport.
///
/// Each frame is serialized into a scratch buffer and handed to the
/// transport in a single `write_all`.
pub struct FrameWriter<W> {
    io: W,
    buf: BytesMut,
    mask: bool,
}

impl<W> FrameWriter<W> {
    #[must_use]
    pub fn new(io: W, mask: bool, write_size: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(write_size),
            mask,
        }
    }

    #[must_use]
    pub fn into_inner(self) -> W {
        self.io
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Encode and write one frame, then flush.
    ///
    /// # Errors
    ///
    /// Encoding errors from [`Frame::encode`], or [`Error::Io`].
    pub async fn write_frame(
        &mut self,
        frame: Frame,
        extensions: &Mutex<ExtensionPipeline>,
    ) -> Result<()> {
        self.buf.clear();
        {
            let mut pipeline = extensions.lock().unwrap_or_else(PoisonError::into_inner);
            frame.encode(&mut self.buf, self.mask, &mut pipeline)?;
        }
        self.io.write_all(&self.buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Close the write direction of the transport.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
