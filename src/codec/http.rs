use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Read an HTTP head (start line and headers) from `io`.
///
/// Bytes are accumulated in `buf`; on success the head, terminator
/// included, is split off and returned while anything received after it
/// stays in `buf`.
///
/// # Errors
///
/// Returns [`Error::InvalidHandshake`] if the head grows beyond `limit`
/// bytes or the stream ends first, and [`Error::Io`] on transport errors.
pub async fn read_http_head<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut BytesMut,
    limit: usize,
) -> Result<BytesMut> {
    let mut searched = 0;
    loop {
        if let Some(pos) = find_terminator(&buf[searched..]) {
            let end = searched + pos + HEAD_TERMINATOR.len();
            return Ok(buf.split_to(end));
        }
        if buf.len() > limit {
            return Err(Error::handshake(format!(
                "HTTP head exceeds {limit} bytes"
            )));
        }
        // Resume the search a few bytes back in case the terminator straddles reads.
        searched = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);

        buf.reserve(1024);
        if io.read_buf(buf).await? == 0 {
            return Err(Error::handshake("connection closed during handshake"));
        }
    }
}

fn find_terminator(data: &[u8]) -> Option<usize> {
    data.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}
