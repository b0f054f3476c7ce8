use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::constants::{is_valid_token, HEADER_LEN};

/// Reads maximal chains of contiguous, well-formed PostgreSQL messages
/// from a stream into a caller-owned buffer.
///
/// A `Framer` is stateful across calls only in one narrow sense: the
/// opportunistic peek at the end of a chain may consume a handful of
/// bytes that turn out not to form a complete next header. Those bytes
/// came off the wire and cannot be put back, so they are carried
/// forward in `pending` and prepended to the next call's buffer — the
/// same accumulate-across-calls trick `db_proto`'s `StructBuffer` uses
/// for partial messages, here applied to a partial *header* instead.
#[derive(Default)]
pub struct Framer {
    pending: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads one non-empty, maximal chain of complete messages from
    /// `source` into `buffer`.
    ///
    /// Returns `Ok(true)` with `buffer` holding zero or more whole
    /// messages and no trailing partial bytes. Returns `Ok(false)` if a
    /// leading token byte outside the valid set was encountered (a
    /// framing error); `buffer`'s contents are then unspecified. I/O
    /// errors, including a mid-message EOF, propagate as `Err`.
    pub async fn pull_entire_message<R: AsyncRead + Unpin>(
        &mut self,
        source: &mut R,
        buffer: &mut Vec<u8>,
        chain_cap: usize,
    ) -> io::Result<bool> {
        buffer.clear();
        buffer.append(&mut self.pending);

        if buffer.len() < HEADER_LEN {
            let had_bytes = !buffer.is_empty();
            let mut extra = vec![0u8; HEADER_LEN - buffer.len()];
            match read_fill(source, &mut extra).await? {
                Fill::Full => buffer.extend_from_slice(&extra),
                Fill::Eof(got) => {
                    if !had_bytes && got == 0 {
                        return Ok(true);
                    }
                    return Err(mid_message_eof());
                }
            }
        }

        let mut offset = 0usize;
        loop {
            let token = buffer[offset];
            if !is_valid_token(token) {
                return Ok(false);
            }
            let declared_len =
                u32::from_be_bytes(buffer[offset + 1..offset + 5].try_into().unwrap()) as usize;
            let total_size = declared_len + 1;
            if total_size < HEADER_LEN {
                // A declared length shorter than the header it contains
                // can never be satisfied; treat it like any other
                // malformed leading byte.
                return Ok(false);
            }
            let body_remaining = total_size - HEADER_LEN;

            if body_remaining > 0 {
                let start = buffer.len();
                buffer.resize(start + body_remaining, 0);
                match read_fill(source, &mut buffer[start..]).await? {
                    Fill::Full => {}
                    Fill::Eof(_) => return Err(mid_message_eof()),
                }
            }

            let peek_enabled = buffer.len() <= chain_cap;
            if !peek_enabled {
                return Ok(true);
            }

            let mut peek_buf = [0u8; HEADER_LEN];
            let n_peek = try_read_once(source, &mut peek_buf).await?;
            if n_peek == 0 {
                return Ok(true);
            }
            if n_peek < HEADER_LEN {
                self.pending.clear();
                self.pending.extend_from_slice(&peek_buf[..n_peek]);
                return Ok(true);
            }

            buffer.extend_from_slice(&peek_buf);
            let next_len = u32::from_be_bytes(peek_buf[1..5].try_into().unwrap());
            if next_len == 4 {
                // Payload-less message, fully consumed by the peek read.
                return Ok(true);
            }
            offset = buffer.len() - HEADER_LEN;
        }
    }
}

enum Fill {
    Full,
    Eof(usize),
}

/// Reads until `buf` is completely filled or the stream ends.
async fn read_fill<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> io::Result<Fill> {
    let mut total = 0;
    while total < buf.len() {
        let n = source.read(&mut buf[total..]).await?;
        if n == 0 {
            return Ok(Fill::Eof(total));
        }
        total += n;
    }
    Ok(Fill::Full)
}

/// A single non-blocking read attempt: polls `source` once with a
/// no-op waker and treats `Pending` as "nothing ready right now"
/// (`Ok(0)`) rather than suspending. This is what makes chain reads
/// greedy-but-non-blocking: once the first header of a chain has
/// arrived, we never wait for the next message to show up.
async fn try_read_once<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut read_buf = ReadBuf::new(buf);
    match Pin::new(source).poll_read(&mut cx, &mut read_buf) {
        Poll::Ready(Ok(())) => Ok(read_buf.filled().len()),
        Poll::Ready(Err(e)) => Err(e),
        Poll::Pending => Ok(0),
    }
}

fn mid_message_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "mid-message EOF")
}
