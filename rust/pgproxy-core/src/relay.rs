//! Once a session is authorized, two of these run concurrently: one
//! reassembling client→backend chains, one backend→client. Each owns a
//! [`pgproxy_wire::Framer`] and its buffer; the two halves are symmetric
//! except that only the client→backend link ever sees a startup phase,
//! and that already happened before the relay halves were spawned.

use std::time::Duration;

use pgproxy_wire::Framer;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

/// Why a relay half stopped.
#[derive(Debug)]
pub enum RelayOutcome {
    /// The input link reached EOF with nothing buffered — a clean
    /// close, the common case when the peer hangs up normally.
    ClosedCleanly,
    /// An invalid leading token byte was found in the stream.
    FramingError,
    /// Any other I/O failure, including a mid-message EOF and a
    /// per-operation timeout.
    Io(std::io::Error),
}

/// Relays one direction: read a maximal chain of whole messages, write
/// it out in one call, repeat. Bytes are written to `writer` in exactly
/// the order they were read from `reader`; nothing is reordered or
/// buffered across chains.
pub async fn run_relay<R, W>(
    mut reader: R,
    mut writer: W,
    chain_cap: usize,
    op_timeout: Duration,
) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framer = Framer::new();
    let mut buf = Vec::new();

    loop {
        let frame = match tokio::time::timeout(
            op_timeout,
            framer.pull_entire_message(&mut reader, &mut buf, chain_cap),
        )
        .await
        {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return RelayOutcome::Io(e),
            Err(_) => return RelayOutcome::Io(timeout_error("read")),
        };

        if !frame {
            error!("invalid leading token byte; closing relay half");
            return RelayOutcome::FramingError;
        }

        if buf.is_empty() {
            trace!("input closed cleanly");
            return RelayOutcome::ClosedCleanly;
        }

        trace!(bytes = buf.len(), "relaying chain");
        match tokio::time::timeout(op_timeout, writer.write_all(&buf)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return RelayOutcome::Io(e),
            Err(_) => return RelayOutcome::Io(timeout_error("write")),
        }
    }
}

fn timeout_error(op: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{op} timed out"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn msg(token: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![token];
        let len = (payload.len() + 4) as u32;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn relays_bytes_in_order_then_closes_cleanly() {
        let (mut source_write, source_read) = duplex(4096);
        let (sink_write, mut sink_read) = duplex(4096);

        let data = msg(b'Q', b"AB");
        source_write.write_all(&data).await.unwrap();
        drop(source_write);

        let outcome = run_relay(source_read, sink_write, 1_000_000, Duration::from_secs(5)).await;
        assert!(matches!(outcome, RelayOutcome::ClosedCleanly));

        let mut got = vec![0u8; data.len()];
        sink_read.read_exact(&mut got).await.unwrap();
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn framing_error_stops_the_half() {
        let (mut source_write, source_read) = duplex(4096);
        let (sink_write, _sink_read) = duplex(4096);

        source_write.write_all(&msg(b'z', b"AB")).await.unwrap();
        drop(source_write);

        let outcome = run_relay(source_read, sink_write, 1_000_000, Duration::from_secs(5)).await;
        assert!(matches!(outcome, RelayOutcome::FramingError));
    }

    #[tokio::test]
    async fn mid_message_eof_is_io_error() {
        let (mut source_write, source_read) = duplex(4096);
        let (sink_write, _sink_read) = duplex(4096);

        let mut data = msg(b'Q', b"ABCDEF");
        data.truncate(data.len() - 2);
        source_write.write_all(&data).await.unwrap();
        drop(source_write);

        let outcome = run_relay(source_read, sink_write, 1_000_000, Duration::from_secs(5)).await;
        assert!(matches!(outcome, RelayOutcome::Io(_)));
    }
}
