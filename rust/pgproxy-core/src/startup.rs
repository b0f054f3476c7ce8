//! The pre-authorization state machine that runs once per session on
//! the client link: TLS-upgrade shim, startup-message decoding,
//! authorization, fatal-error synthesis, and cancel-request pass-through.

use std::time::Duration;

use pgproxy_authorize::Authorizer;
use pgproxy_tls::TlsAcceptorConfig;
use pgproxy_wire::{fatal_error_frame_28000, parse_startup_params, StartupFrame, StartupKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::stream::ClientStream;

/// A single buffered read is assumed to carry the entire startup frame
/// (length prefix included); 8 KiB comfortably covers any real client's
/// StartupMessage. A frame fragmented across TCP segments is not
/// reassembled — this mirrors a known simplification of the system this
/// proxy is modeled on, preserved here rather than fixed.
const STARTUP_READ_CAP: usize = 8 * 1024;

/// How the startup phase concluded, driving what `Session` does next.
#[derive(Debug)]
pub enum StartupOutcome {
    /// Authorization succeeded and the original StartupMessage bytes
    /// have already been forwarded to the backend. Relay halves should
    /// now be spawned.
    Authorized,
    /// Authorization was refused, or the startup message was malformed
    /// or missing `user`/`database`. A fatal error frame has already
    /// been sent to the client.
    Denied,
    /// A CancelRequest was forwarded to the backend verbatim. No relay
    /// halves are spawned; the session ends here.
    Cancelled,
    /// The client sent something that isn't a valid startup frame at
    /// all (too short to hold a length prefix, or a declared length the
    /// single buffered read didn't actually contain).
    ProtocolError,
}

/// Drives the startup phase to completion, returning the (possibly
/// TLS-upgraded) client stream together with the outcome. The caller
/// owns the backend link and passes it in by reference so the state
/// machine can forward StartupMessage/CancelRequest bytes to it
/// directly, exactly as read from the client.
///
/// Every read and write on either link is bounded by `op_timeout`, the
/// same per-operation deadline the relay halves apply once a session is
/// authorized — a client that connects and never sends anything must
/// not pin an already-opened backend connection forever.
pub async fn run_startup<S, A, B>(
    mut client: ClientStream<S>,
    backend: &mut B,
    peer_ip: &str,
    tls_config: Option<&TlsAcceptorConfig>,
    authorizer: &A,
    op_timeout: Duration,
) -> Result<(ClientStream<S>, StartupOutcome), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    A: Authorizer,
    B: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STARTUP_READ_CAP];
    loop {
        let n = timed(op_timeout, client.read(&mut buf)).await?;
        if n < 4 {
            return Ok((client, StartupOutcome::ProtocolError));
        }
        let declared_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if declared_len < 4 || declared_len > n {
            return Ok((client, StartupOutcome::ProtocolError));
        }
        let frame_bytes = &buf[..declared_len];
        let frame = StartupFrame::new(&frame_bytes[4..]);

        match frame.kind() {
            StartupKind::SslRequest => match tls_config {
                Some(config) => {
                    timed(op_timeout, client.write_all(b"S")).await?;
                    client = timed(op_timeout, client.upgrade_tls(config)).await?;
                }
                None => {
                    timed(op_timeout, client.write_all(b"N")).await?;
                }
            },
            StartupKind::CancelRequest => {
                timed(op_timeout, backend.write_all(frame_bytes)).await?;
                return Ok((client, StartupOutcome::Cancelled));
            }
            StartupKind::StartupMessage => {
                let params = parse_startup_params(frame.body());
                let user = find_param(&params, b"user");
                let database = find_param(&params, b"database");
                let other_params: Vec<(String, String)> = params
                    .iter()
                    .filter(|(k, _)| k != b"user" && k != b"database")
                    .map(|(k, v)| {
                        (
                            String::from_utf8_lossy(k).into_owned(),
                            String::from_utf8_lossy(v).into_owned(),
                        )
                    })
                    .collect();

                let Some((user, database)) = user.zip(database) else {
                    warn!(%peer_ip, "startup message missing user or database");
                    timed(op_timeout, deny(&mut client, "Custom auth failed!")).await?;
                    return Ok((client, StartupOutcome::Denied));
                };

                let allowed = authorizer.authorize(peer_ip, &user, &database).await;
                debug!(
                    %peer_ip,
                    %user,
                    %database,
                    allowed,
                    ?other_params,
                    "authorization decision"
                );
                if allowed {
                    timed(op_timeout, backend.write_all(frame_bytes)).await?;
                    return Ok((client, StartupOutcome::Authorized));
                }
                timed(op_timeout, deny(&mut client, "Custom auth failed!")).await?;
                return Ok((client, StartupOutcome::Denied));
            }
            StartupKind::Unrecognized => {
                warn!(%peer_ip, "unrecognized startup discriminator");
                timed(
                    op_timeout,
                    deny(&mut client, "Unknown startup message, possibly an old client?"),
                )
                .await?;
                return Ok((client, StartupOutcome::Denied));
            }
        }
    }
}

fn find_param(params: &[(Vec<u8>, Vec<u8>)], key: &[u8]) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
}

async fn deny<S>(client: &mut ClientStream<S>, message: &str) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client
        .write_all(&fatal_error_frame_28000(message))
        .await
}

/// Races `fut` against `op_timeout`, turning an elapsed deadline into
/// `ProxyError::Timeout` instead of leaving the startup phase suspended
/// indefinitely on a silent client.
async fn timed<T, E>(
    op_timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, ProxyError>
where
    ProxyError: From<E>,
{
    match tokio::time::timeout(op_timeout, fut).await {
        Ok(result) => result.map_err(ProxyError::from),
        Err(_) => Err(ProxyError::Timeout),
    }
}
