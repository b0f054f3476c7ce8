//! The two link types a session juggles: the client link, which may be
//! upgraded to TLS mid-startup, and the backend link, which is either a
//! Unix-domain socket or a TCP connection depending on how `upstream` is
//! configured. Both are plain enums over concrete stream types rather
//! than trait objects — there are only ever two or three variants, and
//! matching on them is cheaper and clearer than boxing.

use std::pin::Pin;
use std::task::{Context, Poll};

use pgproxy_tls::{upgrade_server, TlsAcceptorConfig, TlsError};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_openssl::SslStream;

/// The client-facing link. Starts out `Plain`; a `SSLRequest` with TLS
/// material configured upgrades it to `Tls` in place. Generic over the
/// underlying transport so tests can exercise the startup state machine
/// over an in-memory `tokio::io::DuplexStream` instead of a real socket;
/// `Session` always instantiates this as `ClientStream<TcpStream>`.
pub enum ClientStream<S> {
    Plain(S),
    Tls(Box<SslStream<S>>),
}

impl<S> ClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps the current stream in a server-side TLS session. Calling
    /// this on an already-upgraded stream is a caller bug (a client
    /// cannot send two SSLRequests), so it simply hands the stream back
    /// unchanged rather than double-wrapping.
    pub async fn upgrade_tls(self, config: &TlsAcceptorConfig) -> Result<Self, TlsError> {
        match self {
            ClientStream::Plain(stream) => {
                let tls = upgrade_server(stream, config).await?;
                Ok(ClientStream::Tls(Box::new(tls)))
            }
            already_tls @ ClientStream::Tls(_) => Ok(already_tls),
        }
    }
}

impl<S> AsyncRead for ClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S> AsyncWrite for ClientStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// The backend-facing link: a Unix-domain socket when `upstream` names
/// an existing filesystem path, otherwise a plain TCP connection.
pub enum BackendStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connects to `upstream`: a Unix-domain socket if the string names an
/// existing filesystem path, otherwise a TCP `host:port`.
pub async fn connect_backend(upstream: &str) -> std::io::Result<BackendStream> {
    if std::path::Path::new(upstream).exists() {
        UnixStream::connect(upstream).await.map(BackendStream::Unix)
    } else {
        TcpStream::connect(upstream).await.map(BackendStream::Tcp)
    }
}
