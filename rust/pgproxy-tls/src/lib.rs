//! Server-side TLS upgrade shim for the client link.
//!
//! This is deliberately much narrower than a general-purpose TLS
//! abstraction: one certificate+key bundle loaded once at startup, no
//! SNI, no ALPN, no client certificate verification, TLSv1 and up. The
//! backend link is never upgraded.

use std::path::Path;

use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode, SslVersion};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("failed to build SSL context: {0}")]
    Context(#[source] openssl::error::ErrorStack),
    #[error("failed to load certificate from {path}: {source}")]
    Certificate {
        path: String,
        #[source]
        source: openssl::error::ErrorStack,
    },
    #[error("failed to load private key from {path}: {source}")]
    PrivateKey {
        path: String,
        #[source]
        source: openssl::error::ErrorStack,
    },
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] openssl::ssl::Error),
    #[error("failed to construct TLS session: {0}")]
    Session(#[source] openssl::error::ErrorStack),
}

/// A reusable, pre-built TLS server acceptor. Built once from a PEM
/// certificate+key pair at process startup and shared across sessions.
#[derive(Clone)]
pub struct TlsAcceptorConfig {
    acceptor: SslAcceptor,
}

impl TlsAcceptorConfig {
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsConfigError> {
        let mut builder =
            SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).map_err(TlsConfigError::Context)?;
        builder
            .set_min_proto_version(Some(SslVersion::TLS1))
            .map_err(TlsConfigError::Context)?;
        builder.set_verify(SslVerifyMode::NONE);
        builder
            .set_certificate_chain_file(cert_path.as_ref())
            .map_err(|source| TlsConfigError::Certificate {
                path: cert_path.as_ref().display().to_string(),
                source,
            })?;
        builder
            .set_private_key_file(key_path.as_ref(), SslFiletype::PEM)
            .map_err(|source| TlsConfigError::PrivateKey {
                path: key_path.as_ref().display().to_string(),
                source,
            })?;
        Ok(Self {
            acceptor: builder.build(),
        })
    }
}

/// Performs the server-side handshake on an already-accepted stream,
/// producing a TLS-wrapped stream that reads/writes plaintext.
pub async fn upgrade_server<S>(
    stream: S,
    config: &TlsAcceptorConfig,
) -> Result<SslStream<S>, TlsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ssl = openssl::ssl::Ssl::new(config.acceptor.context()).map_err(TlsError::Session)?;
    let mut tls_stream = SslStream::new(ssl, stream).map_err(TlsError::Session)?;
    std::pin::Pin::new(&mut tls_stream)
        .accept()
        .await
        .map_err(TlsError::Handshake)?;
    Ok(tls_stream)
}
