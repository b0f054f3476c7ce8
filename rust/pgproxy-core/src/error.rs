use thiserror::Error;

/// Every fallible operation in the core returns this. The session
/// boundary is where a `ProxyError` turns into a teardown rather than
/// propagating further — no error crosses a session's own task.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] pgproxy_tls::TlsError),

    #[error("operation timed out")]
    Timeout,

    #[error("failed to connect to upstream: {0}")]
    UpstreamConnect(#[source] std::io::Error),
}
