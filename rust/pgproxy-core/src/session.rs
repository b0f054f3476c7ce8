//! Owns one client link and one backend link, drives the startup
//! phase, and — if authorized — spawns the two relay halves and
//! guarantees they are torn down together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pgproxy_authorize::Authorizer;
use pgproxy_tls::TlsAcceptorConfig;
use scopeguard::defer;
use tokio::net::TcpStream;
use tracing::{debug, info_span, Instrument};

use crate::error::ProxyError;
use crate::relay::{run_relay, RelayOutcome};
use crate::startup::{run_startup, StartupOutcome};
use crate::stream::{connect_backend, ClientStream};

/// The knobs a session needs that come from process configuration
/// rather than from the accepted connection itself.
#[derive(Clone)]
pub struct SessionConfig {
    pub upstream: String,
    pub op_timeout: Duration,
    pub max_chain: usize,
    pub tls: Option<Arc<TlsAcceptorConfig>>,
}

/// How a session's startup phase and (if reached) relay phase ended,
/// for the single teardown log line `Session::run` emits.
#[derive(Debug)]
enum SessionOutcome {
    Startup(StartupOutcome),
    Relay {
        first: &'static str,
        outcome: RelayOutcomeSummary,
    },
}

#[derive(Debug)]
enum RelayOutcomeSummary {
    Outcome(RelayOutcome),
    JoinFailed,
}

pub struct Session<A> {
    id: u64,
    client: TcpStream,
    peer_addr: SocketAddr,
    config: SessionConfig,
    authorizer: Arc<A>,
}

impl<A> Session<A>
where
    A: Authorizer + Send + Sync + 'static,
{
    pub fn new(
        id: u64,
        client: TcpStream,
        peer_addr: SocketAddr,
        config: SessionConfig,
        authorizer: Arc<A>,
    ) -> Self {
        Self {
            id,
            client,
            peer_addr,
            config,
            authorizer,
        }
    }

    /// Runs the session to completion. Never propagates an error —
    /// every failure is confined here and turned into a single
    /// debug-level teardown log line naming the session id, peer
    /// address, and which side closed first and why.
    pub async fn run(self) {
        let id = self.id;
        let peer_addr = self.peer_addr;
        match self.run_inner().await {
            Ok(outcome) => debug!(session_id = id, %peer_addr, ?outcome, "session closed"),
            Err(e) => debug!(session_id = id, %peer_addr, error = %e, "session closed with error"),
        }
    }

    async fn run_inner(self) -> Result<SessionOutcome, ProxyError> {
        let Session {
            id,
            client,
            peer_addr,
            config,
            authorizer,
        } = self;
        let peer_ip = peer_addr.ip().to_string();

        let mut backend = connect_backend(&config.upstream)
            .await
            .map_err(ProxyError::UpstreamConnect)?;

        let client = ClientStream::Plain(client);
        let (client, outcome) = run_startup(
            client,
            &mut backend,
            &peer_ip,
            config.tls.as_deref(),
            authorizer.as_ref(),
            config.op_timeout,
        )
        .await?;

        if !matches!(outcome, StartupOutcome::Authorized) {
            return Ok(SessionOutcome::Startup(outcome));
        }

        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend);

        let c2s_span = info_span!("relay", session_id = id, direction = "c2s");
        let s2c_span = info_span!("relay", session_id = id, direction = "s2c");

        let mut c2s = tokio::spawn(
            run_relay(
                client_read,
                backend_write,
                config.max_chain,
                config.op_timeout,
            )
            .instrument(c2s_span),
        );
        let mut s2c = tokio::spawn(
            run_relay(
                backend_read,
                client_write,
                config.max_chain,
                config.op_timeout,
            )
            .instrument(s2c_span),
        );

        let c2s_abort = c2s.abort_handle();
        let s2c_abort = s2c.abort_handle();
        defer! {
            c2s_abort.abort();
            s2c_abort.abort();
        }

        let (first, first_result, mut other) = tokio::select! {
            r = &mut c2s => ("c2s", r, s2c),
            r = &mut s2c => ("s2c", r, c2s),
        };
        other.abort();
        let _ = other.await;

        let outcome = match first_result {
            Ok(outcome) => RelayOutcomeSummary::Outcome(outcome),
            Err(_) => RelayOutcomeSummary::JoinFailed,
        };

        Ok(SessionOutcome::Relay { first, outcome })
    }
}
