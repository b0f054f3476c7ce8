//! Binary entry point: argument parsing, logging configuration, and the
//! TCP accept loop. None of this is part of the protocol-layer core in
//! `pgproxy-core` — it only wires the core's narrow interfaces (a
//! listener, a backend-link factory, an authorizer, a log sink) to real
//! implementations.

mod config;
mod logging;

use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use pgproxy_authorize::ExternalScriptAuthorizer;
use pgproxy_core::{Session, SessionConfig};
use pgproxy_tls::TlsAcceptorConfig;
use tokio::net::TcpListener;
use tracing::{error, info};

use config::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbosity);

    let tls = match args.ssl.as_ref() {
        Some(path) => match TlsAcceptorConfig::from_pem_files(path, path) {
            Ok(config) => Some(Arc::new(config)),
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load TLS material");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let listener = match TcpListener::bind(&args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };
    info!(listen = %args.listen, upstream = %args.upstream, "pgproxy listening");

    let session_config = SessionConfig {
        upstream: args.upstream.clone(),
        op_timeout: args.op_timeout(),
        max_chain: args.max_chain,
        tls,
    };
    let authorizer = Arc::new(ExternalScriptAuthorizer::new(args.auth_script.clone()));
    let next_id = AtomicU64::new(0);

    loop {
        let (client, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // A per-accept failure (e.g. the process's fd table is
                // full) is logged and the loop keeps running; it must
                // never stop serving already-connected peers' chances at
                // reconnecting.
                error!(error = %e, "accept failed");
                continue;
            }
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let config = session_config.clone();
        let authorizer = authorizer.clone();
        tokio::spawn(async move {
            Session::new(id, client, peer_addr, config, authorizer)
                .run()
                .await;
        });
    }
}
