//! Command-line configuration: listen address, backend upstream,
//! authorization script, optional TLS material, timeouts, and logging
//! verbosity.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

const DEFAULT_LISTEN: &str = "0.0.0.0:6000";
const DEFAULT_UPSTREAM: &str = "/var/run/postgresql/.s.PGSQL.5432";
const DEFAULT_AUTH_SCRIPT: &str = "/usr/bin/true";
const DEFAULT_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_MAX_CHAIN: usize = 10_000_000;

#[derive(Parser, Debug)]
#[command(author, version, about = "Transparent authorization proxy in front of a PostgreSQL backend")]
pub struct Args {
    /// Address to accept client connections on.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Backend to forward authorized sessions to: a Unix-domain socket
    /// path (if it exists on disk) or a `host:port` TCP address.
    #[arg(long, default_value = DEFAULT_UPSTREAM)]
    pub upstream: String,

    /// External program invoked as `auth-script client_ip user database`;
    /// exit status 0 authorizes the session.
    #[arg(long, default_value = DEFAULT_AUTH_SCRIPT)]
    pub auth_script: PathBuf,

    /// Path to a PEM file containing both certificate and private key,
    /// used to transparently upgrade the client link to TLS on
    /// SSLRequest. Omit to refuse TLS upgrades.
    #[arg(long)]
    pub ssl: Option<PathBuf>,

    /// Per-operation read/write timeout, in seconds, applied to both links.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Upper bound, in bytes, on a single reassembled message chain.
    #[arg(long, default_value_t = DEFAULT_MAX_CHAIN)]
    pub max_chain: usize,

    /// Log verbosity.
    #[arg(long, value_enum, default_value_t = Verbosity::Info)]
    pub verbosity: Verbosity,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum Verbosity {
    Error,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    pub fn as_filter_directive(self) -> &'static str {
        match self {
            Verbosity::Error => "error",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

impl Args {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}
