//! The external authorization callout: `(client_ip, role, database) -> bool`.
//!
//! The decision procedure itself is out of scope for this proxy — it is
//! an external program the operator controls. This crate only adapts
//! that contract to an async trait the startup state machine can call.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use tracing::{debug, error};

/// Decides whether a session may proceed, given the client's address
/// and the `user`/`database` the client asked to start up as.
pub trait Authorizer: Send + Sync {
    fn authorize(
        &self,
        client_ip: &str,
        role: &str,
        database: &str,
    ) -> impl Future<Output = bool> + Send;
}

/// Invokes an external program with three positional arguments. Exit
/// status 0 means authorized; anything else (including a failure to
/// spawn, or termination by signal) means denied.
pub struct ExternalScriptAuthorizer {
    program: PathBuf,
}

impl ExternalScriptAuthorizer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Authorizer for ExternalScriptAuthorizer {
    fn authorize(
        &self,
        client_ip: &str,
        role: &str,
        database: &str,
    ) -> impl Future<Output = bool> + Send {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .arg(client_ip)
            .arg(role)
            .arg(database)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        let program = self.program.clone();
        let client_ip = client_ip.to_owned();
        let role = role.to_owned();
        let database = database.to_owned();

        async move {
            match command.status().await {
                Ok(status) => {
                    let allowed = status.success();
                    debug!(program = %program.display(), %client_ip, %role, %database, allowed, "authorizer decision");
                    allowed
                }
                Err(e) => {
                    error!(program = %program.display(), error = %e, "failed to spawn authorizer");
                    false
                }
            }
        }
    }
}

/// Always authorizes. Equivalent in effect to the default `true`
/// program, without shelling out.
#[derive(Default)]
pub struct AlwaysAllowAuthorizer;

impl Authorizer for AlwaysAllowAuthorizer {
    fn authorize(
        &self,
        _client_ip: &str,
        _role: &str,
        _database: &str,
    ) -> impl Future<Output = bool> + Send {
        async { true }
    }
}

/// Always denies.
#[derive(Default)]
pub struct AlwaysDenyAuthorizer;

impl Authorizer for AlwaysDenyAuthorizer {
    fn authorize(
        &self,
        _client_ip: &str,
        _role: &str,
        _database: &str,
    ) -> impl Future<Output = bool> + Send {
        async { false }
    }
}
