//! The protocol-layer heart of the proxy: the startup state machine,
//! the relay halves, and the session that ties one client link to one
//! backend link and tears both down together.
//!
//! Everything below the session boundary (wire framing, TLS, the
//! authorizer callout) lives in its own crate; this crate composes
//! them.

mod error;
mod relay;
mod session;
mod startup;
mod stream;

pub use error::ProxyError;
pub use relay::{run_relay, RelayOutcome};
pub use session::{Session, SessionConfig};
pub use startup::{run_startup, StartupOutcome};
pub use stream::{connect_backend, BackendStream, ClientStream};
