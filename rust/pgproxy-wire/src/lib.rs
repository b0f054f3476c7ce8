//! Wire-level data model and message framing for the PostgreSQL
//! frontend/backend protocol, scoped to what a transparent proxy needs:
//! header validation, chained reassembly, and startup-frame decoding.
//!
//! This crate deliberately does not decode the semantics of any
//! post-startup message. It knows the shape of a message (token byte +
//! length + payload) and the shape of the tokenless startup frame, and
//! nothing more.

mod constants;
mod error_frame;
mod framer;
mod startup;

pub use constants::{is_valid_token, HEADER_LEN};
pub use error_frame::{fatal_error_frame, fatal_error_frame_28000};
pub use framer::Framer;
pub use startup::{parse_startup_params, StartupFrame, StartupKind};
