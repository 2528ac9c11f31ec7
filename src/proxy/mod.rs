//! The proxy side of recache: request parsing, per-session protocol logic,
//! and the listener/worker-pool server.

pub mod request;
pub mod server;
pub mod session;

pub use request::{parse_target, RequestLine, Target};
pub use server::ProxyServer;
pub use session::{handle_session, SessionOutcome};
