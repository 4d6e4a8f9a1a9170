//! termbroker-client: drive a termbroker session through its control socket.
//!
//! Used by the orchestrator to proxy sessions owned by another process and by
//! the `termbrokerd` CLI for one-shot commands.

pub mod control;

pub use control::{ClientEvent, ClientOptions, ControlClient, MAX_SOCKET_PATH_LEN};

// Re-export core error types for convenience.
pub use termbroker_core::{BrokerError, BrokerResult};
