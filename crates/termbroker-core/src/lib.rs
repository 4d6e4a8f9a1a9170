//! termbroker-core: shared protocol library for the terminal-session broker.
//!
//! Provides the control-socket message types, the binary frame codec,
//! session identifiers and the common error type.

pub mod codec;
pub mod error;
pub mod protocol;
pub mod session_id;

// Re-export commonly used items at crate root.
pub use codec::{frame, MessageParser, HEADER_LEN, MAX_PAYLOAD_SIZE};
pub use error::{BrokerError, BrokerResult, ErrorKind};
pub use protocol::{ControlCommand, Message, MessageType, SignalSpec};
pub use session_id::SessionId;
