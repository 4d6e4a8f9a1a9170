//! Session management: orchestration, PTY lifecycle, control sockets,
//! recording and on-disk metadata.

pub mod control;
pub mod escape;
pub mod events;
pub mod foreground;
pub mod info;
pub mod kill;
pub mod orchestrator;
pub mod pruning;
pub mod pty;
pub mod recording;
pub mod runtime;
pub mod scrollback;
pub mod store;
pub mod title;

pub use events::OrchestratorEvent;
pub use info::{SessionInfo, SessionPaths, SessionStatus, SessionSummary};
pub use orchestrator::{SessionInput, SessionOptions, SessionOrchestrator, SpecialKey};
pub use pty::PtyHandle;
pub use recording::RecordingWriter;
pub use scrollback::Scrollback;
pub use store::SessionStore;
pub use title::TitleMode;
