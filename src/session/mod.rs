//! Session Management Module
//!
//! - `SessionManager`: logical sessions over pooled connections, with a
//!   command shell for one-shot `execute` calls
//! - `TerminalStreamer`: interactive PTY per session, streamed as sanitized
//!   output events
//! - Idle sweep and cascading close when a connection goes away

mod history;
mod manager;
pub mod sanitize;
mod shell;
mod terminal;
pub mod types;

pub use history::CommandHistory;
pub use manager::{SessionEntry, SessionManager};
pub use sanitize::{sanitize_output, StreamSanitizer};
pub use terminal::{TerminalEvent, TerminalStreamer, SHELL_EXITED};
pub use types::{
    ExecResult, HistoryEntry, SessionConfig, SessionError, SessionEvent, SessionId, SessionInfo,
    SessionStats,
};
