//! Remote session layer
//!
//! `RemoteSession` is the narrow contract the engine consumes; `TelnetSession`
//! is the line-oriented TCP adapter behind it. `SessionManager` keeps one
//! shared session per (node, kind) so consecutive tasks reuse a live
//! connection instead of reconnecting per command.

mod manager;
mod remote;

pub use manager::{SessionFactory, SessionManager, SharedSession};
pub use remote::{RemoteSession, TelnetSession, TelnetSessionFactory};
