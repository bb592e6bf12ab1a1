//! Session orchestration.
//!
//! Covers the session registry, the pending question/permission broker,
//! crash recovery, and idle reaping.

pub mod pending;
pub mod reaper;
pub mod recovery;
pub mod session_manager;

pub use session_manager::{CreateSessionRequest, OutputPage, SessionManager, ShutdownReport};
