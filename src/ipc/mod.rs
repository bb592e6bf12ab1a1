//! Local command surface for `agent-relay-ctl`.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line commands and returns structured results.

pub mod server;

pub use server::{dispatch, handle_line, IpcRequest, IpcResponse, MAX_BATCH_SIZE};
