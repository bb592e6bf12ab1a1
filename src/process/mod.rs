//! Execution-process stdio plumbing.
//!
//! Agent processes speak newline-delimited JSON on stdin/stdout. This module
//! frames that stream ([`codec`]), decodes it ([`reader`]), encodes outbound
//! messages ([`writer`]), and starts processes ([`spawner`]).

pub mod codec;
pub mod reader;
pub mod spawner;
pub mod writer;

pub use reader::ProcessMessage;
pub use spawner::{AgentLauncher, AgentProcess, CliLauncher, LaunchSpec};
