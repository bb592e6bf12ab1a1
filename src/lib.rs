#![forbid(unsafe_code)]

//! `agent-relay` drives many concurrent headless agent sessions, brokers
//! their questions and permission requests, survives its own crashes, and
//! relays important state changes to a remote controller over a webhook.

pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod session;
pub mod webhook;
pub mod workspace;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
