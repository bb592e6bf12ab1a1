//! Persisted crash-recovery lock record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File name of the lock record under the workspace root.
pub const LOCK_FILE_NAME: &str = ".agent-relay.lock";

/// Minimal recovery state identifying the owning process and its sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Process id of the orchestrator that wrote the record.
    pub pid: u32,
    /// When that orchestrator started.
    pub started_at: DateTime<Utc>,
    /// Live session ids at the time of the last write.
    pub session_ids: Vec<String>,
}

impl LockRecord {
    /// A record for the current process with no sessions.
    #[must_use]
    pub fn for_current_process() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            session_ids: Vec::new(),
        }
    }
}
