//! Tool invocation correlation with bounded lifetime.
//!
//! Records `call id -> tool name` when the agent invokes a tool and hands the
//! name back when the matching result arrives. Entries expire after a fixed
//! TTL so calls whose result never arrives do not accumulate; expiry is
//! driven by a deadline min-heap swept on every access.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

/// Name reported for results whose call was never seen or already expired.
pub const UNKNOWN_TOOL: &str = "unknown";

/// Correlates tool calls with their results.
#[derive(Debug)]
pub struct ToolCorrelator {
    ttl: Duration,
    names: HashMap<String, (String, Instant)>,
    expiry: BinaryHeap<Reverse<(Instant, String)>>,
}

impl ToolCorrelator {
    /// Create a correlator whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            names: HashMap::new(),
            expiry: BinaryHeap::new(),
        }
    }

    /// Record that `call_id` invoked `tool_name`.
    pub fn record(&mut self, call_id: &str, tool_name: &str) {
        let now = Instant::now();
        self.evict_expired(now);
        let deadline = now + self.ttl;
        self.names
            .insert(call_id.to_owned(), (tool_name.to_owned(), deadline));
        self.expiry.push(Reverse((deadline, call_id.to_owned())));
    }

    /// Remove and return the tool name for `call_id`, or [`UNKNOWN_TOOL`].
    pub fn resolve(&mut self, call_id: &str) -> String {
        self.evict_expired(Instant::now());
        self.names
            .remove(call_id)
            .map_or_else(|| UNKNOWN_TOOL.to_owned(), |(name, _)| name)
    }

    /// Number of calls awaiting a result.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no calls are awaiting a result.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(Reverse((deadline, _))) = self.expiry.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, call_id))) = self.expiry.pop() else {
                break;
            };
            // A re-recorded id carries a newer deadline; keep it.
            if self
                .names
                .get(&call_id)
                .is_some_and(|(_, current)| *current == deadline)
            {
                self.names.remove(&call_id);
            }
        }
    }
}
