//! Summary text rendering.
//!
//! Each entry becomes a block:
//!
//! ```text
//! =fitness=
//! 09:00 gym
//! ```
//!
//! Blocks are separated by a blank line, in snapshot order.

use std::fmt::Write;

use crate::store::Snapshot;

#[derive(Clone, Debug)]
pub struct SummaryRenderer {
    empty_placeholder: String,
}

impl SummaryRenderer {
    pub fn new(empty_placeholder: impl Into<String>) -> Self {
        Self {
            empty_placeholder: empty_placeholder.into(),
        }
    }

    /// Deterministic: equal snapshots render to identical text.
    pub fn render(&self, snapshot: &Snapshot) -> String {
        if snapshot.is_empty() {
            return self.empty_placeholder.clone();
        }
        let mut out = String::new();
        for (i, entry) in snapshot.iter().enumerate() {
            if i > 0 {
                out.push_str("\n\n");
            }
            let _ = write!(out, "={}=\n{} {}", entry.category, entry.time, entry.body);
        }
        out
    }

    pub fn empty_placeholder(&self) -> &str {
        &self.empty_placeholder
    }
}
