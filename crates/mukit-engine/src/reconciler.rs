//! Pinned-message drift detection.
//!
//! ```text
//!   Unpinned ──record_pinned──▶ PinnedExpected ──observe(same)──▶ PinnedExpected
//!      ▲                              │
//!      │                       observe(other|none)
//!      │                              ▼
//!      └────────resolve_drift───── Drifted
//! ```

use mukit_core::MessageId;

use crate::store::SummaryStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PinPhase {
    #[default]
    Unpinned,
    PinnedExpected { message_id: MessageId },
    Drifted {
        expected: MessageId,
        observed: Option<MessageId>,
    },
}

/// What a single check saw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// Nothing expected, nothing checked.
    Idle,
    InSync,
    Drifted {
        expected: MessageId,
        observed: Option<MessageId>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct PinReconciler {
    phase: PinPhase,
}

impl PinReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> PinPhase {
        self.phase
    }

    /// The message id the engine believes is pinned.
    pub fn expected(&self) -> Option<MessageId> {
        match self.phase {
            PinPhase::PinnedExpected { message_id } => Some(message_id),
            PinPhase::Unpinned | PinPhase::Drifted { .. } => None,
        }
    }

    /// A successful pin or edit landed on `message_id`.
    pub fn record_pinned(&mut self, message_id: MessageId) {
        self.phase = PinPhase::PinnedExpected { message_id };
    }

    /// Compare the transport-reported pin with the expectation.
    pub fn observe(&mut self, actual: Option<MessageId>) -> Observation {
        match self.phase {
            PinPhase::Unpinned => Observation::Idle,
            PinPhase::PinnedExpected { message_id } if actual == Some(message_id) => Observation::InSync,
            PinPhase::PinnedExpected { message_id } => {
                self.phase = PinPhase::Drifted {
                    expected: message_id,
                    observed: actual,
                };
                Observation::Drifted {
                    expected: message_id,
                    observed: actual,
                }
            }
            PinPhase::Drifted { expected, observed } => Observation::Drifted { expected, observed },
        }
    }

    /// Clear the store and forget the expectation. No-op unless drifted.
    pub fn resolve_drift(&mut self, store: &mut SummaryStore) -> bool {
        if !matches!(self.phase, PinPhase::Drifted { .. }) {
            return false;
        }
        store.clear();
        self.phase = PinPhase::Unpinned;
        true
    }

    /// One leveled poll: observe, and on drift clear the store.
    pub fn check(&mut self, actual: Option<MessageId>, store: &mut SummaryStore) -> Observation {
        let observation = self.observe(actual);
        if matches!(observation, Observation::Drifted { .. }) {
            self.resolve_drift(store);
        }
        observation
    }

    /// Forget the expectation without touching the store.
    pub fn reset(&mut self) {
        self.phase = PinPhase::Unpinned;
    }
}
