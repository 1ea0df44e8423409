//! The summary engine: turns directive messages into one pinned summary per chat.
//!
//! Data flows leaf to root:
//! [`parser`] → [`classifier`] → [`store`] → [`renderer`] → transport, with
//! [`reconciler`] watching for pins removed outside the bot. [`Engine`] owns
//! the per-chat state and drives all of it.

pub mod classifier;
pub mod engine;
pub mod error;
pub mod mock;
pub mod parser;
pub mod reconciler;
pub mod reliable;
pub mod renderer;
pub mod store;

pub use classifier::{CategoryClassifier, ClassifierError};
pub use engine::{ClearOutcome, Engine, EngineConfig, MessageOutcome};
pub use error::EngineError;
pub use parser::{parse, ParsedEntry, ParsedMessage, Rejection};
pub use reconciler::{Observation, PinPhase, PinReconciler};
pub use reliable::{ReliableTransport, RetryConfig};
pub use renderer::SummaryRenderer;
pub use store::{Snapshot, SummaryStore, Upsert};
