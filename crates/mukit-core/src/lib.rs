pub mod entry;
pub mod errors;
pub mod ids;
pub mod status;
pub mod transport;

pub use entry::{Entry, InboundMessage, TimeOfDay};
pub use errors::TransportError;
pub use ids::{ChatId, MessageId};
pub use status::{ChatStatus, EngineStatus, ReconcileResult, StatusSource};
pub use transport::ChatTransport;
