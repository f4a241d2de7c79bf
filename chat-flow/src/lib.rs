pub mod agent;
pub mod error;
pub mod events;
pub mod gate;
pub mod runner;
pub mod session;
pub mod storage;
pub mod streaming;
pub mod table;
pub mod upload;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use agent::{AgentError, AgentRequest, TableAgent};
pub use error::{ChatError, Result};
pub use events::{DEFAULT_EVENT_CAPACITY, EventPublisher, SessionEvent};
pub use gate::PreconditionError;
pub use runner::{TurnOutcome, TurnRunner, TurnSettings};
pub use session::{ChatTurn, Session, SessionHandle, SessionSnapshot, TurnPermit, TurnPhase};
pub use storage::{InMemorySessionStorage, SessionStorage};
pub use streaming::{AnswerChunks, StreamGranularity};
pub use table::{Table, TableError, TableLoadError};
pub use upload::{UPLOAD_CONFIRMATION, UploadReceiver};
