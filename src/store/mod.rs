//! Persistence layer: libSQL-backed conversation records.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ConversationEvent, ConversationRecord, ConversationStore, EventKind, RecordStatus};
