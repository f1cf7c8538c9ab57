//! Support email pipeline.
//!
//! Every inbound email flows through:
//! 1. `Classifier::classify()`: one LLM call, structured classification
//! 2. `KnowledgeRetriever::retrieve()`: top-k knowledge chunks
//! 3. `Drafter::draft()`: one LLM call, post-processed reply
//! 4. `route()`: pure auto-send / escalate decision
//! 5. `Dispatcher`: reply, or holding reply + admin notification
//! 6. `ConversationStore::upsert()`: full record keyed by email id

pub mod classifier;
pub mod drafter;
pub mod inbox;
pub mod processor;
pub mod router;
pub mod types;

pub use classifier::Classifier;
pub use drafter::Drafter;
pub use inbox::{InboxWorker, PollSummary};
pub use processor::{BatchOutcome, EmailPipeline};
pub use router::route;
