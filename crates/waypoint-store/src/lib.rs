pub mod audit;
pub mod conversation;
pub mod memory;
pub mod sqlite;

pub use audit::JsonlAuditSink;
pub use conversation::MemoryConversationStore;
pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;
