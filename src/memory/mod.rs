//! 记忆层：向量上下文库与任务记录持久化

pub mod records;
pub mod store;

pub use records::{InMemoryTaskRecords, SqliteTaskRecords, TaskRecord, TaskRecordStore};
pub use store::{chunk_text, ContextItem, MemoryError, MemoryStore, NoopMemory, VectorMemory};
