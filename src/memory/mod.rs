//! 记忆层：有界对话历史与归档、摘要、分词、按用户隔离、持久化与会话上下文

pub mod conversation;
pub mod persistence;
pub mod registry;
pub mod schema;
pub mod session_context;
pub mod summarizer;
pub mod tokenizer;

pub use conversation::{ArchiveEntry, ConversationEntry, ConversationMemory, MemoryLimits, MemorySnapshot};
pub use persistence::{InMemoryStore, JsonFileStore, MemoryStore};
pub use registry::{MemoryRegistry, SharedMemory};
pub use session_context::SessionContext;
pub use summarizer::{ArchiveDigest, KeywordSummarizer, Summarizer};
