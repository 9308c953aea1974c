//! 记忆层：会话（Turn 序列 + 会话级条目）、持久（SQLite）、会话文件、统一检索

pub mod long_term;
pub mod persistence;
pub mod session;
pub mod sqlite;
pub mod store;
pub mod tokenizer;

pub use long_term::{MemoryRecord, MemoryScope, PersistentMemory, RecallScope};
pub use persistence::{SessionStore, SessionSummary};
pub use session::{Session, Turn, TurnContent, TurnRole, TurnTiming};
pub use sqlite::SqliteMemory;
pub use store::{salient_text, MemoryStore};
