//! 记忆条目与持久记忆抽象
//!
//! 会话记忆随 Session 消亡；持久记忆跨进程存活，对循环而言只追加。
//! 持久存储不可用时返回 MemoryUnavailable，由 MemoryStore 降级为空结果。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 记忆条目所属层级
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Session,
    Persistent,
}

/// 检索 / 清除范围
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecallScope {
    Session,
    Persistent,
    All,
}

impl RecallScope {
    pub fn includes(self, scope: MemoryScope) -> bool {
        match self {
            RecallScope::All => true,
            RecallScope::Session => scope == MemoryScope::Session,
            RecallScope::Persistent => scope == MemoryScope::Persistent,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub scope: MemoryScope,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// 来源引用，如 "session:<id>/tool:shell"
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(scope: MemoryScope, content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            scope,
            content: content.into(),
            embedding: None,
            source: source.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_embedding(mut self, embedding: Option<Vec<f32>>) -> Self {
        self.embedding = embedding.filter(|v| !v.is_empty());
        self
    }
}

/// 持久记忆后端：只追加、按插入顺序读出、整体清除
pub trait PersistentMemory: Send + Sync {
    fn append(&self, record: &MemoryRecord) -> Result<(), AgentError>;

    /// 全部条目，按插入顺序（旧 → 新）
    fn records(&self) -> Result<Vec<MemoryRecord>, AgentError>;

    /// 最新的至多 limit 条，仍按插入顺序
    fn recent(&self, limit: usize) -> Result<Vec<MemoryRecord>, AgentError> {
        let mut records = self.records()?;
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
        Ok(records)
    }

    fn clear(&self) -> Result<(), AgentError>;
}
