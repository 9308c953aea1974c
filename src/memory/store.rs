//! 两级记忆：会话记忆 + 持久记忆，统一检索接口
//!
//! 两个存储物理分离；retrieve 同时查询二者并按 相关度 + 0.05·新近度 合并排序。
//! 持久存储不可用只影响持久部分，会话操作永不阻塞、永不失败。
//! SQLite 查询与会话文件写入都在 spawn_blocking 中执行，不占用运行时工作线程。

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::{Action, AgentError, ToolStatus};
use crate::llm::EmbeddingProvider;
use crate::memory::tokenizer::{cosine_similarity, jaccard_similarity, tokenize_to_set};
use crate::memory::{
    MemoryRecord, MemoryScope, PersistentMemory, RecallScope, Session, SessionStore, Turn, TurnContent,
};

const RECENCY_WEIGHT: f32 = 0.05;
const SALIENT_MAX_CHARS: usize = 1000;
/// 每次检索最多扫描的持久条目数（取最新的）
const PERSISTENT_SCAN_LIMIT: usize = 2000;

/// 单个循环实例独占的记忆视图
pub struct MemoryStore {
    session: Session,
    session_records: Vec<MemoryRecord>,
    persistent: Option<Arc<dyn PersistentMemory>>,
    sessions: Option<SessionStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl MemoryStore {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            session_records: Vec::new(),
            persistent: None,
            sessions: None,
            embedder: None,
        }
    }

    pub fn with_persistent(mut self, persistent: Option<Arc<dyn PersistentMemory>>) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_session_store(mut self, sessions: SessionStore) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        self.embedder = embedder;
        self
    }

    /// 从会话文件恢复；会话级记忆条目由已保存的 Turn 重建
    pub fn load(sessions: SessionStore, session_id: &str) -> Result<Self, AgentError> {
        let mut session = sessions.load(session_id)?;
        let turns = std::mem::take(&mut session.turns);
        let updated_at = session.updated_at;
        let mut store = Self::new(session).with_session_store(sessions);
        for turn in turns {
            store.append(turn);
        }
        store.session.updated_at = updated_at;
        Ok(store)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// 追加 Turn（O(1) 摊销，永不失败）；有价值的内容同时写入会话记忆
    pub fn append(&mut self, turn: Turn) {
        if let Some(text) = salient_text(&turn) {
            let source = format!("session:{}/turn:{}", self.session.id, turn.id);
            self.session_records
                .push(MemoryRecord::new(MemoryScope::Session, text, source));
        }
        self.session.push(turn);
    }

    /// 直接写入一条会话记忆
    pub fn note(&mut self, content: impl Into<String>, source: impl Into<String>) {
        self.session_records
            .push(MemoryRecord::new(MemoryScope::Session, content, source));
    }

    /// 写入持久记忆（只追加）；配置了嵌入提供方时附带向量
    pub async fn remember(&self, content: &str, source: &str) -> Result<(), AgentError> {
        let persistent = self
            .persistent
            .as_ref()
            .ok_or_else(|| AgentError::MemoryUnavailable("no persistent store configured".into()))?;
        let embedding = self.embed(content).await;
        let record = MemoryRecord::new(MemoryScope::Persistent, content, source).with_embedding(embedding);
        let persistent = persistent.clone();
        run_blocking(move || persistent.append(&record)).await
    }

    /// 检索最相关的至多 k 条；从不报错，持久存储不可用时只返回会话部分
    pub async fn retrieve(&self, query: &str, scope: RecallScope, k: usize) -> Vec<MemoryRecord> {
        if k == 0 {
            return Vec::new();
        }
        let mut candidates = Vec::new();
        if scope.includes(MemoryScope::Session) {
            candidates.extend(with_recency(self.session_records.clone()));
        }
        if scope.includes(MemoryScope::Persistent) {
            if let Some(persistent) = self.persistent.clone() {
                match run_blocking(move || persistent.recent(PERSISTENT_SCAN_LIMIT)).await {
                    Ok(records) => candidates.extend(with_recency(records)),
                    Err(e) => tracing::warn!(error = %e, "persistent memory unavailable, using session memory only"),
                }
            }
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        let query_tokens = tokenize_to_set(query);
        let query_embedding = if candidates.iter().any(|(r, _)| r.embedding.is_some()) {
            self.embed(query).await
        } else {
            None
        };
        let lexical_query = !query_tokens.is_empty();

        let mut scored: Vec<(f32, MemoryRecord)> = candidates
            .into_iter()
            .filter_map(|(record, recency)| {
                let relevance = match (&query_embedding, &record.embedding) {
                    (Some(q), Some(e)) => cosine_similarity(q, e).max(0.0),
                    _ => jaccard_similarity(&query_tokens, &tokenize_to_set(&record.content)),
                };
                if relevance <= 0.0 && (lexical_query || query_embedding.is_some()) {
                    return None;
                }
                Some((relevance + RECENCY_WEIGHT * recency, record))
            })
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| scope_rank(a.scope).cmp(&scope_rank(b.scope)))
        });
        scored.into_iter().take(k).map(|(_, r)| r).collect()
    }

    /// 保存当前会话（保存的是调用时刻的快照）
    pub async fn persist(&self) -> Result<PathBuf, AgentError> {
        let sessions = self
            .sessions
            .clone()
            .ok_or_else(|| AgentError::MemoryUnavailable("no session directory configured".into()))?;
        let session = self.session.clone();
        run_blocking(move || sessions.save(&session)).await
    }

    /// 清除指定范围的记忆条目（会话的 Turn 历史不受影响）
    pub async fn forget(&mut self, scope: RecallScope) -> Result<(), AgentError> {
        if scope.includes(MemoryScope::Session) {
            self.session_records.clear();
        }
        if scope.includes(MemoryScope::Persistent) {
            if let Some(persistent) = self.persistent.clone() {
                run_blocking(move || persistent.clear()).await?;
            }
        }
        Ok(())
    }

    pub fn session_record_count(&self) -> usize {
        self.session_records.len()
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(text).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "embedding failed, falling back to lexical ranking");
                None
            }
        }
    }
}

/// 在 spawn_blocking 中执行同步存储操作
async fn run_blocking<T, F>(op: F) -> Result<T, AgentError>
where
    F: FnOnce() -> Result<T, AgentError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| AgentError::MemoryUnavailable(format!("storage task failed: {e}")))?
}

/// 新近度 ∈ [0,1]，按插入顺序线性分布
fn with_recency(records: Vec<MemoryRecord>) -> impl Iterator<Item = (MemoryRecord, f32)> {
    let n = records.len();
    records.into_iter().enumerate().map(move |(i, r)| {
        let recency = if n <= 1 { 1.0 } else { i as f32 / (n - 1) as f32 };
        (r, recency)
    })
}

fn scope_rank(scope: MemoryScope) -> u8 {
    match scope {
        MemoryScope::Session => 0,
        MemoryScope::Persistent => 1,
    }
}

/// 值得写入会话记忆的内容：用户输入、最终答案、成功的工具输出
pub fn salient_text(turn: &Turn) -> Option<String> {
    let text = match &turn.content {
        TurnContent::Text(t) => t.clone(),
        TurnContent::Action(Action::FinalAnswer { text }) => text.clone(),
        TurnContent::ToolResult(r) if r.status == ToolStatus::Success => {
            format!("{} output: {}", r.tool, r.payload.as_text())
        }
        _ => return None,
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.chars().take(SALIENT_MAX_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    use crate::memory::SqliteMemory;

    struct BrokenStore;

    impl PersistentMemory for BrokenStore {
        fn append(&self, _record: &MemoryRecord) -> Result<(), AgentError> {
            Err(AgentError::MemoryUnavailable("disk gone".into()))
        }
        fn records(&self) -> Result<Vec<MemoryRecord>, AgentError> {
            Err(AgentError::MemoryUnavailable("disk gone".into()))
        }
        fn clear(&self) -> Result<(), AgentError> {
            Err(AgentError::MemoryUnavailable("disk gone".into()))
        }
    }

    #[tokio::test]
    async fn test_retrieve_empty_store_returns_empty() {
        let store = MemoryStore::new(Session::new(None, false));
        assert!(store.retrieve("anything", RecallScope::All, 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_never_exceeds_k_and_ranks_by_overlap() {
        let mut store = MemoryStore::new(Session::new(None, false));
        store.note("rust borrow checker rules", "t");
        store.note("python list comprehension", "t");
        store.note("rust async runtime tokio", "t");
        store.note("rust ownership model", "t");
        let hits = store.retrieve("rust tokio", RecallScope::Session, 2).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "rust async runtime tokio");
        assert!(hits.iter().all(|r| r.content.contains("rust")));
    }

    #[tokio::test]
    async fn test_tokenless_query_returns_most_recent() {
        let mut store = MemoryStore::new(Session::new(None, false));
        store.note("older fact", "t");
        store.note("newer fact", "t");
        let hits = store.retrieve("?", RecallScope::Session, 1).await;
        assert_eq!(hits[0].content, "newer fact");
    }

    #[tokio::test]
    async fn test_persistent_failure_degrades_to_session() {
        let mut store = MemoryStore::new(Session::new(None, false))
            .with_persistent(Some(Arc::new(BrokenStore)));
        store.append(Turn::user("deploy the rust service"));
        let hits = store.retrieve("rust service", RecallScope::All, 5).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].scope, MemoryScope::Session);
        assert!(matches!(
            store.remember("x", "t").await,
            Err(AgentError::MemoryUnavailable(_))
        ));
    }

    struct SlowStore;

    impl PersistentMemory for SlowStore {
        fn append(&self, _record: &MemoryRecord) -> Result<(), AgentError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }
        fn records(&self) -> Result<Vec<MemoryRecord>, AgentError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(vec![MemoryRecord::new(MemoryScope::Persistent, "slow disk fact", "t")])
        }
        fn clear(&self) -> Result<(), AgentError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_persistent_store_does_not_stall_runtime() {
        // 单线程运行时：存储调用若占用工作线程，计时任务就无法推进
        let store = MemoryStore::new(Session::new(None, false)).with_persistent(Some(Arc::new(SlowStore)));
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            }
        });

        let hits = store.retrieve("slow disk", RecallScope::Persistent, 3).await;
        assert_eq!(hits.len(), 1);
        store.remember("another fact", "t").await.unwrap();
        ticker.abort();
        assert!(ticks.load(AtomicOrdering::SeqCst) >= 10);
    }

    #[tokio::test]
    async fn test_persist_writes_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store =
            MemoryStore::new(Session::new(None, false)).with_session_store(SessionStore::new(dir.path()));
        store.append(Turn::user("save me"));
        let path = store.persist().await.unwrap();
        assert!(path.exists());
        assert!(matches!(
            MemoryStore::new(Session::new(None, false)).persist().await,
            Err(AgentError::MemoryUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_merge_session_and_persistent() {
        let db: Arc<dyn PersistentMemory> = Arc::new(SqliteMemory::in_memory().unwrap());
        let mut store = MemoryStore::new(Session::new(None, false)).with_persistent(Some(db));
        store.remember("project uses sqlite for storage", "test").await.unwrap();
        store.note("user asked about sqlite storage", "t");
        let hits = store.retrieve("sqlite storage", RecallScope::All, 5).await;
        assert_eq!(hits.len(), 2);

        let persistent_only = store.retrieve("sqlite", RecallScope::Persistent, 5).await;
        assert_eq!(persistent_only.len(), 1);
        assert_eq!(persistent_only[0].scope, MemoryScope::Persistent);

        store.forget(RecallScope::Session).await.unwrap();
        assert_eq!(store.retrieve("sqlite", RecallScope::All, 5).await.len(), 1);
        store.forget(RecallScope::Persistent).await.unwrap();
        assert!(store.retrieve("sqlite", RecallScope::All, 5).await.is_empty());
    }
}
