//! 记忆存储：会话保存/恢复、SQLite 持久记忆、跨范围检索

use std::sync::Arc;

use serde_json::json;

use orby::core::{Action, AgentError, ToolCall, ToolPayload, ToolResult, ToolStatus};
use orby::memory::{
    MemoryScope, MemoryStore, PersistentMemory, RecallScope, Session, SessionStore, SqliteMemory, Turn,
    TurnContent, TurnTiming,
};

fn sample_session() -> Session {
    let mut session = Session::new(Some("ollama".into()), false);
    session.push(Turn::user("列出文件，然后总结 README\n  (keep   spacing)\t"));
    let call = ToolCall::from_value("shell", json!({"cmd": "ls -la", "limit": 3}));
    session.push(Turn::agent(
        Action::ToolCall(call.clone()),
        Some(TurnTiming {
            elapsed_ms: 812,
            prompt_tokens: Some(240),
            completion_tokens: Some(19),
        }),
    ));
    session.push(Turn::tool(ToolResult {
        call_id: call.call_id.clone(),
        tool: "shell".into(),
        status: ToolStatus::Success,
        payload: ToolPayload::Text("README.md\nsrc/\n\u{1F980} crab.txt\n".into()),
        elapsed_ms: 12,
        truncated: true,
    }));
    session.push(Turn::tool(ToolResult {
        call_id: "bin".into(),
        tool: "cat".into(),
        status: ToolStatus::Success,
        payload: ToolPayload::Bytes(vec![0, 159, 146, 150]),
        elapsed_ms: 1,
        truncated: false,
    }));
    session.push(Turn::agent(
        Action::FinalAnswer {
            text: "Done: README describes \"orby\".".into(),
        },
        None,
    ));
    session
}

#[test]
fn test_session_save_load_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("sessions"));
    let session = sample_session();

    store.save(&session).unwrap();
    let loaded = store.load(&session.id).unwrap();

    assert_eq!(loaded, session);
    for (a, b) in loaded.turns.iter().zip(&session.turns) {
        if let (TurnContent::Text(x), TurnContent::Text(y)) = (&a.content, &b.content) {
            assert_eq!(x.as_bytes(), y.as_bytes());
        }
    }
}

#[test]
fn test_session_ids_cannot_escape_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    assert!(matches!(store.load("../etc/passwd"), Err(AgentError::MemoryUnavailable(_))));
    assert!(store.delete("a/b").is_err());
    assert!(!store.delete("missing").unwrap());
}

#[tokio::test]
async fn test_memory_store_load_restores_turns_and_records() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = SessionStore::new(dir.path());
    let mut store = MemoryStore::new(Session::new(None, true)).with_session_store(sessions.clone());
    for turn in sample_session().turns {
        store.append(turn);
    }
    store.persist().await.unwrap();
    let id = store.session_id().to_string();

    let restored = MemoryStore::load(sessions, &id).unwrap();
    assert_eq!(restored.session(), store.session());
    assert_eq!(restored.session_record_count(), store.session_record_count());
    let hits = restored.retrieve("README", RecallScope::Session, 5).await;
    assert!(!hits.is_empty());
    assert!(hits.len() <= 5);
}

#[tokio::test]
async fn test_persistent_memory_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("mem").join("memory.db");
    {
        let sqlite: Arc<dyn PersistentMemory> = Arc::new(SqliteMemory::open(&db).unwrap());
        let store = MemoryStore::new(Session::new(None, false)).with_persistent(Some(sqlite));
        store.remember("the deploy script lives in scripts/deploy.sh", "test").await.unwrap();
        store.remember("用户喜欢简洁的中文回答", "test").await.unwrap();
    }

    let sqlite: Arc<dyn PersistentMemory> = Arc::new(SqliteMemory::open(&db).unwrap());
    let mut store = MemoryStore::new(Session::new(None, false)).with_persistent(Some(sqlite.clone()));
    let hits = store.retrieve("where is the deploy script", RecallScope::Persistent, 3).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].scope, MemoryScope::Persistent);
    assert!(hits[0].content.contains("scripts/deploy.sh"));

    let hits = store.retrieve("中文回答", RecallScope::All, 3).await;
    assert_eq!(hits.len(), 1);

    store.forget(RecallScope::Persistent).await.unwrap();
    assert!(sqlite.records().unwrap().is_empty());
    assert!(store.retrieve("deploy", RecallScope::All, 3).await.is_empty());
}

#[tokio::test]
async fn test_retrieve_merges_scopes_and_respects_k() {
    let sqlite: Arc<dyn PersistentMemory> = Arc::new(SqliteMemory::in_memory().unwrap());
    let mut store = MemoryStore::new(Session::new(None, false)).with_persistent(Some(sqlite));
    store.remember("cargo test runs the rust test suite", "p").await.unwrap();
    store.note("cargo build compiles rust code", "s");
    store.note("unrelated grocery list", "s");

    let hits = store.retrieve("rust cargo", RecallScope::All, 5).await;
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().any(|r| r.scope == MemoryScope::Session));
    assert!(hits.iter().any(|r| r.scope == MemoryScope::Persistent));

    assert_eq!(store.retrieve("rust cargo", RecallScope::All, 1).await.len(), 1);
    assert!(store.retrieve("rust", RecallScope::All, 0).await.is_empty());

    // 会话记忆清除不影响持久记忆
    store.forget(RecallScope::Session).await.unwrap();
    let hits = store.retrieve("rust cargo", RecallScope::All, 5).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].scope, MemoryScope::Persistent);
}
