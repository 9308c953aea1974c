//! SQLite 持久记忆（rusqlite，同步）
//!
//! 表 memory_records(id, content, source, embedding, created_at)，embedding 以 JSON 数组存储。

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::core::AgentError;
use crate::memory::{MemoryRecord, MemoryScope, PersistentMemory};

pub struct SqliteMemory {
    conn: Mutex<Connection>,
}

impl SqliteMemory {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self, AgentError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS memory_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                embedding TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl PersistentMemory for SqliteMemory {
    fn append(&self, record: &MemoryRecord) -> Result<(), AgentError> {
        let embedding = record
            .embedding
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| unavailable(e.to_string()))?;
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO memory_records (id, content, source, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.content,
                record.source,
                embedding,
                record.created_at.to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<MemoryRecord>, AgentError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn
            .prepare("SELECT id, content, source, embedding, created_at FROM memory_records ORDER BY seq")
            .map_err(db_err)?;
        let rows = stmt.query_map([], read_record).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn recent(&self, limit: usize) -> Result<Vec<MemoryRecord>, AgentError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn
            .prepare(
                "SELECT id, content, source, embedding, created_at FROM (
                    SELECT seq, id, content, source, embedding, created_at
                    FROM memory_records ORDER BY seq DESC LIMIT ?1
                 ) ORDER BY seq",
            )
            .map_err(db_err)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], read_record).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn clear(&self) -> Result<(), AgentError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM memory_records", []).map_err(db_err)?;
        Ok(())
    }
}

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let embedding: Option<String> = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        scope: MemoryScope::Persistent,
        content: row.get(1)?,
        source: row.get(2)?,
        embedding: embedding.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn db_err(e: rusqlite::Error) -> AgentError {
    unavailable(e.to_string())
}

fn unavailable(msg: String) -> AgentError {
    AgentError::MemoryUnavailable(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_read_back_in_order() {
        let db = SqliteMemory::in_memory().unwrap();
        db.append(&MemoryRecord::new(MemoryScope::Persistent, "first", "test")).unwrap();
        db.append(
            &MemoryRecord::new(MemoryScope::Persistent, "second", "test").with_embedding(Some(vec![0.5, 0.25])),
        )
        .unwrap();
        let records = db.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, "first");
        assert_eq!(records[1].embedding, Some(vec![0.5, 0.25]));
        db.clear().unwrap();
        assert!(db.records().unwrap().is_empty());
    }

    #[test]
    fn test_recent_keeps_newest_in_insertion_order() {
        let db = SqliteMemory::in_memory().unwrap();
        for i in 0..5 {
            db.append(&MemoryRecord::new(MemoryScope::Persistent, format!("fact {i}"), "test")).unwrap();
        }
        let recent: Vec<_> = db.recent(2).unwrap().into_iter().map(|r| r.content).collect();
        assert_eq!(recent, vec!["fact 3", "fact 4"]);
        assert_eq!(db.recent(10).unwrap().len(), 5);
        assert!(db.recent(0).unwrap().is_empty());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/memory.db");
        {
            let db = SqliteMemory::open(&path).unwrap();
            db.append(&MemoryRecord::new(MemoryScope::Persistent, "用户偏好 Rust", "test")).unwrap();
        }
        let db = SqliteMemory::open(&path).unwrap();
        assert_eq!(db.records().unwrap()[0].content, "用户偏好 Rust");
    }
}
