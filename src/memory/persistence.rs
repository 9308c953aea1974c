//! 会话持久化
//!
//! 每个会话一个 JSON 文件（`<session_dir>/<id>.json`），保存/加载后 Turn 序列逐字节一致。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::core::AgentError;
use crate::memory::Session;

/// 已保存会话的摘要（列表展示用）
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub turns: usize,
    pub updated_at: DateTime<Utc>,
}

/// 会话文件存储
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 会话 id 只允许字母数字、`-`、`_`，防止路径穿越
    fn path_for(&self, id: &str) -> Result<PathBuf, AgentError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AgentError::MemoryUnavailable(format!("invalid session id: {id}")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// 写入会话；父目录不存在时自动创建
    pub fn save(&self, session: &Session) -> Result<PathBuf, AgentError> {
        let path = self.path_for(&session.id)?;
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let data = serde_json::to_string_pretty(session)
            .map_err(|e| AgentError::MemoryUnavailable(e.to_string()))?;
        // 先写临时文件再改名，避免半写文件
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(io_err)?;
        std::fs::rename(&tmp, &path).map_err(io_err)?;
        tracing::debug!(session = %session.id, turns = session.turns.len(), "session saved");
        Ok(path)
    }

    pub fn load(&self, id: &str) -> Result<Session, AgentError> {
        let path = self.path_for(id)?;
        let data = std::fs::read_to_string(&path).map_err(io_err)?;
        serde_json::from_str(&data)
            .map_err(|e| AgentError::MemoryUnavailable(format!("corrupt session {id}: {e}")))
    }

    /// 列出已保存会话，按最近更新时间倒序；目录不存在时为空
    pub fn list(&self) -> Result<Vec<SessionSummary>, AgentError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(id) {
                Ok(session) => out.push(SessionSummary {
                    id: session.id,
                    turns: session.turns.len(),
                    updated_at: session.updated_at,
                }),
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "skipping unreadable session"),
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    /// 删除会话文件；返回是否确实删除了文件
    pub fn delete(&self, id: &str) -> Result<bool, AgentError> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).map_err(io_err)?;
        Ok(true)
    }
}

fn io_err(e: std::io::Error) -> AgentError {
    AgentError::MemoryUnavailable(e.to_string())
}
