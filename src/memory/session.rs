//! 会话数据模型：Session 与不可变的 Turn 序列

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Action, ToolResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Agent,
    Tool,
}

/// Turn 内容：纯文本、结构化动作或工具结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum TurnContent {
    Text(String),
    Action(Action),
    ToolResult(ToolResult),
}

/// 生成耗时与 token 计数（来自 GenerationEvent::Done）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnTiming {
    pub elapsed_ms: u64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// 一轮对话；追加后不可变
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: TurnRole,
    pub content: TurnContent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TurnTiming>,
}

impl Turn {
    fn new(role: TurnRole, content: TurnContent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now(),
            timing: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(TurnRole::User, TurnContent::Text(text.into()))
    }

    pub fn agent(action: Action, timing: Option<TurnTiming>) -> Self {
        let mut turn = Self::new(TurnRole::Agent, TurnContent::Action(action));
        turn.timing = timing;
        turn
    }

    pub fn tool(result: ToolResult) -> Self {
        Self::new(TurnRole::Tool, TurnContent::ToolResult(result))
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self.content, TurnContent::Action(Action::ToolCall(_)))
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self.content, TurnContent::ToolResult(_))
    }

    /// 供 prompt 使用的单行文本
    pub fn render(&self) -> String {
        match &self.content {
            TurnContent::Text(t) => format!("User: {t}"),
            TurnContent::Action(Action::FinalAnswer { text }) => format!("Assistant: {text}"),
            TurnContent::Action(Action::ToolCall(call)) => format!(
                "Assistant called tool `{}` (id {}) with {}",
                call.tool,
                call.call_id,
                serde_json::Value::Object(call.args.clone())
            ),
            TurnContent::Action(Action::Continue { note }) => format!("Assistant (thinking): {note}"),
            TurnContent::ToolResult(r) => format!(
                "Tool `{}` (id {}) -> {:?}{}:\n{}",
                r.tool,
                r.call_id,
                r.status,
                if r.truncated { ", truncated" } else { "" },
                r.payload.as_text()
            ),
        }
    }
}

/// 会话：由一个循环实例独占
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub turns: Vec<Turn>,
    /// 创建时的活跃后端名
    pub backend: Option<String>,
    pub auto_approve: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(backend: Option<String>, auto_approve: bool) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            turns: Vec::new(),
            backend,
            auto_approve,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.updated_at = turn.timestamp;
        self.turns.push(turn);
    }

    /// 最近 n 个 Turn（按时间顺序）
    pub fn recent(&self, n: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    pub fn tool_call_count(&self) -> usize {
        self.turns.iter().filter(|t| t.is_tool_call()).count()
    }

    pub fn tool_result_count(&self) -> usize {
        self.turns.iter().filter(|t| t.is_tool_result()).count()
    }
}
