//! 动作与工具结果：循环、工具层与记忆层共享的数据模型

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 模型提出的下一步
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    FinalAnswer { text: String },
    ToolCall(ToolCall),
    /// 继续规划（思考中 / 输出无法解析）；note 会回填给下一轮
    Continue { note: String },
}

/// 一次工具调用；call_id 用于与 ToolResult 关联
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            call_id: uuid::Uuid::new_v4().to_string(),
            tool: tool.into(),
            args,
        }
    }

    /// 从 json!({...}) 构造，非对象参数按空映射处理
    pub fn from_value(tool: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(tool, args)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

/// 工具输出：文本、字节或结构化 JSON
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ToolPayload {
    Text(String),
    Bytes(Vec<u8>),
    Structured(Value),
}

impl ToolPayload {
    /// 供 prompt 与日志使用的文本形式
    pub fn as_text(&self) -> String {
        match self {
            ToolPayload::Text(s) => s.clone(),
            ToolPayload::Bytes(b) => format!("<{} bytes of binary output>", b.len()),
            ToolPayload::Structured(v) => v.to_string(),
        }
    }
}

impl From<String> for ToolPayload {
    fn from(s: String) -> Self {
        ToolPayload::Text(s)
    }
}

impl From<&str> for ToolPayload {
    fn from(s: &str) -> Self {
        ToolPayload::Text(s.to_string())
    }
}

impl From<Value> for ToolPayload {
    fn from(v: Value) -> Self {
        ToolPayload::Structured(v)
    }
}

/// 一次工具执行的终态结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    pub status: ToolStatus,
    pub payload: ToolPayload,
    pub elapsed_ms: u64,
    /// 输出超过上限被截断
    #[serde(default)]
    pub truncated: bool,
}

impl ToolResult {
    pub fn failure(call: &ToolCall, status: ToolStatus, reason: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool: call.tool.clone(),
            status,
            payload: ToolPayload::Text(reason.into()),
            elapsed_ms,
            truncated: false,
        }
    }

    pub fn cancelled(call: &ToolCall, elapsed_ms: u64) -> Self {
        Self::failure(call, ToolStatus::Cancelled, "cancelled", elapsed_ms)
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_ids_are_unique() {
        let a = ToolCall::from_value("shell", serde_json::json!({"cmd": "ls"}));
        let b = ToolCall::from_value("shell", serde_json::json!({"cmd": "ls"}));
        assert_ne!(a.call_id, b.call_id);
        assert_eq!(a.args.get("cmd").and_then(|v| v.as_str()), Some("ls"));
    }

    #[test]
    fn test_payload_text_forms() {
        assert_eq!(ToolPayload::from("a.txt").as_text(), "a.txt");
        assert_eq!(ToolPayload::Bytes(vec![1, 2, 3]).as_text(), "<3 bytes of binary output>");
        assert_eq!(ToolPayload::from(serde_json::json!({"ok": true})).as_text(), r#"{"ok":true}"#);
    }
}
