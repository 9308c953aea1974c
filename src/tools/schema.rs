//! 动作格式 JSON Schema 生成（schemars）
//!
//! 注入 system prompt，约束模型输出合法的工具调用或最终答案。

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

/// 工具调用：`{"tool": "...", "args": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须是清单中列出的工具之一
    tool: String,
    /// 工具参数，按该工具的 parameters schema 填写
    args: Map<String, Value>,
}

/// 最终答案：`{"final_answer": "..."}`
#[allow(dead_code)]
#[derive(JsonSchema)]
struct FinalAnswerFormat {
    final_answer: String,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
#[serde(untagged)]
enum ActionFormat {
    ToolCall(ToolCallFormat),
    FinalAnswer(FinalAnswerFormat),
}

/// 返回动作格式的 JSON Schema 字符串，可拼入 system prompt
pub fn action_schema_json() -> String {
    let schema = schema_for!(ActionFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mentions_both_shapes() {
        let s = action_schema_json();
        assert!(s.contains("\"tool\""));
        assert!(s.contains("\"args\""));
        assert!(s.contains("\"final_answer\""));
    }
}
