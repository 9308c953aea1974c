//! Planner：prompt 组装与动作解析
//!
//! build_messages 拼出 system（工具清单 + 动作格式 + 检索到的记忆）、最近 Turn 窗口与目标；
//! parse_action 从模型文本中提取 JSON 动作，非 JSON 文本视为最终答案。

use serde_json::{Map, Value};

use crate::core::{Action, ToolCall};
use crate::llm::ChatMessage;
use crate::memory::{MemoryRecord, Turn, TurnRole};
use crate::tools::{action_schema_json, ToolManifestEntry};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Orby, a local assistant that completes the user's goal step by step. \
Each reply must be exactly one action: either call one tool, or give the final answer.";

/// 解析失败时写回给模型的纠正提示
pub const CORRECTIVE_NOTE: &str =
    "Your last reply was not a valid action. Reply with a single JSON object: {\"tool\": ..., \"args\": {...}} or {\"final_answer\": \"...\"}.";

pub struct Planner {
    system_prompt: String,
    context_window: usize,
}

impl Planner {
    pub fn new(system_prompt: Option<&str>, context_window: usize) -> Self {
        Self {
            system_prompt: system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string(),
            context_window: context_window.max(1),
        }
    }

    /// 组装完整 system prompt
    pub fn system_prompt(&self, tools: &[ToolManifestEntry], memories: &[MemoryRecord]) -> String {
        let mut out = self.system_prompt.clone();
        out.push_str("\n\n## Tools\n");
        if tools.is_empty() {
            out.push_str("(no tools available)\n");
        }
        for tool in tools {
            out.push_str(&format!(
                "- {} [{}; timeout {}s]: {}\n  parameters: {}\n",
                tool.name,
                serde_json::to_value(tool.capability)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default(),
                tool.timeout_secs,
                tool.description,
                tool.parameters
            ));
        }
        out.push_str("\n## Action format\nReply with one JSON object matching this schema:\n");
        out.push_str(&action_schema_json());
        if !memories.is_empty() {
            out.push_str("\n\n## Relevant memory\n");
            for m in memories {
                out.push_str(&format!("- {}\n", m.content));
            }
        }
        out
    }

    /// system + 最近窗口内的 Turn；目标已作为 user Turn 位于窗口中
    pub fn build_messages(
        &self,
        goal: &str,
        recent: &[Turn],
        tools: &[ToolManifestEntry],
        memories: &[MemoryRecord],
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_prompt(tools, memories))];
        let window = &recent[recent.len().saturating_sub(self.context_window)..];
        let mut saw_goal = false;
        for turn in window {
            let text = turn.render();
            match turn.role {
                TurnRole::User => {
                    saw_goal = true;
                    messages.push(ChatMessage::user(strip_prefix(&text, "User: ")));
                }
                TurnRole::Agent => messages.push(ChatMessage::assistant(text)),
                TurnRole::Tool => messages.push(ChatMessage::user(text)),
            }
        }
        // 窗口把目标挤出时，在末尾重申目标
        if !saw_goal {
            messages.push(ChatMessage::user(format!("Goal: {goal}")));
        }
        messages
    }
}

fn strip_prefix<'a>(s: &'a str, prefix: &str) -> &'a str {
    s.strip_prefix(prefix).unwrap_or(s)
}

/// 提取 JSON 片段：```json 代码块优先，其次首个 { 到最后一个 }
fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// 将模型输出解析为动作
///
/// - `{"tool": "...", "args": {...}}` → ToolCall
/// - `{"final_answer": "..."}` / `{"answer": "..."}` → FinalAnswer
/// - `{"action": "continue", "note": "..."}` → Continue
/// - 无法解析的 JSON → Continue（带纠正提示）
/// - 不含 JSON 的纯文本 → FinalAnswer
pub fn parse_action(output: &str) -> Action {
    let trimmed = output.trim();
    let Some(json) = extract_json(trimmed) else {
        return Action::FinalAnswer {
            text: trimmed.to_string(),
        };
    };
    let value: Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "action JSON malformed");
            return Action::Continue {
                note: CORRECTIVE_NOTE.to_string(),
            };
        }
    };
    let Some(obj) = value.as_object() else {
        return Action::Continue {
            note: CORRECTIVE_NOTE.to_string(),
        };
    };

    if let Some(tool) = obj.get("tool").and_then(|v| v.as_str()).filter(|t| !t.is_empty()) {
        let args = match obj.get("args") {
            Some(Value::Object(m)) => m.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                let mut m = Map::new();
                m.insert("input".into(), other.clone());
                m
            }
        };
        return Action::ToolCall(ToolCall::new(tool, args));
    }
    for key in ["final_answer", "answer"] {
        if let Some(text) = obj.get(key).and_then(|v| v.as_str()) {
            return Action::FinalAnswer {
                text: text.to_string(),
            };
        }
    }
    if obj.get("action").and_then(|v| v.as_str()) == Some("continue") {
        let note = obj
            .get("note")
            .and_then(|v| v.as_str())
            .unwrap_or("continue")
            .to_string();
        return Action::Continue { note };
    }
    Action::Continue {
        note: CORRECTIVE_NOTE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryScope;
    use crate::tools::Capability;

    #[test]
    fn test_parse_tool_call_in_code_block() {
        let out = "I will list files.\n```json\n{\"tool\": \"shell\", \"args\": {\"cmd\": \"ls\"}}\n```";
        match parse_action(out) {
            Action::ToolCall(call) => {
                assert_eq!(call.tool, "shell");
                assert_eq!(call.args.get("cmd").and_then(|v| v.as_str()), Some("ls"));
                assert!(!call.call_id.is_empty());
            }
            other => panic!("Expected ToolCall, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_final_answer_variants() {
        assert_eq!(
            parse_action(r#"{"final_answer": "done"}"#),
            Action::FinalAnswer { text: "done".into() }
        );
        assert_eq!(
            parse_action("Plain prose answer."),
            Action::FinalAnswer { text: "Plain prose answer.".into() }
        );
    }

    #[test]
    fn test_parse_malformed_json_is_continue() {
        match parse_action("{\"tool\": oops}") {
            Action::Continue { note } => assert_eq!(note, CORRECTIVE_NOTE),
            other => panic!("Expected Continue, got {:?}", other),
        }
    }

    #[test]
    fn test_system_prompt_lists_tools_and_memory() {
        let planner = Planner::new(None, 4);
        let tools = vec![ToolManifestEntry {
            name: "shell".into(),
            description: "run".into(),
            capability: Capability::ProcessExec,
            timeout_secs: 30,
            parameters: serde_json::json!({}),
        }];
        let mem = vec![MemoryRecord::new(MemoryScope::Persistent, "user prefers tabs", "t")];
        let prompt = planner.system_prompt(&tools, &mem);
        assert!(prompt.contains("- shell [process_exec; timeout 30s]"));
        assert!(prompt.contains("user prefers tabs"));
        assert!(prompt.contains("final_answer"));
    }

    #[test]
    fn test_build_messages_restates_goal_outside_window() {
        let planner = Planner::new(None, 1);
        let turns = vec![
            Turn::user("list files"),
            Turn::agent(Action::Continue { note: "thinking".into() }, None),
        ];
        let msgs = planner.build_messages("list files", &turns, &[], &[]);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs.last().unwrap().content, "Goal: list files");
    }
}
