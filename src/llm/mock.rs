//! 脚本化后端（测试与离线演示，无需推理服务）
//!
//! 按顺序回放预设输出；可模拟不可达、延迟、逐块慢速输出，以及永远提出工具调用的对抗模型。
//! 脚本耗尽后回显最后一条用户消息作为最终答案。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value;

use crate::config::BackendKind;
use crate::core::{Action, AgentError, ToolCall};
use crate::llm::traits::error_stream;
use crate::llm::{Backend, ChatMessage, ChatRole, GenerateOptions, GenerationEvent, GenerationStats, GenerationStream};

/// 一次 generate 调用的脚本输出
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// 模型原始文本（按空白切分为多个 TokenChunk）
    Text(String),
    /// 直接提出结构化动作
    Action(Action),
    /// 生成中途报错
    Error(AgentError),
}

pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<ScriptStep>>,
    /// 设置后每次都提出同一个工具调用（新的 call_id）
    endless_tool: Option<(String, Value)>,
    reachable: AtomicBool,
    latency: Duration,
    chunk_delay: Duration,
    models: Vec<String>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedBackend {
    pub fn new(name: &str, steps: Vec<ScriptStep>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(steps.into()),
            endless_tool: None,
            reachable: AtomicBool::new(true),
            latency: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            models: vec!["scripted".to_string()],
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 便捷构造：每条字符串是一次生成的完整输出
    pub fn from_texts(name: &str, texts: &[&str]) -> Self {
        Self::new(name, texts.iter().map(|t| ScriptStep::Text(t.to_string())).collect())
    }

    /// 永远提出工具调用的对抗后端
    pub fn always_tool_call(name: &str, tool: &str, args: Value) -> Self {
        let mut backend = Self::new(name, Vec::new());
        backend.endless_tool = Some((tool.to_string(), args));
        backend
    }

    pub fn unreachable(self) -> Self {
        self.reachable.store(false, Ordering::SeqCst);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// generate 被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次 generate 收到的完整消息列表
    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn next_step(&self, messages: &[ChatMessage]) -> ScriptStep {
        if let Some((tool, args)) = &self.endless_tool {
            return ScriptStep::Action(Action::ToolCall(ToolCall::from_value(tool.clone(), args.clone())));
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.unwrap_or_else(|| {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| m.role == ChatRole::User)
                .map(|m| m.content.as_str())
                .unwrap_or("(no input)");
            ScriptStep::Text(format!("Echo: {last_user}"))
        })
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn base_url(&self) -> &str {
        "mock://"
    }

    fn default_model(&self) -> Option<&str> {
        self.models.first().map(String::as_str)
    }

    async fn health_check(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn list_models(&self) -> Result<Vec<String>, AgentError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AgentError::BackendUnreachable(format!("{}: connection refused", self.name)));
        }
        Ok(self.models.clone())
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        _model: &str,
        _options: &GenerateOptions,
    ) -> GenerationStream {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());
        if !self.reachable.load(Ordering::SeqCst) {
            return error_stream(AgentError::BackendUnreachable(format!(
                "{}: connection refused",
                self.name
            )));
        }

        let mut events: Vec<GenerationEvent> = match self.next_step(messages) {
            ScriptStep::Text(text) => text
                .split_inclusive(char::is_whitespace)
                .map(|piece| GenerationEvent::TokenChunk(piece.to_string()))
                .collect(),
            ScriptStep::Action(action) => vec![GenerationEvent::ActionProposed(action)],
            ScriptStep::Error(err) => vec![GenerationEvent::Error(err)],
        };
        let completion = events.len() as u64;
        if !matches!(events.last(), Some(GenerationEvent::Error(_))) {
            events.push(GenerationEvent::Done(GenerationStats {
                elapsed_ms: self.latency.as_millis() as u64,
                prompt_tokens: Some(messages.iter().map(|m| m.content.split_whitespace().count() as u64).sum()),
                completion_tokens: Some(completion),
            }));
        }

        let latency = self.latency;
        let chunk_delay = self.chunk_delay;
        Box::pin(stream::unfold(
            (VecDeque::from(events), true),
            move |(mut queue, first)| async move {
                let delay = if first { latency } else { chunk_delay };
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let ev = queue.pop_front()?;
                Some((ev, (queue, false)))
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn collect_text(backend: &ScriptedBackend) -> (String, Vec<GenerationEvent>) {
        let events: Vec<_> = backend
            .generate(&[ChatMessage::user("hello there")], "scripted", &GenerateOptions::default())
            .await
            .collect()
            .await;
        let text = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::TokenChunk(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        (text, events)
    }

    #[tokio::test]
    async fn test_replays_script_then_echoes() {
        let backend = ScriptedBackend::from_texts("mock", &["first answer"]);
        let (text, events) = collect_text(&backend).await;
        assert_eq!(text, "first answer");
        assert!(matches!(events.last(), Some(GenerationEvent::Done(_))));

        let (text, _) = collect_text(&backend).await;
        assert_eq!(text, "Echo: hello there");
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_emits_error() {
        let backend = ScriptedBackend::new("mock", Vec::new()).unreachable();
        let (_, events) = collect_text(&backend).await;
        assert!(matches!(
            events.as_slice(),
            [GenerationEvent::Error(AgentError::BackendUnreachable(_))]
        ));
        assert!(backend.list_models().await.is_err());
    }

    #[tokio::test]
    async fn test_endless_tool_calls_have_fresh_ids() {
        let backend = ScriptedBackend::always_tool_call("adv", "shell", serde_json::json!({"cmd": "ls"}));
        let (_, a) = collect_text(&backend).await;
        let (_, b) = collect_text(&backend).await;
        let id = |events: &[GenerationEvent]| match &events[0] {
            GenerationEvent::ActionProposed(Action::ToolCall(call)) => call.call_id.clone(),
            other => panic!("Expected ActionProposed, got {:?}", other),
        };
        assert_ne!(id(&a), id(&b));
    }
}
