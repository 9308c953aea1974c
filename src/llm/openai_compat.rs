//! OpenAI 兼容服务适配器（LM Studio、llama.cpp server、vLLM、LocalAI）
//!
//! 通过 async_openai 调用自定义 base_url：GET /models 列模型，流式 chat completions 逐块产出
//! delta.content，出现 finish_reason 后结束。

use std::time::{Duration, Instant};

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::config::BackendKind;
use crate::core::AgentError;
use crate::llm::traits::{error_stream, http_client};
use crate::llm::{
    Backend, ChatMessage, ChatRole, GenerateOptions, GenerationEvent, GenerationStats, GenerationStream,
};

pub struct OpenAiCompatBackend {
    name: String,
    base_url: String,
    default_model: Option<String>,
    client: Client<OpenAIConfig>,
    probe_timeout: Duration,
}

impl OpenAiCompatBackend {
    pub fn new(
        name: &str,
        base_url: &str,
        default_model: Option<String>,
        api_key: Option<&str>,
        request_timeout: Duration,
    ) -> Self {
        // 本地服务通常不校验 key，但 async_openai 总会发送 Authorization 头
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-local".to_string());
        let base_url = base_url.trim_end_matches('/').to_string();
        let config = OpenAIConfig::new()
            .with_api_base(&base_url)
            .with_api_key(api_key);
        Self {
            name: name.to_string(),
            base_url,
            default_model,
            client: Client::with_config(config).with_http_client(http_client(request_timeout)),
            probe_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    fn map_error(&self, err: &OpenAIError) -> AgentError {
        map_openai_error(&self.name, err)
    }
}

fn map_openai_error(backend: &str, err: &OpenAIError) -> AgentError {
    if let OpenAIError::Reqwest(inner) = err {
        if inner.is_connect() || inner.is_timeout() {
            return AgentError::BackendUnreachable(format!("{backend}: {inner}"));
        }
    }
    let text = err.to_string();
    let lower = text.to_lowercase();
    if lower.contains("connection refused")
        || lower.contains("error sending request")
        || lower.contains("timed out")
    {
        AgentError::BackendUnreachable(format!("{backend}: {text}"))
    } else {
        AgentError::BackendProtocolError(format!("{backend}: {text}"))
    }
}

fn to_openai_messages(messages: &[ChatMessage]) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    messages
        .iter()
        .map(|m| {
            Ok(match m.role {
                ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
                    .content(m.content.clone())
                    .build()?
                    .into(),
                ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(m.content.clone())
                    .build()?
                    .into(),
                ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(m.content.clone())
                    .build()?
                    .into(),
            })
        })
        .collect()
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> BackendKind {
        BackendKind::OpenaiCompat
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn health_check(&self) -> bool {
        match tokio::time::timeout(self.probe_timeout, self.client.models().list()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(backend = %self.name, error = %e, "health check failed");
                false
            }
            Err(_) => false,
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, AgentError> {
        let resp = tokio::time::timeout(self.probe_timeout, self.client.models().list())
            .await
            .map_err(|_| AgentError::BackendUnreachable(format!("{}: model listing timed out", self.name)))?
            .map_err(|e| self.map_error(&e))?;
        Ok(resp.data.into_iter().map(|m| m.id).collect())
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &GenerateOptions,
    ) -> GenerationStream {
        let messages = match to_openai_messages(messages) {
            Ok(m) => m,
            Err(e) => return error_stream(AgentError::BackendProtocolError(e.to_string())),
        };
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(model).messages(messages).stream(true);
        if let Some(t) = options.temperature {
            args.temperature(t);
        }
        if let Some(n) = options.max_tokens {
            args.max_completion_tokens(n);
        }
        let request = match args.build() {
            Ok(r) => r,
            Err(e) => return error_stream(AgentError::BackendProtocolError(e.to_string())),
        };

        let started = Instant::now();
        let upstream = match self.client.chat().create_stream(request).await {
            Ok(s) => s,
            Err(e) => return error_stream(self.map_error(&e)),
        };

        let name = self.name.clone();
        // (上游流, 已结束, 待发事件)
        let state = (upstream, false, Vec::<GenerationEvent>::new(), None::<(u64, u64)>);
        Box::pin(stream::unfold(state, move |(mut upstream, mut finished, mut pending, mut usage)| {
            let name = name.clone();
            async move {
                loop {
                    if let Some(ev) = pending.pop() {
                        return Some((ev, (upstream, finished, pending, usage)));
                    }
                    if finished {
                        return None;
                    }
                    match upstream.next().await {
                        Some(Ok(chunk)) => {
                            if let Some(u) = &chunk.usage {
                                usage = Some((u.prompt_tokens as u64, u.completion_tokens as u64));
                            }
                            let mut done = false;
                            let mut text = String::new();
                            for choice in &chunk.choices {
                                if let Some(c) = &choice.delta.content {
                                    text.push_str(c);
                                }
                                done |= choice.finish_reason.is_some();
                            }
                            // pending 作为栈使用：先压入 Done 再压入文本
                            if done {
                                finished = true;
                                pending.push(GenerationEvent::Done(GenerationStats {
                                    elapsed_ms: started.elapsed().as_millis() as u64,
                                    prompt_tokens: usage.map(|u| u.0),
                                    completion_tokens: usage.map(|u| u.1),
                                }));
                            }
                            if !text.is_empty() {
                                pending.push(GenerationEvent::TokenChunk(text));
                            }
                        }
                        Some(Err(e)) => {
                            finished = true;
                            pending.push(GenerationEvent::Error(map_openai_error(&name, &e)));
                        }
                        None => {
                            // 部分服务不发送 finish_reason，直接以 [DONE] 结束
                            finished = true;
                            pending.push(GenerationEvent::Done(GenerationStats {
                                elapsed_ms: started.elapsed().as_millis() as u64,
                                prompt_tokens: usage.map(|u| u.0),
                                completion_tokens: usage.map(|u| u.1),
                            }));
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_conversion_keeps_order() {
        let msgs = to_openai_messages(&[
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ])
        .unwrap();
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(msgs[2], ChatCompletionRequestMessage::Assistant(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let backend = OpenAiCompatBackend::new(
            "lmstudio",
            "http://127.0.0.1:9/v1",
            None,
            None,
            Duration::from_secs(2),
        );
        assert!(!backend.health_check().await);
        assert!(matches!(
            backend.list_models().await,
            Err(AgentError::BackendUnreachable(_))
        ));
    }
}
