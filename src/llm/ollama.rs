//! Ollama 原生协议适配器
//!
//! GET /api/tags 列模型，POST /api/chat 以换行分隔 JSON 流式返回，最后一行 done=true 并带
//! prompt_eval_count / eval_count。

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::config::BackendKind;
use crate::core::AgentError;
use crate::llm::traits::{error_stream, http_client, map_transport_error};
use crate::llm::{Backend, ChatMessage, GenerateOptions, GenerationEvent, GenerationStats, GenerationStream};

pub struct OllamaBackend {
    name: String,
    base_url: String,
    default_model: Option<String>,
    http: reqwest::Client,
    probe_timeout: Duration,
}

impl OllamaBackend {
    pub fn new(name: &str, base_url: &str, default_model: Option<String>, request_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model,
            http: http_client(request_timeout),
            probe_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

/// /api/chat 的单行响应
#[derive(Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<ChatLineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
}

#[async_trait]
impl Backend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn health_check(&self) -> bool {
        match self
            .http
            .get(self.url("/api/tags"))
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(backend = %self.name, error = %e, "health check failed");
                false
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, AgentError> {
        let resp = self
            .http
            .get(self.url("/api/tags"))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(&self.name, &e))?;
        if !resp.status().is_success() {
            return Err(AgentError::BackendProtocolError(format!(
                "{}: /api/tags returned {}",
                self.name,
                resp.status()
            )));
        }
        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::BackendProtocolError(format!("{}: {e}", self.name)))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &GenerateOptions,
    ) -> GenerationStream {
        let mut opts = serde_json::Map::new();
        if let Some(t) = options.temperature {
            opts.insert("temperature".into(), json!(t));
        }
        if let Some(n) = options.max_tokens {
            opts.insert("num_predict".into(), json!(n));
        }
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "options": opts,
        });

        let started = Instant::now();
        let resp = match self.http.post(self.url("/api/chat")).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return error_stream(map_transport_error(&self.name, &e)),
        };
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return error_stream(AgentError::BackendProtocolError(format!(
                "{}: /api/chat returned {status}: {}",
                self.name,
                detail.chars().take(200).collect::<String>()
            )));
        }

        let name = self.name.clone();
        let body = resp
            .bytes_stream()
            .map(move |chunk| chunk.map(|b| b.to_vec()).map_err(|e| map_transport_error(&name, &e)));
        ndjson_events(Box::pin(body), self.name.clone(), started)
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, AgentError>> + Send>>;

struct NdjsonState {
    body: ByteStream,
    buf: Vec<u8>,
    pending: VecDeque<GenerationEvent>,
    finished: bool,
    backend: String,
    started: Instant,
}

impl NdjsonState {
    /// 解析缓冲区中所有完整的行
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.parse_line(&line);
            if self.finished {
                return;
            }
        }
    }

    fn parse_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let parsed: ChatLine = match serde_json::from_str(line) {
            Ok(p) => p,
            Err(e) => {
                self.fail(AgentError::BackendProtocolError(format!(
                    "{}: malformed stream line: {e}",
                    self.backend
                )));
                return;
            }
        };
        if let Some(err) = parsed.error {
            self.fail(AgentError::BackendProtocolError(format!("{}: {err}", self.backend)));
            return;
        }
        if let Some(msg) = parsed.message {
            if !msg.content.is_empty() {
                self.pending.push_back(GenerationEvent::TokenChunk(msg.content));
            }
        }
        if parsed.done {
            self.finished = true;
            self.pending.push_back(GenerationEvent::Done(GenerationStats {
                elapsed_ms: self.started.elapsed().as_millis() as u64,
                prompt_tokens: parsed.prompt_eval_count,
                completion_tokens: parsed.eval_count,
            }));
        }
    }

    fn fail(&mut self, err: AgentError) {
        self.finished = true;
        self.pending.push_back(GenerationEvent::Error(err));
    }
}

/// 把字节流解码为事件流：逐行 JSON，done 行之后结束
fn ndjson_events(body: ByteStream, backend: String, started: Instant) -> GenerationStream {
    let state = NdjsonState {
        body,
        buf: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        backend,
        started,
    };
    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(ev) = st.pending.pop_front() {
                return Some((ev, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(&chunk);
                    st.drain_lines();
                }
                Some(Err(e)) => st.fail(e),
                None => {
                    let rest = std::mem::take(&mut st.buf);
                    st.parse_line(&rest);
                    if !st.finished {
                        let backend = st.backend.clone();
                        st.fail(AgentError::BackendProtocolError(format!(
                            "{backend}: stream ended before done"
                        )));
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(parts: &[&str]) -> ByteStream {
        let items: Vec<Result<Vec<u8>, AgentError>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn test_decodes_split_lines_and_done() {
        let body = bytes_of(&[
            "{\"message\":{\"role\":\"assistant\",\"content\":\"He\"},\"done\":false}\n{\"message\":{\"content\":\"l",
            "lo\"},\"done\":false}\n",
            "{\"done\":true,\"prompt_eval_count\":12,\"eval_count\":2}\n",
        ]);
        let events: Vec<_> = ndjson_events(body, "ollama".into(), Instant::now()).collect().await;
        assert_eq!(events[0], GenerationEvent::TokenChunk("He".into()));
        assert_eq!(events[1], GenerationEvent::TokenChunk("llo".into()));
        match &events[2] {
            GenerationEvent::Done(stats) => {
                assert_eq!(stats.prompt_tokens, Some(12));
                assert_eq!(stats.completion_tokens, Some(2));
            }
            other => panic!("Expected Done, got {:?}", other),
        }
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_line_is_protocol_error() {
        let body = bytes_of(&["not json\n"]);
        let events: Vec<_> = ndjson_events(body, "ollama".into(), Instant::now()).collect().await;
        assert!(matches!(
            events.as_slice(),
            [GenerationEvent::Error(AgentError::BackendProtocolError(_))]
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_protocol_error() {
        let body = bytes_of(&["{\"message\":{\"content\":\"hi\"},\"done\":false}\n"]);
        let events: Vec<_> = ndjson_events(body, "ollama".into(), Instant::now()).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], GenerationEvent::Error(AgentError::BackendProtocolError(_))));
    }

    #[tokio::test]
    async fn test_connection_refused_maps_to_unreachable() {
        // 端口 9 (discard) 在测试环境中通常无人监听
        let backend = OllamaBackend::new("ollama", "http://127.0.0.1:9", None, Duration::from_secs(2));
        assert!(!backend.health_check().await);
        let events: Vec<_> = backend
            .generate(&[ChatMessage::user("hi")], "llama3", &GenerateOptions::default())
            .await
            .collect()
            .await;
        assert!(matches!(
            events.as_slice(),
            [GenerationEvent::Error(AgentError::BackendUnreachable(_))]
        ));
    }
}
