//! 推理后端抽象
//!
//! 每种本地推理服务（Ollama / OpenAI 兼容 / Mock）实现 Backend：list_models、generate（惰性事件流）、
//! benchmark。传输层错误在适配器内部映射为 AgentError，以 GenerationEvent::Error 形式交给调用方。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::config::BackendKind;
use crate::core::{Action, AgentError};
use crate::llm::benchmark::{run_benchmark, BenchmarkScore};

/// 发送给后端的消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// 生成参数
#[derive(Clone, Debug)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: Some(0.2),
            max_tokens: None,
        }
    }
}

/// 一次生成的计时与 token 统计
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenerationStats {
    pub elapsed_ms: u64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// 统一的生成事件
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationEvent {
    TokenChunk(String),
    /// 后端直接给出结构化动作（原生工具调用或脚本后端）
    ActionProposed(Action),
    Error(AgentError),
    Done(GenerationStats),
}

/// 惰性事件流；丢弃即取消底层请求
pub type GenerationStream = Pin<Box<dyn Stream<Item = GenerationEvent> + Send>>;

/// 后端 trait：所有适配器的固定能力接口
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn protocol(&self) -> BackendKind;

    fn base_url(&self) -> &str;

    /// 配置中声明的默认模型
    fn default_model(&self) -> Option<&str> {
        None
    }

    /// 快速连通性检查
    async fn health_check(&self) -> bool;

    async fn list_models(&self) -> Result<Vec<String>, AgentError>;

    /// 流式生成：从不返回 Err，错误以 GenerationEvent::Error 出现在流中
    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: &str,
        options: &GenerateOptions,
    ) -> GenerationStream;

    /// 用固定提示集对模型打分
    async fn benchmark(&self, model: &str) -> BenchmarkScore {
        run_benchmark(self, model).await
    }
}

/// 单事件错误流
pub fn error_stream(err: AgentError) -> GenerationStream {
    Box::pin(futures_util::stream::once(async move { GenerationEvent::Error(err) }))
}

/// 把 reqwest 错误映射到固定错误分类
pub fn map_transport_error(backend: &str, err: &reqwest::Error) -> AgentError {
    if err.is_connect() || err.is_timeout() {
        AgentError::BackendUnreachable(format!("{backend}: {err}"))
    } else if err.is_decode() || err.is_body() {
        AgentError::BackendProtocolError(format!("{backend}: {err}"))
    } else {
        AgentError::BackendUnreachable(format!("{backend}: {err}"))
    }
}

/// 构建带超时的 HTTP 客户端
pub fn http_client(request_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
