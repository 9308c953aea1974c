//! 嵌入 API：供记忆检索使用，调用 Ollama 的 /api/embeddings 端点

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::core::AgentError;
use crate::llm::traits::{http_client, map_transport_error};

/// 文本向量化；失败时检索退回词法相似度
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError>;
}

pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            http: http_client(Duration::from_secs(30)),
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AgentError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .http
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| map_transport_error("embeddings", &e))?;
        if !resp.status().is_success() {
            return Err(AgentError::BackendProtocolError(format!(
                "embeddings: status {}",
                resp.status()
            )));
        }
        let body: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| AgentError::BackendProtocolError(format!("embeddings: {e}")))?;
        Ok(body.embedding)
    }
}
