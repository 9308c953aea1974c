//! 视觉工具：工作区内的图片 → base64 → 本地视觉模型（Ollama /api/generate）

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::ToolPayload;
use crate::tools::{Capability, Sandbox, Tool, ToolArgs};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

pub struct VisionTool {
    sandbox: Sandbox,
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl VisionTool {
    pub fn new(sandbox: Sandbox, base_url: &str, model: &str, timeout: Duration) -> Self {
        Self {
            sandbox,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Tool for VisionTool {
    fn name(&self) -> &str {
        "vision"
    }

    fn description(&self) -> &str {
        "Describe or analyse an image file from the workspace with a local vision model. Args: {\"path\": \"img.png\", \"prompt\": \"What is shown?\"}"
    }

    fn capability(&self) -> Capability {
        Capability::Network
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "prompt": { "type": "string" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolPayload, String> {
        let path = args.get("path").and_then(|v| v.as_str()).ok_or("Missing path")?;
        let prompt = args
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or("Describe this image in detail.");
        let resolved = self.sandbox.resolve(path)?;
        let ext = resolved
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return Err(format!("Unsupported image type: {path}"));
        }
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| format!("Read failed: {e}"))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        tracing::info!(path = %path, model = %self.model, "vision tool");

        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "images": [encoded],
                "stream": false,
            }))
            .send()
            .await
            .map_err(|e| format!("Vision model unreachable: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("Vision model returned {}", resp.status()));
        }
        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| format!("Malformed vision response: {e}"))?;
        Ok(ToolPayload::Text(body.response))
    }
}
