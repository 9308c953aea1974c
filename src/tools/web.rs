//! Web 工具：域名白名单、超时、结果大小限制
//!
//! mode=fetch 抓取正文（HTML 经 html2text 转为可读文本），mode=head 只返回状态与响应头；
//! 仅允许配置中的域名及其子域。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde_json::Value;

use crate::core::ToolPayload;
use crate::tools::{Capability, Tool, ToolArgs};

const USER_AGENT: &str = concat!("orby/", env!("CARGO_PKG_VERSION"));

pub struct WebTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
    timeout: Duration,
}

/// 判断内容是否像 HTML
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start().to_lowercase();
    s.starts_with("<!doctype") || s.starts_with("<html") || (s.contains("</") && s.contains("<body"))
}

/// 从 URL 中提取 host（去掉协议、端口、路径与用户信息）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

impl WebTool {
    pub fn new(allowed_domains: Vec<String>, max_result_chars: usize, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: allowed_domains.into_iter().map(|s| s.to_lowercase()).collect(),
            max_result_chars,
            timeout,
        }
    }

    fn check(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| "Invalid or missing URL".to_string())?;
        let allowed = self.allowed_domains.iter().any(|d| {
            domain == *d || domain.ends_with(&format!(".{d}"))
        });
        if allowed {
            Ok(())
        } else {
            Err(format!("Domain not in allowlist: {domain}"))
        }
    }

    async fn fetch(&self, url: &str) -> Result<String, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body = resp.text().await.map_err(|e| format!("Read body: {e}"))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(body) {
            match from_read(body.as_bytes(), 120) {
                Ok(t) if !t.trim().is_empty() => t,
                _ => body.to_string(),
            }
        } else {
            body.to_string()
        };
        if text.chars().count() > self.max_result_chars {
            Ok(text.chars().take(self.max_result_chars).collect::<String>() + "\n...[truncated]")
        } else {
            Ok(text)
        }
    }

    async fn head(&self, url: &str) -> Result<Value, String> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        let headers: serde_json::Map<String, Value> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), Value::String(v.to_str().ok()?.to_string()))))
            .collect();
        Ok(serde_json::json!({
            "status": resp.status().as_u16(),
            "headers": headers,
        }))
    }
}

#[async_trait]
impl Tool for WebTool {
    fn name(&self) -> &str {
        "web"
    }

    fn description(&self) -> &str {
        "Fetch a web page as text from allow-listed domains. Args: {\"url\": \"https://...\", \"mode\": \"fetch|head\"}"
    }

    fn capability(&self) -> Capability {
        Capability::Network
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "mode": { "type": "string", "enum": ["fetch", "head"] }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolPayload, String> {
        let url = args.get("url").and_then(|v| v.as_str()).unwrap_or("").trim();
        if url.is_empty() {
            return Err("Missing url".to_string());
        }
        self.check(url)?;
        let mode = args.get("mode").and_then(|v| v.as_str()).unwrap_or("fetch");
        tracing::info!(url = %url, mode = %mode, "web tool");
        match mode {
            "head" => self.head(url).await.map(ToolPayload::Structured),
            "fetch" => self.fetch(url).await.map(ToolPayload::Text),
            other => Err(format!("Unknown mode: {other}")),
        }
    }
}
