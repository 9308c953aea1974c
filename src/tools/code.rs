//! 代码执行工具：python / javascript / bash 片段写入沙箱临时文件后以子进程运行

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolPayload;
use crate::tools::sandbox::run_to_text;
use crate::tools::{Capability, Sandbox, Tool, ToolArgs};

/// (语言, 解释器, 扩展名)
const LANGUAGES: &[(&str, &str, &str)] = &[
    ("python", "python3", "py"),
    ("javascript", "node", "js"),
    ("bash", "bash", "sh"),
];

/// 脚本文件随守卫释放而删除；超时或取消时执行 future 被丢弃也成立
struct ScriptGuard(PathBuf);

impl Drop for ScriptGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

pub struct CodeTool {
    sandbox: Sandbox,
    timeout: Duration,
}

impl CodeTool {
    pub fn new(sandbox: Sandbox, timeout: Duration) -> Self {
        Self { sandbox, timeout }
    }
}

#[async_trait]
impl Tool for CodeTool {
    fn name(&self) -> &str {
        "code"
    }

    fn description(&self) -> &str {
        "Run a code snippet in the workspace. Args: {\"language\": \"python|javascript|bash\", \"code\": \"...\"}"
    }

    fn capability(&self) -> Capability {
        Capability::ProcessExec
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "language": { "type": "string", "enum": ["python", "javascript", "bash"] },
                "code": { "type": "string" }
            },
            "required": ["language", "code"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolPayload, String> {
        let language = args
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or("python")
            .to_lowercase();
        let code = args
            .get("code")
            .and_then(|v| v.as_str())
            .ok_or("Missing code")?;
        let (_, interpreter, ext) = LANGUAGES
            .iter()
            .find(|(name, _, _)| *name == language)
            .ok_or_else(|| format!("Unsupported language: {language}"))?;

        let script_dir = self.sandbox.root().join(".orby-code");
        tokio::fs::create_dir_all(&script_dir)
            .await
            .map_err(|e| format!("Create script dir failed: {e}"))?;
        let script = ScriptGuard(script_dir.join(format!("{}.{ext}", uuid::Uuid::new_v4())));
        tokio::fs::write(&script.0, code)
            .await
            .map_err(|e| format!("Write script failed: {e}"))?;
        tracing::info!(language = %language, bytes = code.len(), "code tool execute");

        let mut cmd = self.sandbox.command(interpreter);
        cmd.arg(&script.0);
        run_to_text(cmd, interpreter).await.map(ToolPayload::Text)
    }
}
