//! 语音工具：通过外部程序做语音识别（transcribe）与语音合成（speak）

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolPayload;
use crate::tools::sandbox::run_to_text;
use crate::tools::{Capability, Sandbox, Tool, ToolArgs};

pub struct VoiceTool {
    sandbox: Sandbox,
    stt_program: String,
    tts_program: String,
    timeout: Duration,
}

impl VoiceTool {
    pub fn new(sandbox: Sandbox, stt_program: &str, tts_program: &str, timeout: Duration) -> Self {
        Self {
            sandbox,
            stt_program: stt_program.to_string(),
            tts_program: tts_program.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Tool for VoiceTool {
    fn name(&self) -> &str {
        "voice"
    }

    fn description(&self) -> &str {
        "Speech tools. Args: {\"action\": \"transcribe\", \"path\": \"audio.wav\"} or {\"action\": \"speak\", \"text\": \"...\", \"output\": \"out.wav\"}"
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
                "action": { "type": "string", "enum": ["transcribe", "speak"] },
                "path": { "type": "string" },
                "text": { "type": "string" },
                "output": { "type": "string" }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolPayload, String> {
        let action = args.get("action").and_then(|v| v.as_str()).unwrap_or("");
        match action {
            "transcribe" => {
                let path = args.get("path").and_then(|v| v.as_str()).ok_or("Missing path")?;
                let audio = self.sandbox.resolve(path)?;
                tracing::info!(path = %path, program = %self.stt_program, "voice transcribe");
                let mut cmd = self.sandbox.command(&self.stt_program);
                cmd.arg(&audio);
                run_to_text(cmd, &self.stt_program)
                    .await
                    .map(|t| ToolPayload::Text(t.trim().to_string()))
            }
            "speak" => {
                let text = args.get("text").and_then(|v| v.as_str()).ok_or("Missing text")?;
                let mut cmd = self.sandbox.command(&self.tts_program);
                let output = args.get("output").and_then(|v| v.as_str());
                if let Some(out) = output {
                    let target = self.sandbox.resolve_for_write(out)?;
                    cmd.arg("-w").arg(target);
                }
                cmd.arg(text);
                tracing::info!(program = %self.tts_program, chars = text.chars().count(), "voice speak");
                run_to_text(cmd, &self.tts_program).await?;
                Ok(ToolPayload::Text(match output {
                    Some(out) => format!("speech written to {out}"),
                    None => "spoken".to_string(),
                }))
            }
            other => Err(format!("Unknown voice action: {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transcribe_uses_configured_program() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.wav"), "fake audio").unwrap();
        let sandbox = Sandbox::new(dir.path(), vec!["PATH".into()]).unwrap();
        // cat 充当识别程序：输出即“转写文本”
        let tool = VoiceTool::new(sandbox, "cat", "echo", Duration::from_secs(5));
        let mut args = ToolArgs::new();
        args.insert("action".into(), "transcribe".into());
        args.insert("path".into(), "clip.wav".into());
        assert_eq!(tool.execute(args).await.unwrap().as_text(), "fake audio");
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path(), vec![]).unwrap();
        let tool = VoiceTool::new(sandbox, "whisper", "espeak", Duration::from_secs(5));
        assert!(tool.execute(ToolArgs::new()).await.is_err());
    }
}
