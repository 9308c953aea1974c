//! Shell 执行器：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、git）；禁止 rm -rf、sudo、管道下载执行等子串；
//! 在沙箱根目录中通过 sh -c 执行，环境变量已清洗。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolPayload;
use crate::tools::sandbox::run_to_text;
use crate::tools::{Capability, Sandbox, Tool, ToolArgs};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "sudo ",
    "su -",
    "wget ",
    "curl | sh",
    "| sh",
    "| bash",
    "chmod 777",
    "chmod +s",
    "chown ",
    "mkfs",
    "dd if=",
    "> /dev/",
    "shutdown",
    "reboot",
    ":(){ :|:& };:",
    "`",
    "$(",
];

pub struct ShellTool {
    sandbox: Sandbox,
    allowed_commands: HashSet<String>,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(sandbox: Sandbox, allowed_commands: Vec<String>, timeout: Duration) -> Self {
        Self {
            sandbox,
            allowed_commands: allowed_commands.into_iter().map(|s| s.to_lowercase()).collect(),
            timeout,
        }
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let lower = raw.to_lowercase();
        if let Some(pattern) = FORBIDDEN_SUBSTR.iter().find(|p| lower.contains(*p)) {
            return Err(format!("Forbidden pattern: {pattern}"));
        }
        // 命令链中的每一段都必须以白名单命令开头；换行在 sh -c 下同样分隔命令
        for segment in lower.split(['|', ';', '&', '\n', '\r']) {
            let name = segment.split_whitespace().next().unwrap_or("");
            if name.is_empty() {
                continue;
            }
            if !self.allowed_commands.contains(name) {
                return Err(format!("Command '{name}' not in allowlist"));
            }
        }
        if lower.trim().is_empty() {
            return Err("Empty command".to_string());
        }
        self.check_redirects(raw)
    }

    /// 重定向目标必须是沙箱内的普通相对路径：输出经 resolve_for_write，输入经 resolve
    fn check_redirects(&self, raw: &str) -> Result<(), String> {
        let chars: Vec<char> = raw.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            if chars[i] != '>' && chars[i] != '<' {
                i += 1;
                continue;
            }
            let mut j = i;
            while j < chars.len() && matches!(chars[j], '>' | '<' | '|') {
                j += 1;
            }
            let op: String = chars[i..j].iter().collect();
            if op.contains("<<") {
                return Err("Here-documents are not allowed".to_string());
            }
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let start = j;
            while j < chars.len() && !chars[j].is_whitespace() && !matches!(chars[j], '|' | ';' | '&' | '<' | '>') {
                j += 1;
            }
            let target: String = chars[start..j].iter().collect();
            if target.is_empty() {
                return Err(format!("Missing redirection target after '{op}'"));
            }
            if !target
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
            {
                return Err(format!("Unsupported redirection target: {target}"));
            }
            if op.contains('>') {
                self.sandbox.resolve_for_write(&target)?;
            } else {
                self.sandbox.resolve(&target)?;
            }
            i = j;
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run an allow-listed shell command inside the workspace. Args: {\"cmd\": \"ls -la\"}"
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
                "cmd": {
                    "type": "string",
                    "description": "The shell command to execute (first word must be in the allowlist)"
                }
            },
            "required": ["cmd"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolPayload, String> {
        let command = args
            .get("cmd")
            .or_else(|| args.get("command"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        self.check(&command)?;
        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = self.sandbox.command("sh");
        cmd.args(["-c", &command]);
        run_to_text(cmd, "shell").await.map(ToolPayload::Text)
    }
}
