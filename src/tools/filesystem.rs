//! 沙箱文件系统工具
//!
//! cat / ls 只读（无需审批），write 为 filesystem-write 能力；全部路径经 Sandbox 解析。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolPayload;
use crate::tools::{Capability, Sandbox, Tool, ToolArgs};

const FS_TIMEOUT: Duration = Duration::from_secs(10);

fn str_arg<'a>(args: &'a ToolArgs, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

/// Cat 工具：读取文件内容
pub struct CatTool {
    sandbox: Sandbox,
}

impl CatTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for CatTool {
    fn name(&self) -> &str {
        "cat"
    }

    fn description(&self) -> &str {
        "Read a text file. Args: {\"path\": \"file path relative to workspace\"}"
    }

    fn capability(&self) -> Capability {
        Capability::None
    }

    fn timeout(&self) -> Duration {
        FS_TIMEOUT
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolPayload, String> {
        let path = str_arg(&args, "path").ok_or("Missing path")?;
        tracing::info!(path = %path, "cat tool execute");
        let resolved = self.sandbox.resolve(path)?;
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| format!("Read failed: {e}"))?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok(ToolPayload::Text(text)),
            Err(e) => Ok(ToolPayload::Bytes(e.into_bytes())),
        }
    }
}

/// Ls 工具：列出目录（隐藏文件除外，目录带 / 后缀）
pub struct LsTool {
    sandbox: Sandbox,
}

impl LsTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for LsTool {
    fn name(&self) -> &str {
        "ls"
    }

    fn description(&self) -> &str {
        "List a directory. Args: {\"path\": \"directory path, default '.'\"}"
    }

    fn capability(&self) -> Capability {
        Capability::None
    }

    fn timeout(&self) -> Duration {
        FS_TIMEOUT
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolPayload, String> {
        let path = str_arg(&args, "path").unwrap_or(".");
        tracing::info!(path = %path, "ls tool execute");
        let base = self.sandbox.resolve(path)?;
        let mut dir = tokio::fs::read_dir(&base)
            .await
            .map_err(|e| format!("List failed: {e}"))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| e.to_string())? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        Ok(ToolPayload::Text(entries.join("\n")))
    }
}

/// Write 工具：写入或追加文件
pub struct WriteTool {
    sandbox: Sandbox,
}

impl WriteTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write text to a file in the workspace. Args: {\"path\": \"...\", \"content\": \"...\", \"append\": false}"
    }

    fn capability(&self) -> Capability {
        Capability::FilesystemWrite
    }

    fn timeout(&self) -> Duration {
        FS_TIMEOUT
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" },
                "append": { "type": "boolean" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolPayload, String> {
        let path = str_arg(&args, "path").ok_or("Missing path")?;
        let content = str_arg(&args, "content").ok_or("Missing content")?;
        let append = args.get("append").and_then(|v| v.as_bool()).unwrap_or(false);
        let target = self.sandbox.resolve_for_write(path)?;
        tracing::info!(path = %path, append, "write tool execute");
        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await
                .map_err(|e| format!("Open failed: {e}"))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| format!("Write failed: {e}"))?;
        } else {
            tokio::fs::write(&target, content)
                .await
                .map_err(|e| format!("Write failed: {e}"))?;
        }
        Ok(ToolPayload::Text(format!("wrote {} bytes to {path}", content.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, Value)]) -> ToolArgs {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_write_then_cat_and_ls() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path(), vec![]).unwrap();
        let write = WriteTool::new(sandbox.clone());
        write
            .execute(args(&[("path", "notes/a.txt".into()), ("content", "hello".into())]))
            .await
            .unwrap();
        write
            .execute(args(&[
                ("path", "notes/a.txt".into()),
                ("content", " world".into()),
                ("append", true.into()),
            ]))
            .await
            .unwrap();

        let cat = CatTool::new(sandbox.clone());
        let text = cat.execute(args(&[("path", "notes/a.txt".into())])).await.unwrap();
        assert_eq!(text.as_text(), "hello world");

        let ls = LsTool::new(sandbox);
        assert_eq!(ls.execute(ToolArgs::new()).await.unwrap().as_text(), "notes/");
    }

    #[tokio::test]
    async fn test_cat_outside_workspace_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path().join("ws"), vec![]).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "x").unwrap();
        let cat = CatTool::new(sandbox);
        let err = cat
            .execute(args(&[("path", "../secret.txt".into())]))
            .await
            .unwrap_err();
        assert!(err.contains("escapes"));
    }
}
