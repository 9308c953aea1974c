//! 插件工具：从目录中的 *.toml 清单加载，运行「程序 + 参数模板」实现动态扩展
//!
//! 清单必须声明 capability 与 timeout_secs，缺少任一项的清单被拒绝。
//! 参数模板中 {{workspace}} 替换为沙箱根路径，{{key}} 从模型传入的 args 中取 key；
//! 执行时无 shell，直接在沙箱中 exec program + 替换后的参数。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::core::{AgentError, ToolPayload};
use crate::tools::sandbox::run_to_text;
use crate::tools::{Capability, Sandbox, Tool, ToolArgs};

/// 插件清单（一个 .toml 文件）
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub capability: Capability,
    pub timeout_secs: u64,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

pub struct PluginTool {
    manifest: PluginManifest,
    sandbox: Sandbox,
}

impl PluginTool {
    pub fn new(manifest: PluginManifest, sandbox: Sandbox) -> Self {
        Self { manifest, sandbox }
    }

    /// 替换模板中的 {{workspace}} 和 {{key}}
    fn substitute(&self, args: &ToolArgs) -> Vec<String> {
        let workspace = self.sandbox.root().to_string_lossy();
        self.manifest
            .args
            .iter()
            .map(|tpl| {
                let mut s = tpl.replace("{{workspace}}", &workspace);
                for (k, v) in args {
                    let val = match v {
                        Value::String(x) => x.clone(),
                        _ => v.to_string(),
                    };
                    s = s.replace(&format!("{{{{{k}}}}}"), &val);
                }
                s
            })
            .collect()
    }
}

#[async_trait]
impl Tool for PluginTool {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn description(&self) -> &str {
        &self.manifest.description
    }

    fn capability(&self) -> Capability {
        self.manifest.capability
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.manifest.timeout_secs)
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolPayload, String> {
        let argv = self.substitute(&args);
        tracing::info!(tool = %self.manifest.name, program = %self.manifest.program, "plugin tool invoke");
        let mut cmd = self.sandbox.command(&self.manifest.program);
        cmd.args(&argv);
        run_to_text(cmd, &self.manifest.name)
            .await
            .map(|out| ToolPayload::Text(out.trim().to_string()))
    }
}

/// 解析单个清单；必填项缺失或 timeout 为 0 时返回 Config 错误
pub fn parse_manifest(raw: &str, origin: &Path) -> Result<PluginManifest, AgentError> {
    let manifest: PluginManifest = toml::from_str(raw)
        .map_err(|e| AgentError::Config(format!("plugin manifest {}: {e}", origin.display())))?;
    if manifest.name.trim().is_empty() || manifest.program.trim().is_empty() {
        return Err(AgentError::Config(format!(
            "plugin manifest {}: name and program are required",
            origin.display()
        )));
    }
    if manifest.timeout_secs == 0 {
        return Err(AgentError::Config(format!(
            "plugin manifest {}: timeout_secs must be positive",
            origin.display()
        )));
    }
    Ok(manifest)
}

/// 加载目录下全部 *.toml 清单；无效清单记 warn 并跳过，按文件名排序
pub fn load_plugins(dir: &Path, sandbox: &Sandbox) -> Vec<PluginTool> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "plugins dir unreadable");
            return Vec::new();
        }
    };
    let mut paths: Vec<_> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut plugins = Vec::new();
    for path in paths {
        let raw = match std::fs::read_to_string(&path) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "plugin manifest unreadable");
                continue;
            }
        };
        match parse_manifest(&raw, &path) {
            Ok(m) => {
                tracing::info!(name = %m.name, capability = ?m.capability, "plugin loaded");
                plugins.push(PluginTool::new(m, sandbox.clone()));
            }
            Err(e) => tracing::warn!(error = %e, "plugin rejected"),
        }
    }
    plugins
}

#[cfg(test)]
mod tests {
    use super::*;

    const GREETER: &str = r#"
name = "greet"
description = "Say hello"
capability = "process_exec"
timeout_secs = 5
program = "echo"
args = ["hello", "{{who}}"]
"#;

    #[test]
    fn test_manifest_requires_capability_and_timeout() {
        let p = Path::new("x.toml");
        assert!(parse_manifest(GREETER, p).is_ok());
        let no_cap = "name = \"a\"\ntimeout_secs = 3\nprogram = \"echo\"\n";
        assert!(matches!(parse_manifest(no_cap, p), Err(AgentError::Config(_))));
        let no_timeout = "name = \"a\"\ncapability = \"none\"\nprogram = \"echo\"\n";
        assert!(parse_manifest(no_timeout, p).is_err());
        let zero = "name = \"a\"\ncapability = \"none\"\ntimeout_secs = 0\nprogram = \"echo\"\n";
        assert!(parse_manifest(zero, p).is_err());
    }

    #[tokio::test]
    async fn test_load_and_run_plugin() {
        let ws = tempfile::tempdir().unwrap();
        let plugins = tempfile::tempdir().unwrap();
        std::fs::write(plugins.path().join("greet.toml"), GREETER).unwrap();
        std::fs::write(plugins.path().join("broken.toml"), "name = ").unwrap();
        std::fs::write(plugins.path().join("readme.md"), "ignored").unwrap();
        let sandbox = Sandbox::new(ws.path(), vec!["PATH".into()]).unwrap();

        let loaded = load_plugins(plugins.path(), &sandbox);
        assert_eq!(loaded.len(), 1);
        let tool = &loaded[0];
        assert_eq!(tool.capability(), Capability::ProcessExec);
        assert_eq!(tool.timeout(), Duration::from_secs(5));

        let mut args = ToolArgs::new();
        args.insert("who".into(), "orby".into());
        assert_eq!(tool.execute(args).await.unwrap().as_text(), "hello orby");
    }
}
