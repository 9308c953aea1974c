//! 工具层：Tool trait、注册表、沙箱、执行器与内置工具

pub mod code;
pub mod executor;
pub mod filesystem;
pub mod plugin;
pub mod registry;
pub mod sandbox;
pub mod schema;
pub mod shell;
pub mod vision;
pub mod voice;
pub mod web;

use std::sync::Arc;
use std::time::Duration;

pub use code::CodeTool;
pub use executor::{truncate_payload, ToolExecutor};
pub use filesystem::{CatTool, LsTool, WriteTool};
pub use plugin::{load_plugins, parse_manifest, PluginManifest, PluginTool};
pub use registry::{Capability, Tool, ToolArgs, ToolManifestEntry, ToolRegistry};
pub use sandbox::Sandbox;
pub use schema::action_schema_json;
pub use shell::ShellTool;
pub use vision::VisionTool;
pub use voice::VoiceTool;
pub use web::WebTool;

use crate::config::ToolsSection;
use crate::core::AgentError;

/// 按配置注册内置工具，再加载插件目录中的清单工具
///
/// 插件与内置工具重名时返回 ToolNameConflict。
pub fn build_default_registry(cfg: &ToolsSection, sandbox: &Sandbox) -> Result<ToolRegistry, AgentError> {
    let timeout = Duration::from_secs(cfg.tool_timeout_secs.max(1));
    let registry = ToolRegistry::new();

    registry.register(Arc::new(CatTool::new(sandbox.clone())))?;
    registry.register(Arc::new(LsTool::new(sandbox.clone())))?;
    registry.register(Arc::new(WriteTool::new(sandbox.clone())))?;
    registry.register(Arc::new(ShellTool::new(
        sandbox.clone(),
        cfg.shell.allowed_commands.clone(),
        timeout,
    )))?;
    registry.register(Arc::new(WebTool::new(
        cfg.web.allowed_domains.clone(),
        cfg.web.max_result_chars,
        timeout,
    )))?;
    registry.register(Arc::new(CodeTool::new(sandbox.clone(), timeout)))?;
    registry.register(Arc::new(VisionTool::new(
        sandbox.clone(),
        &cfg.vision.base_url,
        &cfg.vision.model,
        timeout,
    )))?;
    registry.register(Arc::new(VoiceTool::new(
        sandbox.clone(),
        &cfg.voice.stt_program,
        &cfg.voice.tts_program,
        timeout,
    )))?;

    if let Some(dir) = &cfg.plugins_dir {
        for plugin in load_plugins(dir, sandbox) {
            registry.register(Arc::new(plugin))?;
        }
    }

    tracing::info!(tools = ?registry.tool_names(), "tool registry ready");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path(), vec![]).unwrap();
        let registry = build_default_registry(&ToolsSection::default(), &sandbox).unwrap();
        let names = registry.tool_names();
        for expected in ["cat", "ls", "write", "shell", "web", "code", "vision", "voice"] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(!registry.get("cat").unwrap().capability().requires_approval());
        assert!(registry.get("write").unwrap().capability().requires_approval());
    }

    #[test]
    fn test_plugin_name_clash_is_rejected() {
        let ws = tempfile::tempdir().unwrap();
        let plugins = tempfile::tempdir().unwrap();
        std::fs::write(
            plugins.path().join("cat.toml"),
            "name = \"cat\"\ncapability = \"none\"\ntimeout_secs = 1\nprogram = \"cat\"\n",
        )
        .unwrap();
        let sandbox = Sandbox::new(ws.path(), vec![]).unwrap();
        let cfg = ToolsSection {
            plugins_dir: Some(plugins.path().to_path_buf()),
            ..ToolsSection::default()
        };
        assert!(matches!(
            build_default_registry(&cfg, &sandbox),
            Err(AgentError::ToolNameConflict(_))
        ));
    }
}
