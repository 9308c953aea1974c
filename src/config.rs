//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ORBY__*` 覆盖（双下划线表示嵌套，如 `ORBY__AGENT__MAX_ITERATIONS=5`）。
//! 每个键都有默认值，空配置即可运行。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub backends: BackendsSection,
    pub tools: ToolsSection,
}

/// [app] 段：会话目录、持久记忆库、上下文窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 会话 JSON 文件目录
    pub session_dir: PathBuf,
    /// SQLite 持久记忆文件
    pub memory_db: PathBuf,
    /// 循环结束时是否保存会话
    pub persist_sessions: bool,
    /// prompt 中携带的最近 Turn 数
    pub context_window: usize,
    /// 每次检索的记忆条数
    pub retrieve_k: usize,
    /// 设置后用 Ollama /api/embeddings 为持久记忆生成向量
    pub embedding_model: Option<String>,
    pub embedding_url: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            session_dir: orby_home().join("sessions"),
            memory_db: orby_home().join("memory.db"),
            persist_sessions: true,
            context_window: 12,
            retrieve_k: 5,
            embedding_model: None,
            embedding_url: "http://localhost:11434".into(),
        }
    }
}

fn orby_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".orby")
}

/// [agent] 段：迭代上限、审批等待、系统提示词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    pub approval_timeout_secs: u64,
    pub auto_approve: bool,
    pub system_prompt: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            approval_timeout_secs: 120,
            auto_approve: false,
            system_prompt: None,
        }
    }
}

/// 后端协议种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Ollama,
    OpenaiCompat,
    Mock,
}

/// [[backends.entries]]：一个已声明的后端
#[derive(Debug, Clone, Deserialize)]
pub struct BackendEntry {
    pub name: String,
    pub kind: BackendKind,
    pub base_url: String,
    pub default_model: Option<String>,
    pub api_key: Option<String>,
}

/// [backends] 段：探测超时、请求超时、首选后端、后端列表（声明顺序即平局顺序）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendsSection {
    pub probe_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub active: String,
    pub entries: Vec<BackendEntry>,
}

impl Default for BackendsSection {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 3,
            request_timeout_secs: 120,
            active: "ollama".to_string(),
            entries: vec![
                BackendEntry {
                    name: "ollama".into(),
                    kind: BackendKind::Ollama,
                    base_url: "http://localhost:11434".into(),
                    default_model: None,
                    api_key: None,
                },
                BackendEntry {
                    name: "lmstudio".into(),
                    kind: BackendKind::OpenaiCompat,
                    base_url: "http://localhost:1234/v1".into(),
                    default_model: None,
                    api_key: None,
                },
            ],
        }
    }
}

/// [tools] 段：沙箱根、超时、输出上限、环境变量白名单、插件目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub workspace_root: PathBuf,
    /// 单次工具调用超时（秒），插件清单可单独声明
    pub tool_timeout_secs: u64,
    pub max_output_bytes: usize,
    /// 子进程可见的环境变量，其余全部清除
    pub env_allowlist: Vec<String>,
    pub plugins_dir: Option<PathBuf>,
    pub shell: ShellSection,
    pub web: WebSection,
    pub vision: VisionSection,
    pub voice: VoiceSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./workspace"),
            tool_timeout_secs: 30,
            max_output_bytes: 16 * 1024,
            env_allowlist: vec!["PATH".into(), "HOME".into(), "LANG".into(), "TERM".into()],
            plugins_dir: None,
            shell: ShellSection::default(),
            web: WebSection::default(),
            vision: VisionSection::default(),
            voice: VoiceSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: [
                "ls", "cat", "head", "tail", "wc", "grep", "find", "echo", "pwd", "date", "du",
                "sort", "uniq", "git", "python3", "node",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// [tools.web] 段：域名白名单与结果截断
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub allowed_domains: Vec<String>,
    pub max_result_chars: usize,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            allowed_domains: vec![
                "en.wikipedia.org".into(),
                "zh.wikipedia.org".into(),
                "github.com".into(),
                "raw.githubusercontent.com".into(),
                "docs.rs".into(),
                "crates.io".into(),
                "doc.rust-lang.org".into(),
                "docs.python.org".into(),
                "developer.mozilla.org".into(),
                "stackoverflow.com".into(),
                "arxiv.org".into(),
            ],
            max_result_chars: 8000,
        }
    }
}

/// [tools.vision] 段：本地视觉模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionSection {
    pub model: String,
    pub base_url: String,
}

impl Default for VisionSection {
    fn default() -> Self {
        Self {
            model: "llava".into(),
            base_url: "http://localhost:11434".into(),
        }
    }
}

/// [tools.voice] 段：语音识别 / 合成外部程序
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceSection {
    pub stt_program: String,
    pub tts_program: String,
}

impl Default for VoiceSection {
    fn default() -> Self {
        Self {
            stt_program: "whisper".into(),
            tts_program: "espeak".into(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ORBY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ORBY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ORBY")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_iterations, 10);
        assert_eq!(cfg.backends.entries.len(), 2);
        assert_eq!(cfg.backends.entries[0].kind, BackendKind::Ollama);
        assert!(cfg.tools.env_allowlist.contains(&"PATH".to_string()));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orby.toml");
        std::fs::write(
            &path,
            r#"
[agent]
max_iterations = 3
auto_approve = true

[[backends.entries]]
name = "fake"
kind = "mock"
base_url = "mock://"
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.max_iterations, 3);
        assert!(cfg.agent.auto_approve);
        assert_eq!(cfg.backends.entries.len(), 1);
        assert_eq!(cfg.backends.entries[0].kind, BackendKind::Mock);
        // 未出现的段保持默认
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
    }
}
