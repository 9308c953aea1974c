//! 沙箱：受限工作目录 + 环境变量白名单
//!
//! 所有路径经 resolve 校验必须在根目录下（禁止 ../ 逃逸）；子进程在根目录中运行，
//! 环境变量先全部清除再按白名单回填，句柄丢弃时终止子进程。无法建立隔离时返回 Config 错误。

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::core::AgentError;

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    env_allowlist: Vec<String>,
}

impl Sandbox {
    /// 创建（必要时新建）根目录并规范化；失败即配置错误
    pub fn new(root: impl AsRef<Path>, env_allowlist: Vec<String>) -> Result<Self, AgentError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| {
            AgentError::Config(format!("cannot create workspace {}: {e}", root.display()))
        })?;
        let root = root.canonicalize().map_err(|e| {
            AgentError::Config(format!("cannot resolve workspace {}: {e}", root.display()))
        })?;
        if root.parent().is_none() {
            return Err(AgentError::Config(
                "workspace root must not be the filesystem root".into(),
            ));
        }
        let meta = std::fs::metadata(&root)
            .map_err(|e| AgentError::Config(format!("workspace not accessible: {e}")))?;
        if !meta.is_dir() || meta.permissions().readonly() {
            return Err(AgentError::Config(format!(
                "workspace {} is not a writable directory",
                root.display()
            )));
        }
        Ok(Self { root, env_allowlist })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析已存在的路径
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let rel = path.trim().trim_start_matches("./");
        let full = if rel.is_empty() || rel == "." {
            self.root.clone()
        } else {
            self.root.join(rel)
        };
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("Path not found: {path}"))?;
        if canonical.starts_with(&self.root) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes workspace: {path}"))
        }
    }

    /// 解析将要写入的路径：禁止 .. 与绝对路径，父目录按需创建
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, String> {
        let rel = Path::new(path.trim());
        if rel.as_os_str().is_empty() {
            return Err("Missing path".into());
        }
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(format!("Path escapes workspace: {path}"));
        }
        let full = self.root.join(rel);
        let parent = full
            .parent()
            .ok_or_else(|| format!("Invalid path: {path}"))?;
        std::fs::create_dir_all(parent).map_err(|e| format!("Create dir failed: {e}"))?;
        // 父目录可能是指向外部的符号链接
        let parent = parent
            .canonicalize()
            .map_err(|e| format!("Resolve failed: {e}"))?;
        if !parent.starts_with(&self.root) {
            return Err(format!("Path escapes workspace: {path}"));
        }
        match full.file_name() {
            Some(name) => Ok(parent.join(name)),
            None => Err(format!("Invalid path: {path}")),
        }
    }

    /// 在沙箱中运行的命令：工作目录为根，环境仅含白名单变量
    pub fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.current_dir(&self.root)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd
    }
}

/// 运行命令并收集输出；非零退出码视为失败
pub async fn run_to_text(mut cmd: Command, label: &str) -> Result<String, String> {
    let output = cmd
        .output()
        .await
        .map_err(|e| format!("{label}: spawn failed: {e}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !output.status.success() {
        return Err(format!(
            "{label}: exit {:?}\nstderr: {}",
            output.status.code(),
            stderr.trim()
        ));
    }
    Ok(if stderr.trim().is_empty() {
        stdout
    } else {
        format!("{}\nstderr: {}", stdout.trim_end(), stderr.trim())
    })
}
