//! 运行时错误分类
//!
//! 适配器与工具层的错误在各自边界被转换为 GenerationEvent::Error 或终态 ToolResult，
//! 只有让循环无法继续的错误（如没有可达后端）才会使循环进入 Failed。

use thiserror::Error;

/// 统一错误类型：后端、工具、审批、迭代上限、记忆、取消，以及启动期配置错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    /// 后端返回了无法解析的响应
    #[error("Backend protocol error: {0}")]
    BackendProtocolError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Approval denied: {0}")]
    ApprovalDenied(String),

    #[error("Iteration limit exceeded ({0})")]
    IterationLimitExceeded(usize),

    /// 持久记忆不可用；会话记忆仍然可用
    #[error("Memory unavailable: {0}")]
    MemoryUnavailable(String),

    #[error("Cancelled")]
    Cancelled,

    /// 工具名重复注册
    #[error("Tool name conflict: {0}")]
    ToolNameConflict(String),

    /// 配置错误（含沙箱隔离失败，启动期致命）
    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 是否应让循环进入 Failed（继续已无意义）
    pub fn is_fatal_for_loop(&self) -> bool {
        matches!(
            self,
            AgentError::BackendUnreachable(_)
                | AgentError::BackendProtocolError(_)
                | AgentError::Config(_)
        )
    }
}
