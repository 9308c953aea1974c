//! 核心层：动作与结果模型、错误分类、状态机、审批、会话监管、运行时编排

pub mod action;
pub mod approval;
pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;

pub use action::{Action, ToolCall, ToolPayload, ToolResult, ToolStatus};
pub use approval::{ApprovalDecision, ApprovalInbox, ApprovalMode, ApprovalOutcome, ApprovalPolicy};
pub use error::AgentError;
pub use orchestrator::{Command, Runtime, SessionHandle};
pub use session_supervisor::SessionSupervisor;
pub use state::LoopState;
