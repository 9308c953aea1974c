//! Orby - 本地优先的智能体运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 动作模型、错误分类、状态机、审批、会话监管、运行时编排
//! - **llm**: 推理后端适配器（Ollama / OpenAI 兼容 / 脚本化）与后端注册表、基准
//! - **memory**: 会话记忆、SQLite 持久记忆与统一检索
//! - **react**: Planner 与编排主循环
//! - **tools**: 工具注册表、沙箱、执行器与内置工具
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{AgentError, Runtime, SessionHandle};
