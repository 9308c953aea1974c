//! 编排循环状态机
//!
//! Idle → Planning → AwaitingTool → Integrating → Planning … → Finished | Aborted | Failed。
//! 自动模式与单步模式共用同一状态机，仅 AwaitingTool → Integrating 的审批守卫不同。

use serde::{Deserialize, Serialize};

/// 循环状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Planning,
    AwaitingTool,
    Integrating,
    Finished,
    Aborted,
    Failed,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Finished | LoopState::Aborted | LoopState::Failed)
    }

    /// 状态机允许的转移
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        match (self, next) {
            (Idle, Planning) => true,
            (Planning, AwaitingTool) | (Planning, Planning) | (Planning, Finished) => true,
            (AwaitingTool, Integrating) => true,
            (Integrating, Planning) => true,
            // 取消、审批拒绝、迭代上限可在任意非终态发生
            (from, Aborted) => !from.is_terminal(),
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}
