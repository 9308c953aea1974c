//! 循环事件：展示层了解循环进度的唯一通道

use serde::Serialize;

use crate::core::{LoopState, ToolResult};
use crate::memory::Turn;

/// 按发生顺序推送的过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    StateChanged { from: LoopState, to: LoopState },
    /// 模型输出的一小段文本（流式）
    TokenChunk { text: String },
    ToolCallStarted {
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 需要用户对该调用做出批准 / 拒绝
    ApprovalRequested {
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    /// 与同一 call_id 的 ToolCallStarted 成对；被拒绝或在审批时取消的调用没有这两个事件
    ToolCallFinished { result: ToolResult },
    Answer { text: String },
    Aborted { reason: String, turns: Vec<Turn> },
    Failed { reason: String, turns: Vec<Turn> },
}

impl LoopEvent {
    /// 是否为一次目标执行的最后一个事件
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopEvent::Answer { .. } | LoopEvent::Aborted { .. } | LoopEvent::Failed { .. }
        )
    }
}
