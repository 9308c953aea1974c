//! 审批策略与审批收件箱
//!
//! 同一状态机由 ApprovalPolicy 参数化：AutoApprove 时跳过审批守卫，RequireApproval 时
//! 对需要审批的能力（写文件、执行进程、网络）等待外部 ApprovalDecision。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 会话级审批策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    AutoApprove,
    RequireApproval,
}

impl ApprovalPolicy {
    pub fn from_auto_approve(auto: bool) -> Self {
        if auto {
            ApprovalPolicy::AutoApprove
        } else {
            ApprovalPolicy::RequireApproval
        }
    }
}

/// 单次调用的审批状态（传给 ToolExecutor::invoke）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalMode {
    /// 自动批准所有能力
    AutoApprove,
    /// 本次调用已获得用户批准
    Approved,
    /// 未获批准：需要审批的工具将被拒绝执行
    Unapproved,
}

/// 前端发回的审批结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub call_id: String,
    pub approved: bool,
}

/// 等待审批的结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    TimedOut,
    Cancelled,
}

/// 审批收件箱：由循环独占，不跨挂起点持锁
pub struct ApprovalInbox {
    rx: mpsc::UnboundedReceiver<ApprovalDecision>,
    wait: Duration,
}

impl ApprovalInbox {
    pub fn new(rx: mpsc::UnboundedReceiver<ApprovalDecision>, wait: Duration) -> Self {
        Self { rx, wait }
    }

    /// 创建一对（发送端，收件箱）
    pub fn channel(wait: Duration) -> (mpsc::UnboundedSender<ApprovalDecision>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx, wait))
    }

    /// 等待指定 call_id 的审批结果；其它 call_id 的过期决定被丢弃
    pub async fn wait_for(&mut self, call_id: &str, cancel: &CancellationToken) -> ApprovalOutcome {
        let deadline = tokio::time::sleep(self.wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return ApprovalOutcome::Cancelled,
                _ = &mut deadline => return ApprovalOutcome::TimedOut,
                decision = self.rx.recv() => match decision {
                    Some(d) if d.call_id == call_id => {
                        return if d.approved { ApprovalOutcome::Approved } else { ApprovalOutcome::Denied };
                    }
                    Some(stale) => {
                        tracing::debug!(call_id = %stale.call_id, "dropping stale approval decision");
                    }
                    // 发送端全部关闭：不会再有审批到来
                    None => return ApprovalOutcome::Denied,
                },
            }
        }
    }
}
