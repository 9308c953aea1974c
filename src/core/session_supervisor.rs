//! 会话监管：每个目标一个取消令牌
//!
//! begin_goal() 为新目标签发令牌，cancel() 取消当前目标；前端不持有循环状态，只持有 supervisor。

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

/// 会话级取消管理（可跨任务克隆）
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    /// 会话整体关闭时触发
    root: CancellationToken,
    /// 当前目标的令牌（root 的子令牌）
    current: Arc<Mutex<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        let root = CancellationToken::new();
        let current = Arc::new(Mutex::new(root.child_token()));
        Self { root, current }
    }

    /// 为新目标签发新的子令牌（上一个目标的取消状态不影响新目标）
    pub fn begin_goal(&self) -> CancellationToken {
        let token = self.root.child_token();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    /// 取消当前目标
    pub fn cancel(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// 关闭整个会话（所有目标）
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_only_affects_current_goal() {
        let sup = SessionSupervisor::new();
        let first = sup.begin_goal();
        sup.cancel();
        assert!(first.is_cancelled());

        let second = sup.begin_goal();
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_shutdown_cancels_everything() {
        let sup = SessionSupervisor::new();
        let goal = sup.begin_goal();
        sup.shutdown();
        assert!(goal.is_cancelled());
        assert!(sup.is_shutdown());
    }
}
