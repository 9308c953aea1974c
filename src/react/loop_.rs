//! 编排主循环
//!
//! Planning → AwaitingTool → Integrating → Planning … → Finished | Aborted | Failed。
//! 每个状态边界都检查取消信号；生成流与工具执行期间通过 select 同时观察取消。
//! 迭代上限按 Planning 轮数计：达到上限后在下一次进入 Planning 前强制 Aborted。
//! 事件经 event_tx 推送给展示层，这是其了解循环进度的唯一通道。

use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{
    Action, AgentError, ApprovalInbox, ApprovalMode, ApprovalOutcome, ApprovalPolicy, LoopState, ToolCall,
    ToolResult, ToolStatus,
};
use crate::llm::{BackendRegistry, GenerateOptions, GenerationEvent};
use crate::memory::{MemoryStore, RecallScope, Turn, TurnTiming};
use crate::react::{parse_action, LoopEvent, Planner};
use crate::tools::ToolExecutor;

/// 单次循环依赖的共享组件与参数
pub struct LoopContext<'a> {
    pub backends: &'a BackendRegistry,
    pub executor: &'a ToolExecutor,
    pub planner: &'a Planner,
    pub policy: ApprovalPolicy,
    pub max_iterations: usize,
    pub retrieve_k: usize,
    /// 终态时保存会话
    pub persist_session: bool,
    pub options: GenerateOptions,
    pub event_tx: Option<&'a UnboundedSender<LoopEvent>>,
}

impl<'a> LoopContext<'a> {
    pub fn new(backends: &'a BackendRegistry, executor: &'a ToolExecutor, planner: &'a Planner) -> Self {
        Self {
            backends,
            executor,
            planner,
            policy: ApprovalPolicy::RequireApproval,
            max_iterations: 10,
            retrieve_k: 5,
            persist_session: false,
            options: GenerateOptions::default(),
            event_tx: None,
        }
    }

    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_retrieve_k(mut self, k: usize) -> Self {
        self.retrieve_k = k;
        self
    }

    pub fn with_persist_session(mut self, persist: bool) -> Self {
        self.persist_session = persist;
        self
    }

    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, ev: LoopEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(ev);
        }
    }
}

/// 一次目标执行的终态
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub state: LoopState,
    pub answer: Option<String>,
    /// Aborted / Failed 的原因
    pub error: Option<AgentError>,
    /// 部分（或完整）的 Turn 历史
    pub turns: Vec<Turn>,
    pub iterations: usize,
}

impl LoopOutcome {
    pub fn reason(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

/// 状态投影：记录当前状态并推送 StateChanged
struct StateMachine<'c, 'a> {
    ctx: &'c LoopContext<'a>,
    state: LoopState,
}

impl StateMachine<'_, '_> {
    fn go(&mut self, to: LoopState) {
        if !self.state.can_transition_to(to) {
            tracing::warn!(from = ?self.state, to = ?to, "unexpected loop transition");
        }
        tracing::debug!(from = ?self.state, to = ?to, "loop state");
        self.ctx.emit(LoopEvent::StateChanged { from: self.state, to });
        self.state = to;
    }
}

/// 一次生成的结果
enum Generated {
    Action(Action, Option<TurnTiming>),
    Cancelled,
}

/// 对一个目标运行循环直到终态
///
/// 调用方独占 memory 与 inbox；循环不跨挂起点持有任何共享锁。
pub async fn run_goal(
    ctx: &LoopContext<'_>,
    memory: &mut MemoryStore,
    inbox: &mut ApprovalInbox,
    goal: &str,
    cancel: &CancellationToken,
) -> LoopOutcome {
    let mut sm = StateMachine {
        ctx,
        state: LoopState::Idle,
    };
    tracing::info!(session = %memory.session_id(), goal = %goal, "goal started");

    // 先检索再写入目标，避免目标本身被当作记忆召回
    let memories = memory.retrieve(goal, RecallScope::All, ctx.retrieve_k).await;
    memory.append(Turn::user(goal));

    let mut iterations = 0usize;
    sm.go(LoopState::Planning);

    loop {
        if cancel.is_cancelled() {
            return finish_err(&mut sm, memory, LoopState::Aborted, AgentError::Cancelled, iterations).await;
        }
        if iterations >= ctx.max_iterations {
            tracing::warn!(iterations, "iteration limit reached");
            return finish_err(
                &mut sm,
                memory,
                LoopState::Aborted,
                AgentError::IterationLimitExceeded(ctx.max_iterations),
                iterations,
            )
            .await;
        }
        if sm.state != LoopState::Planning {
            sm.go(LoopState::Planning);
        }
        iterations += 1;

        let Some(active) = ctx.backends.active() else {
            let err = AgentError::BackendUnreachable("no active backend".into());
            return finish_err(&mut sm, memory, LoopState::Failed, err, iterations).await;
        };
        let tools = ctx.executor.registry().manifest();
        let messages = ctx
            .planner
            .build_messages(goal, memory.session().recent(usize::MAX), &tools, &memories);
        tracing::debug!(backend = %active.name, model = %active.model, iteration = iterations, "planning");

        let generated = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(Generated::Cancelled),
            stream = active.backend.generate(&messages, &active.model, &ctx.options) => {
                consume_stream(ctx, stream, cancel).await
            }
        };
        let (action, timing) = match generated {
            Ok(Generated::Action(action, timing)) => (action, timing),
            Ok(Generated::Cancelled) => {
                return finish_err(&mut sm, memory, LoopState::Aborted, AgentError::Cancelled, iterations).await;
            }
            Err(err) => {
                tracing::warn!(backend = %active.name, error = %err, "generation failed");
                return finish_err(&mut sm, memory, LoopState::Failed, err, iterations).await;
            }
        };
        memory.append(Turn::agent(action.clone(), timing));

        match action {
            Action::FinalAnswer { text } => {
                return finish_answer(&mut sm, memory, goal, text, iterations).await;
            }
            Action::Continue { note } => {
                tracing::debug!(note = %note, "continue");
                continue;
            }
            Action::ToolCall(call) => {
                sm.go(LoopState::AwaitingTool);
                let Dispatched { result, abort, started } = dispatch_tool(ctx, inbox, &call, cancel).await;
                sm.go(LoopState::Integrating);
                // 只为已发出 ToolCallStarted 的调用发出 ToolCallFinished，二者总是成对
                if started {
                    ctx.emit(LoopEvent::ToolCallFinished { result: result.clone() });
                }
                memory.append(Turn::tool(result));
                if let Some(err) = abort {
                    return finish_err(&mut sm, memory, LoopState::Aborted, err, iterations).await;
                }
            }
        }
    }
}

/// 读完生成流，得到一个动作；期间可被取消
async fn consume_stream(
    ctx: &LoopContext<'_>,
    mut stream: crate::llm::GenerationStream,
    cancel: &CancellationToken,
) -> Result<Generated, AgentError> {
    let mut text = String::new();
    let mut proposed: Option<Action> = None;
    let mut timing: Option<TurnTiming> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Generated::Cancelled),
            ev = stream.next() => ev,
        };
        match next {
            Some(GenerationEvent::TokenChunk(chunk)) => {
                ctx.emit(LoopEvent::TokenChunk { text: chunk.clone() });
                text.push_str(&chunk);
            }
            Some(GenerationEvent::ActionProposed(action)) => {
                if proposed.is_none() {
                    proposed = Some(action);
                }
            }
            Some(GenerationEvent::Error(err)) => return Err(err),
            Some(GenerationEvent::Done(stats)) => {
                timing = Some(TurnTiming {
                    elapsed_ms: stats.elapsed_ms,
                    prompt_tokens: stats.prompt_tokens,
                    completion_tokens: stats.completion_tokens,
                });
                break;
            }
            None => break,
        }
    }

    if let Some(action) = proposed {
        return Ok(Generated::Action(action, timing));
    }
    if text.trim().is_empty() {
        return Err(AgentError::BackendProtocolError("empty response".into()));
    }
    Ok(Generated::Action(parse_action(&text), timing))
}

/// 一次工具分派的结果
struct Dispatched {
    result: ToolResult,
    /// 需要终止循环时的原因
    abort: Option<AgentError>,
    /// 是否已进入执行（已发出 ToolCallStarted）
    started: bool,
}

impl Dispatched {
    fn unstarted(result: ToolResult, err: AgentError) -> Self {
        Self {
            result,
            abort: Some(err),
            started: false,
        }
    }
}

/// 审批守卫 + 执行
async fn dispatch_tool(
    ctx: &LoopContext<'_>,
    inbox: &mut ApprovalInbox,
    call: &ToolCall,
    cancel: &CancellationToken,
) -> Dispatched {
    let args = serde_json::Value::Object(call.args.clone());
    let mode = match ctx.policy {
        ApprovalPolicy::AutoApprove => ApprovalMode::AutoApprove,
        ApprovalPolicy::RequireApproval if ctx.executor.requires_approval(call) => {
            ctx.emit(LoopEvent::ApprovalRequested {
                call_id: call.call_id.clone(),
                tool: call.tool.clone(),
                args: args.clone(),
            });
            tracing::info!(tool = %call.tool, call_id = %call.call_id, "awaiting approval");
            match inbox.wait_for(&call.call_id, cancel).await {
                ApprovalOutcome::Approved => ApprovalMode::Approved,
                ApprovalOutcome::Cancelled => {
                    return Dispatched::unstarted(ToolResult::cancelled(call, 0), AgentError::Cancelled);
                }
                outcome => {
                    let err = AgentError::ApprovalDenied(match outcome {
                        ApprovalOutcome::TimedOut => format!("{} approval timed out", call.tool),
                        _ => format!("{} was denied by the user", call.tool),
                    });
                    let result = ToolResult::failure(call, ToolStatus::Failure, err.to_string(), 0);
                    return Dispatched::unstarted(result, err);
                }
            }
        }
        ApprovalPolicy::RequireApproval => ApprovalMode::Unapproved,
    };

    if cancel.is_cancelled() {
        return Dispatched::unstarted(ToolResult::cancelled(call, 0), AgentError::Cancelled);
    }
    ctx.emit(LoopEvent::ToolCallStarted {
        call_id: call.call_id.clone(),
        tool: call.tool.clone(),
        args,
    });
    let result = ctx.executor.invoke(call, mode, cancel).await;
    let abort = (result.status == ToolStatus::Cancelled).then_some(AgentError::Cancelled);
    Dispatched {
        result,
        abort,
        started: true,
    }
}

async fn finish_answer(
    sm: &mut StateMachine<'_, '_>,
    memory: &mut MemoryStore,
    goal: &str,
    text: String,
    iterations: usize,
) -> LoopOutcome {
    sm.go(LoopState::Finished);
    sm.ctx.emit(LoopEvent::Answer { text: text.clone() });
    let source = format!("session:{}", memory.session_id());
    if let Err(e) = memory.remember(&format!("Q: {goal}\nA: {text}"), &source).await {
        tracing::debug!(error = %e, "answer not written to persistent memory");
    }
    save_session(sm.ctx, memory).await;
    tracing::info!(session = %memory.session_id(), iterations, "goal finished");
    LoopOutcome {
        state: LoopState::Finished,
        answer: Some(text),
        error: None,
        turns: memory.session().turns.clone(),
        iterations,
    }
}

async fn finish_err(
    sm: &mut StateMachine<'_, '_>,
    memory: &mut MemoryStore,
    state: LoopState,
    err: AgentError,
    iterations: usize,
) -> LoopOutcome {
    sm.go(state);
    let turns = memory.session().turns.clone();
    let reason = err.to_string();
    if state == LoopState::Failed {
        sm.ctx.emit(LoopEvent::Failed { reason: reason.clone(), turns: turns.clone() });
    } else {
        sm.ctx.emit(LoopEvent::Aborted { reason: reason.clone(), turns: turns.clone() });
    }
    save_session(sm.ctx, memory).await;
    tracing::info!(session = %memory.session_id(), state = ?state, reason = %reason, "goal stopped");
    LoopOutcome {
        state,
        answer: None,
        error: Some(err),
        turns,
        iterations,
    }
}

async fn save_session(ctx: &LoopContext<'_>, memory: &MemoryStore) {
    if !ctx.persist_session {
        return;
    }
    match memory.persist().await {
        Ok(path) => tracing::debug!(path = %path.display(), "session saved"),
        Err(e) => tracing::warn!(error = %e, "session save failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::core::ToolPayload;
    use crate::llm::{ScriptStep, ScriptedBackend};
    use crate::memory::Session;
    use crate::tools::{Capability, Tool, ToolArgs, ToolRegistry};

    struct Listing;

    #[async_trait]
    impl Tool for Listing {
        fn name(&self) -> &str {
            "shell"
        }
        fn description(&self) -> &str {
            "fake shell"
        }
        fn capability(&self) -> Capability {
            Capability::ProcessExec
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(2)
        }
        async fn execute(&self, _args: ToolArgs) -> Result<ToolPayload, String> {
            Ok("a.txt\nb.txt".into())
        }
    }

    async fn fixture(backend: ScriptedBackend) -> (BackendRegistry, ToolExecutor, Planner) {
        let registry = BackendRegistry::new(Duration::from_millis(200));
        registry.register(Arc::new(backend)).unwrap();
        registry.activate("mock").await.unwrap();
        let tools = ToolRegistry::new();
        tools.register(Arc::new(Listing)).unwrap();
        (registry, ToolExecutor::new(Arc::new(tools), 1024), Planner::new(None, 8))
    }

    #[tokio::test]
    async fn test_continue_counts_as_iteration() {
        let backend = ScriptedBackend::from_texts("mock", &[r#"{"action": "continue", "note": "hmm"}"#, "done"]);
        let (backends, executor, planner) = fixture(backend).await;
        let ctx = LoopContext::new(&backends, &executor, &planner);
        let mut memory = MemoryStore::new(Session::new(None, false));
        let (_tx, mut inbox) = ApprovalInbox::channel(Duration::from_secs(1));

        let outcome = run_goal(&ctx, &mut memory, &mut inbox, "think", &CancellationToken::new()).await;
        assert_eq!(outcome.state, LoopState::Finished);
        assert_eq!(outcome.answer.as_deref(), Some("done"));
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn test_unapproved_tool_aborts_with_paired_result() {
        let backend = ScriptedBackend::new(
            "mock",
            vec![ScriptStep::Action(Action::ToolCall(ToolCall::from_value("shell", json!({"cmd": "ls"}))))],
        );
        let (backends, executor, planner) = fixture(backend).await;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = LoopContext::new(&backends, &executor, &planner).with_event_tx(&tx);
        let mut memory = MemoryStore::new(Session::new(None, false));
        let (_approvals, mut inbox) = ApprovalInbox::channel(Duration::from_millis(30));

        let outcome = run_goal(&ctx, &mut memory, &mut inbox, "list files", &CancellationToken::new()).await;
        assert_eq!(outcome.state, LoopState::Aborted);
        assert!(matches!(outcome.error, Some(AgentError::ApprovalDenied(_))));
        assert_eq!(memory.session().tool_call_count(), memory.session().tool_result_count());

        drop(tx);
        let mut rx = rx;
        let mut saw_request = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, LoopEvent::ApprovalRequested { .. }) {
                saw_request = true;
            }
            assert!(!matches!(ev, LoopEvent::ToolCallStarted { .. }));
            assert!(!matches!(ev, LoopEvent::ToolCallFinished { .. }));
        }
        assert!(saw_request);
    }

    #[tokio::test]
    async fn test_started_and_finished_events_pair_up() {
        let backend = ScriptedBackend::new(
            "mock",
            vec![
                ScriptStep::Action(Action::ToolCall(ToolCall::from_value("shell", json!({"cmd": "ls"})))),
                ScriptStep::Text("two files".into()),
            ],
        );
        let (backends, executor, planner) = fixture(backend).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = LoopContext::new(&backends, &executor, &planner)
            .with_policy(ApprovalPolicy::AutoApprove)
            .with_event_tx(&tx);
        let mut memory = MemoryStore::new(Session::new(None, false));
        let (_approvals, mut inbox) = ApprovalInbox::channel(Duration::from_secs(1));

        let outcome = run_goal(&ctx, &mut memory, &mut inbox, "list files", &CancellationToken::new()).await;
        assert_eq!(outcome.state, LoopState::Finished);

        drop(tx);
        let mut open = Vec::new();
        let mut finished = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                LoopEvent::ToolCallStarted { call_id, .. } => open.push(call_id),
                LoopEvent::ToolCallFinished { result } => {
                    assert_eq!(open.pop().as_deref(), Some(result.call_id.as_str()));
                    finished += 1;
                }
                _ => {}
            }
        }
        assert!(open.is_empty());
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn test_empty_generation_is_protocol_failure() {
        let backend = ScriptedBackend::from_texts("mock", &["   "]);
        let (backends, executor, planner) = fixture(backend).await;
        let ctx = LoopContext::new(&backends, &executor, &planner);
        let mut memory = MemoryStore::new(Session::new(None, false));
        let (_tx, mut inbox) = ApprovalInbox::channel(Duration::from_secs(1));

        let outcome = run_goal(&ctx, &mut memory, &mut inbox, "hi", &CancellationToken::new()).await;
        assert_eq!(outcome.state, LoopState::Failed);
        assert!(matches!(outcome.error, Some(AgentError::BackendProtocolError(_))));
    }
}
