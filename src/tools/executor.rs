//! 工具执行器
//!
//! invoke(call, mode, cancel) 总是返回终态 ToolResult：查找、审批守卫、超时、取消、输出截断都在这里收口。
//! 工具在独立任务中运行，循环可同时观察取消信号；取消时中止任务（子进程随句柄丢弃被终止）并等待其结束。
//! 每次调用输出一行 JSON 审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, ApprovalMode, ToolCall, ToolPayload, ToolResult, ToolStatus};
use crate::tools::{Tool, ToolArgs, ToolRegistry};

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    max_output_bytes: usize,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, max_output_bytes: usize) -> Self {
        Self {
            registry,
            max_output_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    /// 该调用在非自动审批模式下是否需要用户批准
    pub fn requires_approval(&self, call: &ToolCall) -> bool {
        self.registry
            .get(&call.tool)
            .map(|t| t.capability().requires_approval())
            .unwrap_or(false)
    }

    /// 按名调用（无外部取消）
    pub async fn invoke_named(&self, name: &str, args: ToolArgs, mode: ApprovalMode) -> ToolResult {
        let call = ToolCall::new(name, args);
        self.invoke(&call, mode, &CancellationToken::new()).await
    }

    pub async fn invoke(&self, call: &ToolCall, mode: ApprovalMode, cancel: &CancellationToken) -> ToolResult {
        let start = Instant::now();
        let result = self.dispatch(call, mode, cancel, start).await;
        self.audit(call, &result);
        result
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        mode: ApprovalMode,
        cancel: &CancellationToken,
        start: Instant,
    ) -> ToolResult {
        let Some(tool) = self.registry.get(&call.tool) else {
            return ToolResult::failure(
                call,
                ToolStatus::Failure,
                AgentError::ToolNotFound(call.tool.clone()).to_string(),
                0,
            );
        };
        if mode == ApprovalMode::Unapproved && tool.capability().requires_approval() {
            return ToolResult::failure(
                call,
                ToolStatus::Failure,
                AgentError::ApprovalDenied(format!("{} requires approval", call.tool)).to_string(),
                0,
            );
        }
        if cancel.is_cancelled() {
            return ToolResult::cancelled(call, 0);
        }

        let deadline = tool.timeout();
        let args = call.args.clone();
        let mut handle = tokio::spawn(async move { tokio::time::timeout(deadline, tool.execute(args)).await });

        let outcome = tokio::select! {
            joined = &mut handle => joined,
            _ = cancel.cancelled() => {
                handle.abort();
                // 等待工作任务真正结束，子进程随之被终止
                let _ = handle.await;
                return ToolResult::cancelled(call, elapsed_ms(start));
            }
        };

        let elapsed = elapsed_ms(start);
        match outcome {
            Ok(Ok(Ok(payload))) => {
                let (payload, truncated) = truncate_payload(payload, self.max_output_bytes);
                ToolResult {
                    call_id: call.call_id.clone(),
                    tool: call.tool.clone(),
                    status: ToolStatus::Success,
                    payload,
                    elapsed_ms: elapsed,
                    truncated,
                }
            }
            Ok(Ok(Err(reason))) => {
                let (payload, truncated) = truncate_payload(
                    ToolPayload::Text(AgentError::ToolExecutionFailed(reason).to_string()),
                    self.max_output_bytes,
                );
                ToolResult {
                    call_id: call.call_id.clone(),
                    tool: call.tool.clone(),
                    status: ToolStatus::Failure,
                    payload,
                    elapsed_ms: elapsed,
                    truncated,
                }
            }
            Ok(Err(_)) => ToolResult::failure(
                call,
                ToolStatus::Timeout,
                AgentError::ToolTimeout(format!("{} exceeded {}s", call.tool, deadline_secs(deadline)))
                    .to_string(),
                elapsed,
            ),
            Err(join_err) => ToolResult::failure(
                call,
                ToolStatus::Failure,
                AgentError::ToolExecutionFailed(format!("tool worker crashed: {join_err}")).to_string(),
                elapsed,
            ),
        }
    }

    fn audit(&self, call: &ToolCall, result: &ToolResult) {
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.tool,
            "call_id": call.call_id,
            "status": result.status,
            "duration_ms": result.elapsed_ms,
            "truncated": result.truncated,
            "args_preview": args_preview(&Value::Object(call.args.clone())),
        });
        tracing::info!(audit = %audit, "tool");
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn deadline_secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

/// 超过上限时截断并追加显式标记
pub fn truncate_payload(payload: ToolPayload, max_bytes: usize) -> (ToolPayload, bool) {
    match payload {
        ToolPayload::Text(text) => match truncate_text(&text, max_bytes) {
            Some(cut) => (ToolPayload::Text(cut), true),
            None => (ToolPayload::Text(text), false),
        },
        ToolPayload::Bytes(mut bytes) => {
            if bytes.len() > max_bytes {
                let dropped = bytes.len() - max_bytes;
                bytes.truncate(max_bytes);
                bytes.extend_from_slice(truncation_marker(dropped).as_bytes());
                (ToolPayload::Bytes(bytes), true)
            } else {
                (ToolPayload::Bytes(bytes), false)
            }
        }
        ToolPayload::Structured(value) => {
            let text = value.to_string();
            match truncate_text(&text, max_bytes) {
                Some(cut) => (ToolPayload::Text(cut), true),
                None => (ToolPayload::Structured(value), false),
            }
        }
    }
}

fn truncate_text(text: &str, max_bytes: usize) -> Option<String> {
    if text.len() <= max_bytes {
        return None;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    Some(format!("{}{}", &text[..end], truncation_marker(text.len() - end)))
}

fn truncation_marker(dropped: usize) -> String {
    format!("\n...[truncated {dropped} bytes]")
}
