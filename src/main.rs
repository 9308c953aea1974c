//! Orby 无头入口
//!
//! 加载配置、装配运行时、以命令行参数作为目标运行一次，并把事件流打印到终端。
//! 需要审批的工具调用在终端上询问 y/N。

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use orby::config::load_config;
use orby::react::LoopEvent;
use orby::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orby::observability::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = PathBuf::from(args.remove(i + 1));
            args.remove(i);
            Some(path)
        }
        _ => None,
    };
    let goal = args.join(" ");
    if goal.trim().is_empty() {
        anyhow::bail!("usage: orby [--config FILE] <goal>");
    }

    let cfg = load_config(config_path).context("Failed to load config")?;
    let runtime = Runtime::from_config(cfg)
        .await
        .context("Failed to build runtime")?;
    let mut handle = runtime.spawn_session(None).context("Failed to start session")?;
    handle.submit(goal);

    let stdout = std::io::stdout();
    while let Some(event) = handle.next_event().await {
        match &event {
            LoopEvent::TokenChunk { text } => {
                let mut out = stdout.lock();
                let _ = write!(out, "{text}");
                let _ = out.flush();
            }
            LoopEvent::ToolCallStarted { tool, args, .. } => println!("\n[tool] {tool} {args}"),
            LoopEvent::ToolCallFinished { result } => {
                println!("[tool] {} -> {:?}\n{}", result.tool, result.status, result.payload.as_text());
            }
            LoopEvent::ApprovalRequested { call_id, tool, args } => {
                print!("\nAllow `{tool}` with {args}? [y/N] ");
                let _ = std::io::stdout().flush();
                let approved = tokio::task::spawn_blocking(|| {
                    let mut line = String::new();
                    std::io::stdin().lock().read_line(&mut line).ok();
                    matches!(line.trim(), "y" | "Y" | "yes")
                })
                .await
                .unwrap_or(false);
                handle.approve(call_id, approved);
            }
            LoopEvent::Answer { text } => println!("\n\n{text}"),
            LoopEvent::Aborted { reason, .. } => eprintln!("\naborted: {reason}"),
            LoopEvent::Failed { reason, .. } => eprintln!("\nfailed: {reason}"),
            LoopEvent::StateChanged { .. } => {}
        }
        if event.is_terminal() {
            break;
        }
    }

    handle.shutdown().await;
    Ok(())
}
