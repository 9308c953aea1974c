//! 运行时编排：从配置装配后端注册表、工具执行器与记忆，并为每个会话启动一个后台循环任务
//!
//! 每个会话有独立的命令通道（Submit/Save/Quit）、事件通道与审批通道；
//! 多个会话共享 BackendRegistry 与 ToolRegistry（二者均为单写多读）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::{AgentError, ApprovalDecision, ApprovalInbox, ApprovalPolicy, SessionSupervisor};
use crate::llm::{BackendRegistry, EmbeddingProvider, OllamaEmbedder};
use crate::memory::{MemoryStore, PersistentMemory, Session, SessionStore, SessionSummary, SqliteMemory};
use crate::react::{run_goal, LoopContext, LoopEvent, Planner};
use crate::tools::{build_default_registry, Sandbox, ToolExecutor};

/// 发往会话任务的命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 提交一个目标，触发一次循环
    Submit(String),
    /// 立即保存会话
    Save,
    /// 结束会话任务
    Quit,
}

/// 多会话共享的运行时
pub struct Runtime {
    config: AppConfig,
    backends: Arc<BackendRegistry>,
    executor: Arc<ToolExecutor>,
    planner: Arc<Planner>,
    persistent: Option<Arc<dyn PersistentMemory>>,
    sessions: SessionStore,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl Runtime {
    /// 由已构建的组件创建（不含持久记忆与嵌入）
    pub fn new(config: AppConfig, backends: Arc<BackendRegistry>, executor: Arc<ToolExecutor>) -> Self {
        let planner = Arc::new(Planner::new(
            config.agent.system_prompt.as_deref(),
            config.app.context_window,
        ));
        let sessions = SessionStore::new(&config.app.session_dir);
        Self {
            config,
            backends,
            executor,
            planner,
            persistent: None,
            sessions,
            embedder: None,
        }
    }

    /// 完整装配：沙箱无法建立即返回 Config 错误；持久记忆打不开只降级
    pub async fn from_config(config: AppConfig) -> Result<Self, AgentError> {
        let sandbox = Sandbox::new(&config.tools.workspace_root, config.tools.env_allowlist.clone())?;
        tracing::info!(workspace = %sandbox.root().display(), "sandbox ready");
        let tools = build_default_registry(&config.tools, &sandbox)?;
        let executor = Arc::new(ToolExecutor::new(Arc::new(tools), config.tools.max_output_bytes));

        let backends = Arc::new(BackendRegistry::from_config(&config.backends)?);
        backends.discover().await;
        match backends.ensure_active(&config.backends.active).await {
            Some(name) => tracing::info!(backend = %name, "active backend"),
            None => tracing::warn!("no reachable backend; goals will fail until one is activated"),
        }

        let persistent: Option<Arc<dyn PersistentMemory>> = match SqliteMemory::open(&config.app.memory_db) {
            Ok(db) => Some(Arc::new(db)),
            Err(e) => {
                tracing::warn!(error = %e, "persistent memory unavailable, continuing with session memory only");
                None
            }
        };
        let embedder: Option<Arc<dyn EmbeddingProvider>> = config
            .app
            .embedding_model
            .as_deref()
            .map(|model| Arc::new(OllamaEmbedder::new(&config.app.embedding_url, model)) as Arc<dyn EmbeddingProvider>);

        Ok(Self::new(config, backends, executor)
            .with_persistent(persistent)
            .with_embedder(embedder))
    }

    pub fn with_persistent(mut self, persistent: Option<Arc<dyn PersistentMemory>>) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, AgentError> {
        self.sessions.list()
    }

    pub fn delete_session(&self, id: &str) -> Result<bool, AgentError> {
        self.sessions.delete(id)
    }

    /// 启动一个会话任务；resume 为已保存会话的 id
    pub fn spawn_session(&self, resume: Option<&str>) -> Result<SessionHandle, AgentError> {
        let memory = match resume {
            Some(id) => MemoryStore::load(self.sessions.clone(), id)?,
            None => MemoryStore::new(Session::new(
                self.backends.active_name(),
                self.config.agent.auto_approve,
            ))
            .with_session_store(self.sessions.clone()),
        }
        .with_persistent(self.persistent.clone())
        .with_embedder(self.embedder.clone());

        let session_id = memory.session_id().to_string();
        let policy = ApprovalPolicy::from_auto_approve(memory.session().auto_approve);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (approval_tx, inbox) =
            ApprovalInbox::channel(Duration::from_secs(self.config.agent.approval_timeout_secs));
        let supervisor = SessionSupervisor::new();

        let worker = SessionWorker {
            backends: self.backends.clone(),
            executor: self.executor.clone(),
            planner: self.planner.clone(),
            policy,
            max_iterations: self.config.agent.max_iterations,
            retrieve_k: self.config.app.retrieve_k,
            persist_session: self.config.app.persist_sessions,
            supervisor: supervisor.clone(),
        };
        tracing::info!(session = %session_id, policy = ?policy, "session started");
        let join = tokio::spawn(worker.run(memory, inbox, cmd_rx, event_tx));

        Ok(SessionHandle {
            session_id,
            commands: cmd_tx,
            events: event_rx,
            approvals: approval_tx,
            supervisor,
            join,
        })
    }
}

/// 会话任务持有的共享组件
struct SessionWorker {
    backends: Arc<BackendRegistry>,
    executor: Arc<ToolExecutor>,
    planner: Arc<Planner>,
    policy: ApprovalPolicy,
    max_iterations: usize,
    retrieve_k: usize,
    persist_session: bool,
    supervisor: SessionSupervisor,
}

impl SessionWorker {
    async fn run(
        self,
        mut memory: MemoryStore,
        mut inbox: ApprovalInbox,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        event_tx: mpsc::UnboundedSender<LoopEvent>,
    ) {
        while let Some(cmd) = cmd_rx.recv().await {
            if self.supervisor.is_shutdown() {
                break;
            }
            match cmd {
                Command::Submit(goal) => {
                    let cancel = self.supervisor.begin_goal();
                    let ctx = LoopContext::new(&self.backends, &self.executor, &self.planner)
                        .with_policy(self.policy)
                        .with_max_iterations(self.max_iterations)
                        .with_retrieve_k(self.retrieve_k)
                        .with_persist_session(self.persist_session)
                        .with_event_tx(&event_tx);
                    run_goal(&ctx, &mut memory, &mut inbox, &goal, &cancel).await;
                }
                Command::Save => match memory.persist().await {
                    Ok(path) => tracing::info!(path = %path.display(), "session saved"),
                    Err(e) => tracing::warn!(error = %e, "session save failed"),
                },
                Command::Quit => break,
            }
        }
        tracing::info!(session = %memory.session_id(), "session closed");
    }
}

/// 会话句柄：展示层通过它驱动循环，不直接读取状态
pub struct SessionHandle {
    pub session_id: String,
    pub commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<LoopEvent>,
    pub approvals: mpsc::UnboundedSender<ApprovalDecision>,
    supervisor: SessionSupervisor,
    join: JoinHandle<()>,
}

impl SessionHandle {
    pub fn submit(&self, goal: impl Into<String>) -> bool {
        self.commands.send(Command::Submit(goal.into())).is_ok()
    }

    pub fn approve(&self, call_id: &str, approved: bool) -> bool {
        self.approvals
            .send(ApprovalDecision {
                call_id: call_id.to_string(),
                approved,
            })
            .is_ok()
    }

    pub fn save(&self) -> bool {
        self.commands.send(Command::Save).is_ok()
    }

    /// 取消当前目标；会话本身继续可用
    pub fn cancel(&self) {
        self.supervisor.cancel();
    }

    /// 下一个事件；会话任务结束后返回 None
    pub async fn next_event(&mut self) -> Option<LoopEvent> {
        self.events.recv().await
    }

    /// 结束会话：取消进行中的目标并等待任务退出
    pub async fn shutdown(self) {
        self.supervisor.shutdown();
        let _ = self.commands.send(Command::Quit);
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "session task ended abnormally");
        }
    }
}
