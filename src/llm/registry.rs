//! 后端注册表：发现、激活、热切换与基准排名
//!
//! 读多写少：活跃后端指针与描述符列表位于同一把 RwLock 之后，读者要么看到切换前、要么看到切换后的后端。
//! 所有网络探测都在锁外完成，锁内只做指针/列表替换。

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;

use crate::config::{BackendKind, BackendsSection};
use crate::core::AgentError;
use crate::llm::{
    rank, Backend, BenchmarkScore, OllamaBackend, OpenAiCompatBackend, ScriptedBackend,
};

/// 后端描述：仅由注册表在发现/基准时修改，循环只读
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub base_url: String,
    pub protocol: BackendKind,
    pub models: Vec<String>,
    pub last_score: Option<f64>,
    /// 最近一次探测是否可达（从未探测时为 false）
    pub reachable: bool,
}

/// 活跃后端快照（一次读锁内取得，之后无锁使用）
#[derive(Clone)]
pub struct ActiveBackend {
    pub name: String,
    pub model: String,
    pub backend: Arc<dyn Backend>,
}

struct Entry {
    descriptor: BackendDescriptor,
    backend: Arc<dyn Backend>,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<Entry>,
    active: Option<usize>,
}

pub struct BackendRegistry {
    state: RwLock<RegistryState>,
    probe_timeout: Duration,
}

impl BackendRegistry {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            probe_timeout,
        }
    }

    /// 按配置构建全部适配器（声明顺序保留，用于平局）
    pub fn from_config(cfg: &BackendsSection) -> Result<Self, AgentError> {
        let probe = Duration::from_secs(cfg.probe_timeout_secs.max(1));
        let request = Duration::from_secs(cfg.request_timeout_secs.max(1));
        let registry = Self::new(probe);
        for entry in &cfg.entries {
            let backend: Arc<dyn Backend> = match entry.kind {
                BackendKind::Ollama => Arc::new(
                    OllamaBackend::new(&entry.name, &entry.base_url, entry.default_model.clone(), request)
                        .with_probe_timeout(probe),
                ),
                BackendKind::OpenaiCompat => Arc::new(
                    OpenAiCompatBackend::new(
                        &entry.name,
                        &entry.base_url,
                        entry.default_model.clone(),
                        entry.api_key.as_deref(),
                        request,
                    )
                    .with_probe_timeout(probe),
                ),
                BackendKind::Mock => Arc::new(ScriptedBackend::new(&entry.name, Vec::new())),
            };
            registry.register(backend)?;
        }
        Ok(registry)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册适配器；重名返回 Config 错误
    pub fn register(&self, backend: Arc<dyn Backend>) -> Result<(), AgentError> {
        let mut state = self.write();
        if state.entries.iter().any(|e| e.descriptor.name == backend.name()) {
            return Err(AgentError::Config(format!(
                "duplicate backend name: {}",
                backend.name()
            )));
        }
        let descriptor = BackendDescriptor {
            name: backend.name().to_string(),
            base_url: backend.base_url().to_string(),
            protocol: backend.protocol(),
            models: backend.default_model().map(|m| vec![m.to_string()]).unwrap_or_default(),
            last_score: None,
            reachable: false,
        };
        state.entries.push(Entry { descriptor, backend });
        Ok(())
    }

    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.read().entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<BackendDescriptor> {
        self.read()
            .entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(|e| e.descriptor.clone())
    }

    /// 当前活跃后端（原子快照）
    pub fn active(&self) -> Option<ActiveBackend> {
        let state = self.read();
        let entry = state.entries.get(state.active?)?;
        let model = entry
            .backend
            .default_model()
            .map(String::from)
            .or_else(|| entry.descriptor.models.first().cloned())
            .unwrap_or_default();
        Some(ActiveBackend {
            name: entry.descriptor.name.clone(),
            model,
            backend: entry.backend.clone(),
        })
    }

    pub fn active_name(&self) -> Option<String> {
        let state = self.read();
        state.active.map(|i| state.entries[i].descriptor.name.clone())
    }

    fn backend_by_name(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.read()
            .entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(|e| e.backend.clone())
    }

    async fn probe(&self, backend: &Arc<dyn Backend>) -> bool {
        tokio::time::timeout(self.probe_timeout, backend.health_check())
            .await
            .unwrap_or(false)
    }

    /// 切换活跃后端；不可达时失败并保留原后端
    pub async fn activate(&self, name: &str) -> Result<BackendDescriptor, AgentError> {
        let backend = self
            .backend_by_name(name)
            .ok_or_else(|| AgentError::Config(format!("unknown backend: {name}")))?;
        let reachable = self.probe(&backend).await;

        let mut state = self.write();
        let idx = state
            .entries
            .iter()
            .position(|e| e.descriptor.name == name)
            .ok_or_else(|| AgentError::Config(format!("unknown backend: {name}")))?;
        state.entries[idx].descriptor.reachable = reachable;
        if !reachable {
            tracing::warn!(backend = %name, "activation refused: backend unreachable");
            return Err(AgentError::BackendUnreachable(name.to_string()));
        }
        let previous = state.active.map(|i| state.entries[i].descriptor.name.clone());
        state.active = Some(idx);
        tracing::info!(from = ?previous, to = %name, "active backend switched");
        Ok(state.entries[idx].descriptor.clone())
    }

    /// 并发探测全部后端；成功者整体替换模型列表，失败者标记不可达但保留
    pub async fn discover(&self) -> Vec<BackendDescriptor> {
        let backends: Vec<Arc<dyn Backend>> =
            self.read().entries.iter().map(|e| e.backend.clone()).collect();

        let probes = backends.iter().map(|backend| async move {
            let result = tokio::time::timeout(self.probe_timeout, backend.list_models()).await;
            let result = match result {
                Ok(r) => r,
                Err(_) => Err(AgentError::BackendUnreachable(format!(
                    "{}: probe timed out",
                    backend.name()
                ))),
            };
            (backend.name().to_string(), result)
        });
        let results = join_all(probes).await;

        let mut state = self.write();
        for (name, result) in results {
            let Some(entry) = state.entries.iter_mut().find(|e| e.descriptor.name == name) else {
                continue;
            };
            match result {
                Ok(models) => {
                    tracing::info!(backend = %name, models = models.len(), "backend discovered");
                    entry.descriptor.models = models;
                    entry.descriptor.reachable = true;
                }
                Err(e) => {
                    tracing::info!(backend = %name, error = %e, "backend unreachable");
                    entry.descriptor.reachable = false;
                }
            }
        }
        state.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    /// 没有活跃后端时，依次尝试首选后端与其余可达后端（声明顺序）
    pub async fn ensure_active(&self, preferred: &str) -> Option<String> {
        if let Some(name) = self.active_name() {
            return Some(name);
        }
        let mut order: Vec<String> = vec![preferred.to_string()];
        order.extend(
            self.descriptors()
                .into_iter()
                .filter(|d| d.reachable && d.name != preferred)
                .map(|d| d.name),
        );
        for name in order {
            if self.activate(&name).await.is_ok() {
                return Some(name);
            }
        }
        None
    }

    /// 对每个可达后端跑基准，记录分数并返回排名（高分在前，平局按声明顺序）
    pub async fn benchmark(&self) -> Vec<BenchmarkScore> {
        let targets: Vec<(Arc<dyn Backend>, String)> = self
            .read()
            .entries
            .iter()
            .filter(|e| e.descriptor.reachable)
            .filter_map(|e| {
                let model = e
                    .backend
                    .default_model()
                    .map(String::from)
                    .or_else(|| e.descriptor.models.first().cloned())?;
                Some((e.backend.clone(), model))
            })
            .collect();

        // 逐个运行，避免并发互相拖慢延迟
        let mut scores = Vec::with_capacity(targets.len());
        for (backend, model) in targets {
            scores.push(backend.benchmark(&model).await);
        }

        {
            let mut state = self.write();
            for score in &scores {
                if let Some(entry) = state.entries.iter_mut().find(|e| e.descriptor.name == score.backend) {
                    entry.descriptor.last_score = Some(score.score);
                }
            }
        }

        rank(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(backends: Vec<ScriptedBackend>) -> BackendRegistry {
        let registry = BackendRegistry::new(Duration::from_millis(200));
        for b in backends {
            registry.register(Arc::new(b)).unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_activate_unreachable_keeps_previous() {
        let registry = registry_with(vec![
            ScriptedBackend::new("ollama", Vec::new()),
            ScriptedBackend::new("lmstudio", Vec::new()).unreachable(),
        ]);
        registry.activate("ollama").await.unwrap();
        match registry.activate("lmstudio").await {
            Err(AgentError::BackendUnreachable(name)) => assert_eq!(name, "lmstudio"),
            other => panic!("Expected BackendUnreachable, got {:?}", other.map(|d| d.name)),
        }
        assert_eq!(registry.active_name().as_deref(), Some("ollama"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let registry = registry_with(vec![ScriptedBackend::new("a", Vec::new())]);
        assert!(matches!(
            registry.register(Arc::new(ScriptedBackend::new("a", Vec::new()))),
            Err(AgentError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_keeps_unreachable_and_their_models() {
        let registry = registry_with(vec![
            ScriptedBackend::new("up", Vec::new()).with_models(&["llama3", "qwen2"]),
            ScriptedBackend::new("down", Vec::new()).with_models(&["phi3"]),
        ]);
        let descriptors = registry.discover().await;
        assert_eq!(descriptors.len(), 2);
        assert!(descriptors[0].reachable);
        assert_eq!(descriptors[0].models, vec!["llama3", "qwen2"]);

        // down 变为不可达：保留描述符与旧模型列表
        let registry = registry_with(vec![
            ScriptedBackend::new("down", Vec::new()).with_models(&["phi3"]).unreachable(),
        ]);
        let descriptors = registry.discover().await;
        assert!(!descriptors[0].reachable);
        assert_eq!(descriptors[0].models, vec!["phi3"]);
    }

    #[tokio::test]
    async fn test_ensure_active_falls_back_in_declaration_order() {
        let registry = registry_with(vec![
            ScriptedBackend::new("ollama", Vec::new()).unreachable(),
            ScriptedBackend::new("lmstudio", Vec::new()),
            ScriptedBackend::new("vllm", Vec::new()),
        ]);
        registry.discover().await;
        assert_eq!(registry.ensure_active("ollama").await.as_deref(), Some("lmstudio"));
    }

    #[tokio::test]
    async fn test_benchmark_records_last_score_per_backend() {
        let registry = registry_with(vec![
            ScriptedBackend::from_texts("first", &["Four.", "Recursion calls itself.", "Red, blue, yellow."]),
            ScriptedBackend::from_texts("second", &["Four.", "Recursion calls itself.", "Red, blue, yellow."]),
        ]);
        registry.discover().await;
        let ranking = registry.benchmark().await;
        assert_eq!(ranking.len(), 2);
        assert!(ranking.iter().all(|s| s.score > 90.0));
        for score in &ranking {
            assert_eq!(registry.descriptor(&score.backend).unwrap().last_score, Some(score.score));
        }
    }
}
