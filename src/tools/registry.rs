//! 工具注册表
//!
//! 所有工具实现 Tool trait，必须预先声明能力标签与超时；ToolRegistry 按名注册与查找，
//! 重名注册失败。多个会话并发读，注册为写操作。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{AgentError, ToolPayload};

/// 工具参数：字符串键、JSON 值
pub type ToolArgs = Map<String, Value>;

/// 能力标签：决定执行前是否需要用户审批
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FilesystemWrite,
    ProcessExec,
    Network,
    None,
}

impl Capability {
    pub fn requires_approval(self) -> bool {
        !matches!(self, Capability::None)
    }
}

/// 工具 trait：名称、描述、能力、超时、参数 schema、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（对应动作 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供模型理解功能）
    fn description(&self) -> &str;

    fn capability(&self) -> Capability;

    /// 单次调用的时限
    fn timeout(&self) -> Duration;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<ToolPayload, String>;
}

/// prompt 中的单个工具条目
#[derive(Clone, Debug, Serialize)]
pub struct ToolManifestEntry {
    pub name: String,
    pub description: String,
    pub capability: Capability,
    pub timeout_secs: u64,
    pub parameters: Value,
}

#[derive(Default)]
struct Inner {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// 注册顺序（manifest 输出稳定）
    order: Vec<String>,
}

#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let name = tool.name().to_string();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.tools.contains_key(&name) {
            return Err(AgentError::ToolNameConflict(name));
        }
        tracing::debug!(tool = %name, capability = ?tool.capability(), "tool registered");
        inner.order.push(name.clone());
        inner.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tools
            .get(name)
            .cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按注册顺序输出工具清单
    pub fn manifest(&self) -> Vec<ToolManifestEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .order
            .iter()
            .filter_map(|name| inner.tools.get(name))
            .map(|tool| ToolManifestEntry {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                capability: tool.capability(),
                timeout_secs: tool.timeout().as_secs(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str);

    #[async_trait]
    impl Tool for Dummy {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "dummy"
        }
        fn capability(&self) -> Capability {
            Capability::None
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        async fn execute(&self, _args: ToolArgs) -> Result<ToolPayload, String> {
            Ok("ok".into())
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Dummy("echo"))).unwrap();
        match registry.register(Arc::new(Dummy("echo"))) {
            Err(AgentError::ToolNameConflict(name)) => assert_eq!(name, "echo"),
            other => panic!("Expected ToolNameConflict, got {:?}", other),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_manifest_keeps_registration_order() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Dummy("b"))).unwrap();
        registry.register(Arc::new(Dummy("a"))).unwrap();
        let names: Vec<_> = registry.manifest().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_capability_approval() {
        assert!(Capability::ProcessExec.requires_approval());
        assert!(Capability::Network.requires_approval());
        assert!(!Capability::None.requires_approval());
    }
}
