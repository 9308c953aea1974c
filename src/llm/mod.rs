//! 推理后端层：统一流式接口、具体适配器（Ollama / OpenAI 兼容 / 脚本）、注册表与基准、嵌入

pub mod benchmark;
pub mod embedding;
pub mod mock;
pub mod ollama;
pub mod openai_compat;
pub mod registry;
pub mod traits;

pub use benchmark::{rank, BenchmarkScore, BENCHMARK_PROMPTS};
pub use embedding::{EmbeddingProvider, OllamaEmbedder};
pub use mock::{ScriptStep, ScriptedBackend};
pub use ollama::OllamaBackend;
pub use openai_compat::OpenAiCompatBackend;
pub use registry::{ActiveBackend, BackendDescriptor, BackendRegistry};
pub use traits::{
    Backend, ChatMessage, ChatRole, GenerateOptions, GenerationEvent, GenerationStats, GenerationStream,
};
