//! Provider-agnostic LLM access: the model-client trait, the
//! OpenAI-compatible adapter, shared SSE streaming plumbing, and the
//! model-alias registry.

pub mod openai_compat;
pub mod registry;
pub mod sse;
pub mod traits;

pub use openai_compat::OpenAiCompatClient;
pub use registry::{ModelRegistry, ResolvedModel};
pub use traits::{ChatRequest, ChatResponse, Embedder, LlmClient};
