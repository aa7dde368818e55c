//! aura-llm: LLM backend abstraction layer.
//! Implements the LlmBackend trait and the local/remote backend selection
//! used by the extraction engine.

pub mod backend;
pub mod router;

pub use backend::{LlmBackend, LlmError, LlmRequest, LlmResponse, Message};
pub use router::{build_backend, definition_model, BackendKind, OllamaSettings, RemoteProvider, RemoteSettings};
