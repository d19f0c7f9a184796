//! LLM 层：后端抽象、远程 / 本地 / 脚本化实现、主备网关与嵌入

pub mod embedding;
pub mod gateway;
pub mod local;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{create_embedder_from_config, Embedder, HashingEmbedder, OpenAiEmbedder};
pub use gateway::{
    AttemptRecord, GatewayError, GatewayState, ProviderGateway, ProviderResult, ProviderTier,
    RetryPolicy, MAX_PRIMARY_RETRIES,
};
pub use local::{LocalBackend, DEFAULT_LOCAL_URL};
pub use mock::{MockBackend, ScriptedBackend};
pub use openai::RemoteBackend;
pub use traits::{
    classify_error_text, BackendError, BackendRequest, BackendResponse, ErrorKind, FinishReason,
    LlmBackend, TokenUsage,
};
