//! 后端抽象
//!
//! 远程 API 与本地推理服务统一实现 LlmBackend：invoke(request) -> (text, usage) 或 BackendError。
//! BackendError 的分类决定网关的重试/回退路径。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单次调用的 token 使用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// 后端报告的结束原因；Length 表示输出被截断
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    #[default]
    Unknown,
}

/// 发往后端的请求：prompt + 检索上下文 + system + max_tokens
#[derive(Debug, Clone, Default)]
pub struct BackendRequest {
    pub prompt: String,
    pub context: Vec<String>,
    pub system: Option<String>,
    pub max_tokens: u32,
}

impl BackendRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: Vec::new(),
            system: None,
            max_tokens: 1024,
        }
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// 将检索到的上下文拼成一段文本（无上下文时为空串）
    pub fn context_block(&self) -> String {
        if self.context.is_empty() {
            return String::new();
        }
        let mut s = String::from("Relevant context:\n");
        for item in &self.context {
            s.push_str(&format!("- {}\n", item));
        }
        s
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackendResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

impl BackendResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
            finish_reason: FinishReason::Stop,
        }
    }
}

/// 后端错误：Timeout / Auth / RateLimited / Network 属于可重试错误
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BackendError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("network error: {0}")]
    Network(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// 错误类别（用于 ProviderResult.error_kind 与遥测）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Auth,
    RateLimited,
    Network,
    Api,
    InvalidResponse,
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_)
                | BackendError::Auth(_)
                | BackendError::RateLimited { .. }
                | BackendError::Network(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Timeout(_) => ErrorKind::Timeout,
            BackendError::Auth(_) => ErrorKind::Auth,
            BackendError::RateLimited { .. } => ErrorKind::RateLimited,
            BackendError::Network(_) => ErrorKind::Network,
            BackendError::Api(_) => ErrorKind::Api,
            BackendError::InvalidResponse(_) => ErrorKind::InvalidResponse,
        }
    }
}

/// 根据错误文本推断类别（客户端库的错误类型在版本间变化，文本更稳定）
pub fn classify_error_text(text: &str) -> BackendError {
    let lower = text.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests")
    {
        BackendError::RateLimited {
            retry_after_ms: None,
        }
    } else if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("incorrect api key")
        || lower.contains("invalid_api_key")
        || lower.contains("authentication")
    {
        BackendError::Auth(text.to_string())
    } else if lower.contains("timed out") || lower.contains("timeout") {
        BackendError::Timeout(text.to_string())
    } else if lower.contains("connection")
        || lower.contains("error sending request")
        || lower.contains("dns")
        || lower.contains("network")
    {
        BackendError::Network(text.to_string())
    } else {
        BackendError::Api(text.to_string())
    }
}

/// 后端 trait：远程 / 本地 / 脚本化实现统一暴露 invoke
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// 后端标识（写入 ProviderResult.provider 与遥测）
    fn name(&self) -> &str;

    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError>;
}
