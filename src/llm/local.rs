//! 本地推理服务后端（Ollama 兼容 /api/generate）
//!
//! 作为网关的二级后端：非流式请求，num_predict 对应 max_tokens；HTTP 状态码映射为 BackendError。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::llm::{BackendError, BackendRequest, BackendResponse, FinishReason, LlmBackend, TokenUsage};

pub const DEFAULT_LOCAL_URL: &str = "http://127.0.0.1:11434";

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

/// 本地二级后端
pub struct LocalBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
    name: String,
}

impl LocalBackend {
    pub fn new(base_url: Option<&str>, model: &str, timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_LOCAL_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            name: format!("local:{}", model),
        })
    }

    fn map_reqwest_error(err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            BackendError::Network(err.to_string())
        } else if err.is_decode() {
            BackendError::InvalidResponse(err.to_string())
        } else {
            BackendError::Api(err.to_string())
        }
    }
}

fn map_status(status: reqwest::StatusCode, body: String) -> BackendError {
    match status.as_u16() {
        401 | 403 => BackendError::Auth(body),
        429 => BackendError::RateLimited {
            retry_after_ms: None,
        },
        408 | 504 => BackendError::Timeout(body),
        502 | 503 => BackendError::Network(body),
        code => BackendError::Api(format!("HTTP {}: {}", code, body)),
    }
}

#[async_trait]
impl LlmBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let context = request.context_block();
        let prompt = if context.is_empty() {
            request.prompt.clone()
        } else {
            format!("{}\n{}", context, request.prompt)
        };
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            system: request.system.as_deref(),
            stream: false,
            options: GenerateOptions {
                num_predict: request.max_tokens,
            },
        };

        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(Self::map_reqwest_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_status(status, text));
        }

        let parsed: GenerateResponse = resp.json().await.map_err(Self::map_reqwest_error)?;
        let finish_reason = match parsed.done_reason.as_deref() {
            Some("length") => FinishReason::Length,
            Some(_) => FinishReason::Stop,
            None => FinishReason::Unknown,
        };
        Ok(BackendResponse {
            text: parsed.response,
            usage: TokenUsage::new(
                parsed.prompt_eval_count.unwrap_or(0),
                parsed.eval_count.unwrap_or(0),
            ),
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status() {
        assert!(matches!(
            map_status(reqwest::StatusCode::UNAUTHORIZED, String::new()),
            BackendError::Auth(_)
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new()),
            BackendError::RateLimited { .. }
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, String::new()),
            BackendError::Network(_)
        ));
        assert!(matches!(
            map_status(reqwest::StatusCode::BAD_REQUEST, "bad".into()),
            BackendError::Api(_)
        ));
    }

    #[test]
    fn test_new_trims_base_url() {
        let backend =
            LocalBackend::new(Some("http://localhost:11434/"), "llama3", Duration::from_secs(5))
                .unwrap();
        assert_eq!(backend.base_url, "http://localhost:11434");
        assert_eq!(backend.name(), "local:llama3");
    }
}
