//! AI Provider 网关：主（远程）/ 备（本地）两级后端 + 显式重试回退状态机
//!
//! 状态机：Primary → [PrimaryRetry] → Fallback → Exhausted，成功时进入 Served。
//! - 主后端遇到 Timeout / Auth / RateLimited / Network 时，按策略重试 primary_retries 次（带退避，至多 1 次）
//! - 之后回退到备后端，仅尝试一次
//! - 全部失败返回 GatewayError::Exhausted，携带每次尝试的诊断信息
//!
//! 默认策略 primary_retries = 0：最多 2 次调用（主 1 + 备 1）。

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::handler::handler_for;
use crate::core::{EngineError, TaskCategory};
use crate::llm::{
    BackendError, BackendRequest, ErrorKind, FinishReason, LlmBackend, TokenUsage,
};
use crate::observability::{TelemetryEvent, TelemetrySink, TracingTelemetry};

/// 后端层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTier {
    Primary,
    Secondary,
}

/// 主后端额外重试次数上限
pub const MAX_PRIMARY_RETRIES: u32 = 1;

/// 重试/回退策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 主后端可重试错误时的额外重试次数（不超过 MAX_PRIMARY_RETRIES）
    pub primary_retries: u32,
    /// 首次退避时长，之后指数增长
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// 单次后端调用超时
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            primary_retries: 0,
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// 实际生效的重试次数
    pub fn effective_retries(&self) -> u32 {
        self.primary_retries.min(MAX_PRIMARY_RETRIES)
    }

    /// 第 n 次重试（从 1 开始）前的退避时长
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// 网关状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Primary,
    PrimaryRetry,
    Fallback,
    Exhausted,
    Served(ProviderTier),
}

impl GatewayState {
    /// 失败后的转移；retries_used 为已用的主后端重试次数
    pub fn on_failure(
        self,
        err: &BackendError,
        policy: &RetryPolicy,
        retries_used: u32,
        has_fallback: bool,
    ) -> GatewayState {
        match self {
            GatewayState::Primary | GatewayState::PrimaryRetry => {
                if err.is_retryable() && retries_used < policy.effective_retries() {
                    GatewayState::PrimaryRetry
                } else if has_fallback {
                    GatewayState::Fallback
                } else {
                    GatewayState::Exhausted
                }
            }
            GatewayState::Fallback => GatewayState::Exhausted,
            other => other,
        }
    }
}

/// 单次尝试的诊断记录
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub tier: ProviderTier,
    pub latency_ms: u64,
    pub error: Option<BackendError>,
}

/// 网关返回：服务请求的后端、文本、用量、延迟等
#[derive(Debug, Clone, Serialize)]
pub struct ProviderResult {
    pub provider: String,
    pub tier: ProviderTier,
    pub text: String,
    pub usage: TokenUsage,
    pub latency: Duration,
    pub success: bool,
    /// 最后一次失败的类别（成功但经历过回退时也会保留）
    pub error_kind: Option<ErrorKind>,
    pub finish_reason: FinishReason,
    pub attempts: Vec<AttemptRecord>,
}

/// 主备均失败的终态错误
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("{}", summarize_attempts(.attempts))]
    Exhausted { attempts: Vec<AttemptRecord> },
}

fn summarize_attempts(attempts: &[AttemptRecord]) -> String {
    attempts
        .iter()
        .map(|a| {
            let err = a
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "ok".to_string());
            format!("{} ({:?}, {}ms): {}", a.provider, a.tier, a.latency_ms, err)
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<GatewayError> for EngineError {
    fn from(err: GatewayError) -> Self {
        EngineError::ProviderExhausted(err.to_string())
    }
}

/// 主备两级网关
pub struct ProviderGateway {
    primary: Arc<dyn LlmBackend>,
    secondary: Option<Arc<dyn LlmBackend>>,
    policy: RetryPolicy,
    telemetry: Arc<dyn TelemetrySink>,
}

impl fmt::Debug for ProviderGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderGateway")
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.as_ref().map(|s| s.name().to_string()))
            .field("policy", &self.policy)
            .finish()
    }
}

impl ProviderGateway {
    pub fn new(primary: Arc<dyn LlmBackend>, secondary: Option<Arc<dyn LlmBackend>>) -> Self {
        Self {
            primary,
            secondary,
            policy: RetryPolicy::default(),
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// invoke(prompt, context, category)：按类别取 system prompt 与 max_tokens
    pub async fn invoke(
        &self,
        prompt: &str,
        context: &[String],
        category: TaskCategory,
    ) -> Result<ProviderResult, GatewayError> {
        let handler = handler_for(category);
        let request = BackendRequest::new(prompt)
            .with_context(context.to_vec())
            .with_system(handler.system_prompt())
            .with_max_tokens(handler.max_tokens());
        self.invoke_request(&request, category).await
    }

    /// 以自定义请求调用（如分类器的模型辅助调用）
    pub async fn invoke_request(
        &self,
        request: &BackendRequest,
        category: TaskCategory,
    ) -> Result<ProviderResult, GatewayError> {
        let started = Instant::now();
        let mut state = GatewayState::Primary;
        let mut retries_used = 0u32;
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        loop {
            let (backend, tier) = match state {
                GatewayState::Primary => (&self.primary, ProviderTier::Primary),
                GatewayState::PrimaryRetry => {
                    retries_used += 1;
                    let wait = self.policy.backoff_for(retries_used);
                    tracing::debug!(retry = retries_used, wait_ms = wait.as_millis() as u64, "retrying primary backend");
                    tokio::time::sleep(wait).await;
                    (&self.primary, ProviderTier::Primary)
                }
                GatewayState::Fallback => match &self.secondary {
                    Some(secondary) => (secondary, ProviderTier::Secondary),
                    None => {
                        state = GatewayState::Exhausted;
                        continue;
                    }
                },
                GatewayState::Exhausted | GatewayState::Served(_) => break,
            };

            let call_started = Instant::now();
            let outcome = match tokio::time::timeout(
                self.policy.request_timeout,
                backend.invoke(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(format!(
                    "no response within {}s",
                    self.policy.request_timeout.as_secs()
                ))),
            };
            let latency_ms = call_started.elapsed().as_millis() as u64;

            match outcome {
                Ok(response) => {
                    attempts.push(AttemptRecord {
                        provider: backend.name().to_string(),
                        tier,
                        latency_ms,
                        error: None,
                    });
                    let result = ProviderResult {
                        provider: backend.name().to_string(),
                        tier,
                        text: response.text,
                        usage: response.usage,
                        latency: started.elapsed(),
                        success: true,
                        error_kind: attempts
                            .iter()
                            .rev()
                            .find_map(|a| a.error.as_ref().map(|e| e.kind())),
                        finish_reason: response.finish_reason,
                        attempts,
                    };
                    self.emit(&result.provider, Some(tier), category, &result.usage, result.attempts.len(), true, started);
                    return Ok(result);
                }
                Err(err) => {
                    tracing::warn!(
                        provider = %backend.name(),
                        tier = ?tier,
                        error = %err,
                        "backend call failed"
                    );
                    state = state.on_failure(
                        &err,
                        &self.policy,
                        retries_used,
                        self.secondary.is_some(),
                    );
                    attempts.push(AttemptRecord {
                        provider: backend.name().to_string(),
                        tier,
                        latency_ms,
                        error: Some(err),
                    });
                }
            }
        }

        let last = attempts.last().map(|a| (a.provider.clone(), a.tier));
        let (provider, tier) = match last {
            Some((p, t)) => (p, Some(t)),
            None => (self.primary.name().to_string(), None),
        };
        self.emit(&provider, tier, category, &TokenUsage::default(), attempts.len(), false, started);
        Err(GatewayError::Exhausted { attempts })
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        provider: &str,
        tier: Option<ProviderTier>,
        category: TaskCategory,
        usage: &TokenUsage,
        attempts: usize,
        success: bool,
        started: Instant,
    ) {
        self.telemetry.record(&TelemetryEvent {
            provider: provider.to_string(),
            tier,
            category: category.to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            usage: *usage,
            attempts,
            success,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedBackend;
    use crate::observability::RecordingTelemetry;

    fn fast_policy(primary_retries: u32) -> RetryPolicy {
        RetryPolicy {
            primary_retries,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_primary_success_no_fallback() {
        let primary = Arc::new(ScriptedBackend::with_responses("primary", ["hello"]));
        let secondary = Arc::new(ScriptedBackend::with_responses("secondary", ["unused"]));
        let gateway = ProviderGateway::new(primary.clone(), Some(secondary.clone()));

        let result = gateway.invoke("hi", &[], TaskCategory::Code).await.unwrap();
        assert_eq!(result.text, "hello");
        assert_eq!(result.tier, ProviderTier::Primary);
        assert!(result.success);
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_fallback_on_network_error_two_calls_max() {
        let primary = Arc::new(ScriptedBackend::new("primary"));
        primary.push_err(BackendError::Network("connection refused".into()));
        let secondary = Arc::new(ScriptedBackend::with_responses("secondary", ["from local"]));
        let telemetry = Arc::new(RecordingTelemetry::new());
        let gateway = ProviderGateway::new(primary.clone(), Some(secondary.clone()))
            .with_telemetry(telemetry.clone());

        let result = gateway.invoke("hi", &[], TaskCategory::Rag).await.unwrap();
        assert_eq!(result.text, "from local");
        assert_eq!(result.tier, ProviderTier::Secondary);
        assert_eq!(result.error_kind, Some(ErrorKind::Network));
        assert_eq!(primary.call_count() + secondary.call_count(), 2);

        let events = telemetry.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].provider, "secondary");
        assert_eq!(events[0].attempts, 2);
        assert!(events[0].success);
    }

    #[tokio::test]
    async fn test_retry_primary_once_when_configured() {
        let primary = Arc::new(ScriptedBackend::new("primary"));
        primary.push_err(BackendError::RateLimited { retry_after_ms: None });
        primary.push_ok("second try");
        let secondary = Arc::new(ScriptedBackend::new("secondary"));
        let gateway = ProviderGateway::new(primary.clone(), Some(secondary.clone()))
            .with_policy(fast_policy(1));

        let result = gateway.invoke("hi", &[], TaskCategory::Code).await.unwrap();
        assert_eq!(result.text, "second try");
        assert_eq!(primary.call_count(), 2);
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_primary_retries_capped_at_one() {
        let primary = Arc::new(ScriptedBackend::new("primary"));
        for _ in 0..5 {
            primary.push_err(BackendError::Network("connection reset".into()));
        }
        let secondary = Arc::new(ScriptedBackend::with_responses("secondary", ["local answer"]));
        let gateway = ProviderGateway::new(primary.clone(), Some(secondary.clone()))
            .with_policy(fast_policy(4));

        let result = gateway.invoke("hi", &[], TaskCategory::Code).await.unwrap();
        assert_eq!(result.tier, ProviderTier::Secondary);
        assert_eq!(primary.call_count(), 2);
        assert_eq!(secondary.call_count(), 1);
        assert_eq!(result.attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_skips_primary_retry() {
        let primary = Arc::new(ScriptedBackend::new("primary"));
        primary.push_err(BackendError::Api("bad request".into()));
        let secondary = Arc::new(ScriptedBackend::with_responses("secondary", ["ok"]));
        let gateway = ProviderGateway::new(primary.clone(), Some(secondary.clone()))
            .with_policy(fast_policy(1));

        gateway.invoke("hi", &[], TaskCategory::Code).await.unwrap();
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_aggregates_diagnostics() {
        let primary = Arc::new(ScriptedBackend::new("primary"));
        primary.push_err(BackendError::Auth("invalid key".into()));
        let secondary = Arc::new(ScriptedBackend::new("secondary"));
        secondary.push_err(BackendError::Timeout("slow".into()));
        let telemetry = Arc::new(RecordingTelemetry::new());
        let gateway = ProviderGateway::new(primary, Some(secondary))
            .with_telemetry(telemetry.clone());

        let err = gateway.invoke("hi", &[], TaskCategory::Code).await.unwrap_err();
        let GatewayError::Exhausted { attempts } = &err;
        assert_eq!(attempts.len(), 2);
        let text = err.to_string();
        assert!(text.contains("invalid key"));
        assert!(text.contains("slow"));
        assert!(!telemetry.events()[0].success);

        let engine_err: EngineError = err.into();
        assert!(matches!(engine_err, EngineError::ProviderExhausted(_)));
    }

    #[tokio::test]
    async fn test_request_timeout_counts_as_timeout() {
        let primary = Arc::new(
            ScriptedBackend::with_responses("primary", ["late"]).with_delay(Duration::from_millis(200)),
        );
        let secondary = Arc::new(ScriptedBackend::with_responses("secondary", ["fast"]));
        let policy = RetryPolicy {
            request_timeout: Duration::from_millis(20),
            ..fast_policy(0)
        };
        let gateway = ProviderGateway::new(primary, Some(secondary)).with_policy(policy);

        let result = gateway.invoke("hi", &[], TaskCategory::Code).await.unwrap();
        assert_eq!(result.text, "fast");
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_state_machine_transitions() {
        let policy = fast_policy(1);
        let net = BackendError::Network("x".into());
        let api = BackendError::Api("x".into());
        assert_eq!(
            GatewayState::Primary.on_failure(&net, &policy, 0, true),
            GatewayState::PrimaryRetry
        );
        assert_eq!(
            GatewayState::PrimaryRetry.on_failure(&net, &policy, 1, true),
            GatewayState::Fallback
        );
        assert_eq!(
            GatewayState::Primary.on_failure(&api, &policy, 0, true),
            GatewayState::Fallback
        );
        assert_eq!(
            GatewayState::Primary.on_failure(&api, &policy, 0, false),
            GatewayState::Exhausted
        );
        assert_eq!(
            GatewayState::Fallback.on_failure(&net, &policy, 1, true),
            GatewayState::Exhausted
        );
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let policy = RetryPolicy {
            backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(5), Duration::from_secs(1));
    }
}
