//! 可观测性：日志初始化与 provider 遥测
//!
//! 网关每次服务请求（或耗尽全部后端）都会向 TelemetrySink 发出一条 TelemetryEvent；
//! 默认实现写结构化 tracing 事件，外部监控系统可自行实现该 trait。

use std::sync::Mutex;

use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::llm::{ProviderTier, TokenUsage};

/// 日志：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 单次网关调用的遥测事件
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    /// 实际服务请求的后端；全部失败时为最后尝试的后端
    pub provider: String,
    pub tier: Option<ProviderTier>,
    pub category: String,
    pub latency_ms: u64,
    pub usage: TokenUsage,
    pub attempts: usize,
    pub success: bool,
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &TelemetryEvent);
}

/// 默认遥测：输出 JSON 结构化日志
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        if event.success {
            tracing::info!(telemetry = %payload, "provider_invocation");
        } else {
            tracing::warn!(telemetry = %payload, "provider_invocation");
        }
    }
}

/// 记录所有事件（测试用）
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record(&self, event: &TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
