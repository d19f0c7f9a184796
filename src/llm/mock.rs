//! Mock 后端（用于测试与离线运行，无需 API）
//!
//! - MockBackend：回显 prompt 并附完成标记，便于本地跑通完整流程
//! - ScriptedBackend：按脚本依次返回预设响应或错误，并记录调用次数与 prompt

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{BackendError, BackendRequest, BackendResponse, FinishReason, LlmBackend, TokenUsage};

/// Mock 后端：回显 prompt 的第一行
#[derive(Debug, Default)]
pub struct MockBackend;

#[async_trait]
impl LlmBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let first_line = request.prompt.lines().next().unwrap_or("(no input)");
        Ok(BackendResponse {
            text: format!("Echo from Mock: {}\n[[DONE]]", first_line),
            usage: TokenUsage::new(request.prompt.len() as u64 / 4, 8),
            finish_reason: FinishReason::Stop,
        })
    }
}

/// 脚本化后端：每次调用弹出一条预设结果；脚本耗尽后返回 Api 错误
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Result<BackendResponse, BackendError>>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// 以一组文本响应初始化脚本
    pub fn with_responses<I, S>(name: impl Into<String>, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backend = Self::new(name);
        for r in responses {
            backend.push_ok(r);
        }
        backend
    }

    /// 每次调用前等待（模拟进行中的网络调用）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_ok(&self, text: impl Into<String>) {
        self.push(Ok(BackendResponse {
            text: text.into(),
            usage: TokenUsage::new(10, 20),
            finish_reason: FinishReason::Stop,
        }));
    }

    pub fn push_err(&self, err: BackendError) {
        self.push(Err(err));
    }

    pub fn push(&self, item: Result<BackendResponse, BackendError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.prompt.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Err(BackendError::Api("script exhausted".to_string())))
    }
}
