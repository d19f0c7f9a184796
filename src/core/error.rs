//! 引擎错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 EngineError 决定 Retry / Skip / Degrade / Abort。
//! Provider 级错误在网关内部重试/回退，只有 ProviderExhausted 会上浮到任务状态机。

use thiserror::Error;

use crate::core::task::{TaskCategory, TaskStatus};

/// 任务与工作流执行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// 分类置信度不足，已套用默认类别（非致命）
    #[error("Classification ambiguous (confidence {confidence:.2}), defaulted to {applied}")]
    ClassificationAmbiguous {
        confidence: f32,
        applied: TaskCategory,
    },

    /// 单个后端不可用，触发回退
    #[error("Provider '{provider}' unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    /// 主备后端均失败，附带聚合诊断
    #[error("All providers exhausted: {0}")]
    ProviderExhausted(String),

    /// 续写次数达到上限（不是失败，任务以 Completed 结束并附注）
    #[error("Continuation limit reached after {0} iterations")]
    ContinuationLimitReached(u32),

    #[error("Safety denied: {0}")]
    SafetyDenied(String),

    /// 高风险动作确认超时，等同于 SafetyDenied
    #[error("Confirmation timed out: {0}")]
    ConfirmationTimeout(String),

    #[error("Action timed out: {0}")]
    ActionTimeout(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    /// 记忆库不可用，任务以降级模式继续
    #[error("Memory unavailable: {0}")]
    MemoryUnavailable(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl EngineError {
    /// 可恢复错误：按步骤策略重试或跳过，不会中止整个工作流
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::ClassificationAmbiguous { .. }
                | EngineError::ProviderUnavailable { .. }
                | EngineError::ActionTimeout(_)
                | EngineError::ActionFailed(_)
                | EngineError::MemoryUnavailable(_)
        )
    }

    /// 安全拒绝类错误（含确认超时），永远不自动重试
    pub fn is_safety_denial(&self) -> bool {
        matches!(
            self,
            EngineError::SafetyDenied(_) | EngineError::ConfirmationTimeout(_)
        )
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 在步骤预算内再试一次
    Retry,
    /// 记录失败并继续后续步骤
    Skip,
    /// 以降级模式继续（如记忆库不可用）
    Degrade,
    /// 终止当前工作流
    Abort,
}
