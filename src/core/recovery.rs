//! 错误恢复引擎
//!
//! 根据 EngineError 类型与步骤的失败策略返回 RecoveryAction，供 WorkflowManager 决定是重试、跳过还是终止。

use serde::{Deserialize, Serialize};

use crate::core::{EngineError, RecoveryAction};

/// 步骤失败策略（仅作用于可恢复错误；安全拒绝永远终止）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// 任何失败都终止工作流
    Abort,
    /// 可恢复失败时跳过并继续
    Skip,
    /// 可恢复失败时最多再试 n 次，仍失败则跳过
    Retry(u32),
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Skip
    }
}

/// 将错误映射为可执行动作（重试 / 跳过 / 降级 / 终止）
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// attempts_made：该步骤已执行的次数（含本次失败），从 1 开始
    pub fn handle(
        &self,
        err: &EngineError,
        policy: FailurePolicy,
        attempts_made: u32,
    ) -> RecoveryAction {
        match err {
            e if e.is_safety_denial() => RecoveryAction::Abort,
            EngineError::Cancelled => RecoveryAction::Abort,
            EngineError::MemoryUnavailable(_) | EngineError::ClassificationAmbiguous { .. } => {
                RecoveryAction::Degrade
            }
            e if e.is_recoverable() => match policy {
                FailurePolicy::Retry(n) if attempts_made <= n => RecoveryAction::Retry,
                FailurePolicy::Retry(_) | FailurePolicy::Skip => RecoveryAction::Skip,
                FailurePolicy::Abort => RecoveryAction::Abort,
            },
            _ => RecoveryAction::Abort,
        }
    }
}
