//! 自主执行器：执行一个已通过安全校验的动作并观察状态变化
//!
//! - 只执行 allow 或已确认的 require_confirmation 动作（直接调用也会拒绝未授权动作）
//! - 每个动作有独立超时；超时只中止当前动作（可恢复），不影响整个工作流
//! - 高风险动作在执行前等待确认，确认超时视为拒绝
//! - 每次执行输出一条 JSON 审计日志

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::autonomy::action::{Action, ActionResult, SafetyDecision, StateDelta, Verdict};
use crate::autonomy::confirm::{AutoDeny, Confirmer};
use crate::autonomy::environment::Environment;
use crate::core::EngineError;

#[derive(Debug, Clone)]
pub struct ExecutorLimits {
    pub action_timeout: Duration,
    /// 单个工作流步骤（含重试）的总时长预算
    pub step_budget: Duration,
    pub max_attempts_per_step: u32,
    pub confirmation_timeout: Duration,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(30),
            step_budget: Duration::from_secs(120),
            max_attempts_per_step: 3,
            confirmation_timeout: Duration::from_secs(60),
        }
    }
}

pub struct AutonomousExecutor {
    env: Arc<dyn Environment>,
    confirmer: Arc<dyn Confirmer>,
    limits: ExecutorLimits,
}

impl AutonomousExecutor {
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self {
            env,
            confirmer: Arc::new(AutoDeny),
            limits: ExecutorLimits::default(),
        }
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    pub fn with_limits(mut self, limits: ExecutorLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &ExecutorLimits {
        &self.limits
    }

    /// 把校验结果变成可执行授权：deny → SafetyDenied；require_confirmation 等待确认
    pub async fn authorize(
        &self,
        action: &Action,
        decision: SafetyDecision,
    ) -> Result<SafetyDecision, EngineError> {
        match decision.verdict {
            Verdict::Allow => Ok(decision),
            Verdict::Deny => Err(EngineError::SafetyDenied(decision.reason_text().to_string())),
            Verdict::RequireConfirmation => {
                if decision.confirmed {
                    return Ok(decision);
                }
                let reason = decision.reason_text().to_string();
                match timeout(
                    self.limits.confirmation_timeout,
                    self.confirmer.confirm(action, &reason),
                )
                .await
                {
                    Ok(true) => Ok(SafetyDecision {
                        confirmed: true,
                        ..decision
                    }),
                    Ok(false) => Err(EngineError::SafetyDenied(format!(
                        "confirmation declined: {}",
                        reason
                    ))),
                    Err(_) => Err(EngineError::ConfirmationTimeout(format!(
                        "no answer within {}s: {}",
                        self.limits.confirmation_timeout.as_secs(),
                        reason
                    ))),
                }
            }
        }
    }

    /// 在默认动作超时内执行
    pub async fn execute(
        &self,
        action: &Action,
        decision: &SafetyDecision,
    ) -> Result<ActionResult, EngineError> {
        self.execute_within(action, decision, self.limits.action_timeout)
            .await
    }

    /// 在步骤截止时间与动作超时中较早者之前执行
    pub async fn execute_with_deadline(
        &self,
        action: &Action,
        decision: &SafetyDecision,
        deadline: Instant,
    ) -> Result<ActionResult, EngineError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EngineError::ActionTimeout(format!(
                "step budget exhausted before {}",
                action.id
            )));
        }
        self.execute_within(action, decision, remaining.min(self.limits.action_timeout))
            .await
    }

    async fn execute_within(
        &self,
        action: &Action,
        decision: &SafetyDecision,
        limit: Duration,
    ) -> Result<ActionResult, EngineError> {
        if decision.action_id != action.id || !decision.is_executable() {
            audit(action, decision, "refused", 0, None);
            return Err(EngineError::SafetyDenied(format!(
                "action {} has no executable safety decision",
                action.id
            )));
        }

        let start = Instant::now();
        let before = match self.env.observe().await {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(action_id = %action.id, error = %e, "observe before action failed");
                None
            }
        };

        let outcome = timeout(limit, self.env.act(action)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut result = match outcome {
            Ok(result) => result,
            Err(_) => {
                audit(action, decision, "timeout", duration_ms, None);
                return Err(EngineError::ActionTimeout(format!(
                    "{} exceeded {}ms",
                    action.describe(),
                    limit.as_millis()
                )));
            }
        };

        if let (Some(before), Ok(after)) = (before, self.env.observe().await) {
            result.state_delta = StateDelta::between(&before, &after);
        }
        result.duration_ms = duration_ms;
        let label = if result.success { "ok" } else { "error" };
        audit(action, decision, label, duration_ms, Some(&result));
        Ok(result)
    }
}

fn audit(
    action: &Action,
    decision: &SafetyDecision,
    outcome: &str,
    duration_ms: u64,
    result: Option<&ActionResult>,
) {
    let audit = serde_json::json!({
        "event": "action_audit",
        "action_id": action.id,
        "kind": action.kind,
        "target": action.target,
        "risk": action.risk_level,
        "verdict": decision.verdict,
        "confirmed": decision.confirmed,
        "outcome": outcome,
        "duration_ms": duration_ms,
        "delta": result.map(|r| &r.state_delta),
        "error": result.and_then(|r| r.error.as_deref()),
    });
    tracing::info!(audit = %audit.to_string(), "action");
}
