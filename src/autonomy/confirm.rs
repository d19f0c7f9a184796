//! 高风险动作确认
//!
//! ChannelConfirmer 通过 mpsc 把请求交给外部 UI，经 oneshot 取回答复；
//! 超时由 AutonomousExecutor 施加，超时即视为拒绝。

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::autonomy::action::Action;

#[async_trait]
pub trait Confirmer: Send + Sync {
    /// 返回 true 表示批准执行
    async fn confirm(&self, action: &Action, reason: &str) -> bool;
}

/// 全部批准（用于无人值守且已配置 pre_approved 的场景或测试）
#[derive(Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl Confirmer for AutoApprove {
    async fn confirm(&self, _action: &Action, _reason: &str) -> bool {
        true
    }
}

/// 全部拒绝（默认）
#[derive(Debug, Default)]
pub struct AutoDeny;

#[async_trait]
impl Confirmer for AutoDeny {
    async fn confirm(&self, action: &Action, reason: &str) -> bool {
        tracing::info!(action_id = %action.id, reason, "confirmation auto-denied");
        false
    }
}

#[derive(Debug)]
pub struct ConfirmationRequest {
    pub action: Action,
    pub reason: String,
    pub reply: oneshot::Sender<bool>,
}

pub struct ChannelConfirmer {
    tx: mpsc::Sender<ConfirmationRequest>,
}

impl ChannelConfirmer {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ConfirmationRequest>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Confirmer for ChannelConfirmer {
    async fn confirm(&self, action: &Action, reason: &str) -> bool {
        let (reply, answer) = oneshot::channel();
        let request = ConfirmationRequest {
            action: action.clone(),
            reason: reason.to_string(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            tracing::warn!(action_id = %action.id, "no confirmation listener");
            return false;
        }
        answer.await.unwrap_or(false)
    }
}
