//! 协作式停止：进程级关闭信号 + 按任务/工作流 ID 的停止令牌
//!
//! 每个任务或工作流持有一个 CancellationToken（进程关闭令牌的子令牌）；
//! 工作循环只在检查点（每次 provider 调用前、每个工作流步骤前）读取它，从不抢占进行中的调用。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// 用户发起的退出 (Ctrl+C)
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 致命错误
    FatalError(String),
}

/// 进程级关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 关闭令牌；StopRegistry 以它为根派生每个任务的令牌
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, stopping all workers at their next checkpoint");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping all workers at their next checkpoint");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 按 ID 索引的停止广播：stop(id) 只取消该任务/工作流的令牌
pub struct StopRegistry {
    root: CancellationToken,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl StopRegistry {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// 为 ID 登记停止令牌；已登记时返回同一个令牌
    pub fn register(&self, id: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry(id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 设置停止标志；ID 未登记（已结束或不存在）时返回 false
    pub fn stop(&self, id: &str) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(id) {
            Some(token) => {
                tracing::info!(id = %id, "stop requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_stopped(&self, id: &str) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.get(id).map(|t| t.is_cancelled()).unwrap_or(false)
    }

    /// 任务/工作流到达终态后释放令牌
    pub fn release(&self, id: &str) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.remove(id);
    }

    pub fn active_ids(&self) -> Vec<String> {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = tokens.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for StopRegistry {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

/// 工作协程持有；drop 时释放令牌（含 panic 展开路径）
pub struct StopGuard {
    registry: Arc<StopRegistry>,
    id: String,
}

impl StopGuard {
    pub fn new(registry: Arc<StopRegistry>, id: impl Into<String>) -> Self {
        Self {
            registry,
            id: id.into(),
        }
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}
