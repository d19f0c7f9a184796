//! 自主模式：动作模型、安全校验、确认、执行环境与执行器

pub mod action;
pub mod confirm;
pub mod environment;
pub mod executor;
pub mod safety;

pub use action::{
    parse_action_proposals, Action, ActionKind, ActionPayload, ActionResult, ActionSpec,
    EnvironmentSnapshot, FileMeta, FileOp, RiskLevel, SafetyDecision, StateDelta, Verdict,
};
pub use confirm::{AutoApprove, AutoDeny, ChannelConfirmer, ConfirmationRequest, Confirmer};
pub use environment::{Environment, LocalEnvironment};
pub use executor::{AutonomousExecutor, ExecutorLimits};
pub use safety::{Policy, SafetyValidator, DEFAULT_RESTRICTED_PATTERNS};
