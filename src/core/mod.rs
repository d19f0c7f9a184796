//! 核心层：任务模型、分类、续写循环、单任务执行、错误恢复与停止信号、引擎入口

pub mod builder;
pub mod classifier;
pub mod continuation;
pub mod error;
pub mod executor;
pub mod handler;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod task;

pub use builder::EngineBuilder;
pub use classifier::{Classification, TaskClassifier};
pub use continuation::{
    ContinuationConfig, ContinuationController, ContinuationReport, MarkerRule, MarkerSignal,
    MAX_ITERATIONS,
};
pub use error::{EngineError, RecoveryAction};
pub use executor::TaskExecutor;
pub use handler::{handler_for, TaskHandler};
pub use orchestrator::{
    create_backends_from_config, Engine, SubmissionOutcome, TaskHandle, WorkflowHandle,
};
pub use recovery::{FailurePolicy, RecoveryEngine};
pub use shutdown::{ShutdownManager, ShutdownReason, StopGuard, StopRegistry};
pub use task::{Task, TaskCategory, TaskEvent, TaskId, TaskStatus, TaskSubmission};
