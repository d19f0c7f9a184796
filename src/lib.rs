//! Taskpilot - 任务处理与自主执行引擎
//!
//! 模块划分：
//! - **autonomy**: 动作模型、安全校验（safe-root / 受限模式）、确认、执行环境与执行器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型与状态机、分类器、续写循环、单任务执行、恢复与停止、引擎入口
//! - **llm**: 后端抽象（远程 OpenAI 兼容 / 本地 / Mock）、主备网关、嵌入
//! - **memory**: 向量上下文库与任务记录持久化
//! - **observability**: 日志初始化与 provider 遥测
//! - **workflow**: 工作流构建与执行

pub mod autonomy;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod workflow;

pub use crate::core::{Engine, EngineBuilder, EngineError, Task, TaskStatus, TaskSubmission};
