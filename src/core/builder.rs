//! 引擎构建器：统一的引擎初始化逻辑
//!
//! 由 AppConfig 装配网关、记忆库、任务记录、安全策略与执行环境；各组件均可替换（测试注入脚本化后端等）。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::autonomy::{
    AutoApprove, AutoDeny, AutonomousExecutor, Confirmer, Environment, LocalEnvironment, Policy,
};
use crate::config::AppConfig;
use crate::core::classifier::TaskClassifier;
use crate::core::executor::TaskExecutor;
use crate::core::orchestrator::{create_backends_from_config, Engine};
use crate::core::shutdown::ShutdownManager;
use crate::core::{EngineError, TaskEvent};
use crate::llm::{create_embedder_from_config, LlmBackend, ProviderGateway};
use crate::memory::{
    InMemoryTaskRecords, MemoryStore, NoopMemory, SqliteTaskRecords, TaskRecordStore, VectorMemory,
};
use crate::observability::{TelemetrySink, TracingTelemetry};
use crate::workflow::WorkflowManager;

type Backends = (Arc<dyn LlmBackend>, Option<Arc<dyn LlmBackend>>);

/// 引擎构建器
pub struct EngineBuilder {
    config: AppConfig,
    backends: Option<Backends>,
    environment: Option<Arc<dyn Environment>>,
    confirmer: Option<Arc<dyn Confirmer>>,
    memory: Option<Arc<dyn MemoryStore>>,
    records: Option<Arc<dyn TaskRecordStore>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
    shutdown: Option<Arc<ShutdownManager>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            backends: None,
            environment: None,
            confirmer: None,
            memory: None,
            records: None,
            telemetry: None,
            events: None,
            shutdown: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 替换配置中的后端
    pub fn with_backends(
        mut self,
        primary: Arc<dyn LlmBackend>,
        secondary: Option<Arc<dyn LlmBackend>>,
    ) -> Self {
        self.backends = Some((primary, secondary));
        self
    }

    pub fn with_environment(mut self, env: Arc<dyn Environment>) -> Self {
        self.environment = Some(env);
        self
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_records(mut self, records: Arc<dyn TaskRecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<TaskEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// 构建主备网关
    pub fn build_gateway(&self) -> Result<Arc<ProviderGateway>, EngineError> {
        let (primary, secondary) = match &self.backends {
            Some((p, s)) => (Arc::clone(p), s.clone()),
            None => create_backends_from_config(&self.config.llm)?,
        };
        let telemetry = self
            .telemetry
            .clone()
            .unwrap_or_else(|| Arc::new(TracingTelemetry));
        Ok(Arc::new(
            ProviderGateway::new(primary, secondary)
                .with_policy(self.config.llm.retry_policy())
                .with_telemetry(telemetry),
        ))
    }

    /// 构建记忆库；memory.enabled = false 时为空实现
    pub fn build_memory(&self) -> Arc<dyn MemoryStore> {
        if let Some(memory) = &self.memory {
            return Arc::clone(memory);
        }
        let cfg = &self.config.memory;
        if !cfg.enabled {
            return Arc::new(NoopMemory);
        }
        let embedder = create_embedder_from_config(
            &cfg.embedder,
            cfg.embedding_base_url.as_deref(),
            &cfg.embedding_model,
            None,
            cfg.dims,
        );
        Arc::new(
            VectorMemory::new(embedder, cfg.max_entries)
                .with_min_score(cfg.min_score)
                .with_chunk_chars(cfg.chunk_chars),
        )
    }

    /// 构建任务记录存储：sqlite 存于 data_dir/tasks.db
    pub fn build_records(&self) -> Result<Arc<dyn TaskRecordStore>, EngineError> {
        if let Some(records) = &self.records {
            return Ok(Arc::clone(records));
        }
        match self.config.memory.records.to_lowercase().as_str() {
            "memory" => Ok(Arc::new(InMemoryTaskRecords::new())),
            "sqlite" => {
                let path = self.config.app.data_dir.join("tasks.db");
                Ok(Arc::new(SqliteTaskRecords::open(path)?))
            }
            other => Err(EngineError::Config(format!("unknown record store: {}", other))),
        }
    }

    fn build_confirmer(&self) -> Arc<dyn Confirmer> {
        if let Some(c) = &self.confirmer {
            return Arc::clone(c);
        }
        match self.config.autonomy.confirm.to_lowercase().as_str() {
            "approve" => Arc::new(AutoApprove),
            _ => Arc::new(AutoDeny),
        }
    }

    /// 构建执行环境与对应的安全策略（两者共用同一 safe-root）
    pub fn build_autonomy(&self) -> Result<(Arc<Policy>, Arc<AutonomousExecutor>), EngineError> {
        let (env, root): (Arc<dyn Environment>, _) = match &self.environment {
            Some(env) => (Arc::clone(env), self.config.app.safe_root.clone()),
            None => {
                let local = LocalEnvironment::new(&self.config.app.safe_root)?;
                let root = local.root().to_path_buf();
                (Arc::new(local), root)
            }
        };
        let policy = Policy::new(root)?
            .with_patterns(&self.config.safety.restricted_patterns)?
            .with_pre_approved(self.config.safety.pre_approved.iter().cloned());
        let executor = AutonomousExecutor::new(env)
            .with_confirmer(self.build_confirmer())
            .with_limits(self.config.autonomy.limits());
        Ok((Arc::new(policy), Arc::new(executor)))
    }

    /// 构建引擎
    pub fn build(self) -> Result<Engine, EngineError> {
        let gateway = self.build_gateway()?;
        let memory = self.build_memory();
        let records = self.build_records()?;

        let mut classifier = TaskClassifier::new(self.config.classifier.confidence_threshold);
        if self.config.classifier.model_assisted {
            classifier = classifier.with_model(Arc::clone(&gateway));
        }

        let tasks = Arc::new(
            TaskExecutor::new(gateway, memory)
                .with_classifier(classifier)
                .with_continuation(self.config.continuation.to_config())
                .with_records(Arc::clone(&records))
                .with_default_category(self.config.classifier.default_category)
                .with_top_k(self.config.memory.top_k)
                .with_events(self.events.clone()),
        );

        let (policy, executor) = self.build_autonomy()?;
        let workflows = Arc::new(
            WorkflowManager::new(policy, executor)
                .with_task_executor(Arc::clone(&tasks))
                .with_events(self.events.clone()),
        );

        let shutdown = self
            .shutdown
            .clone()
            .unwrap_or_else(|| Arc::new(ShutdownManager::new()));
        tracing::info!(
            safe_root = %self.config.app.safe_root.display(),
            memory = self.config.memory.enabled,
            "engine ready"
        );
        Ok(Engine::new(tasks, workflows, records, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_with_defaults_in_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.app.safe_root = dir.path().join("sandbox");
        cfg.app.data_dir = dir.path().join("data");
        cfg.llm.primary.provider = "mock".to_string();
        cfg.llm.secondary = None;

        let engine = EngineBuilder::new(cfg).build().unwrap();
        assert!(engine.active_ids().is_empty());
        assert!(dir.path().join("sandbox").is_dir());
        assert!(dir.path().join("data").join("tasks.db").exists());
    }

    #[test]
    fn test_invalid_restricted_pattern_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.app.safe_root = dir.path().to_path_buf();
        cfg.safety.restricted_patterns = vec!["(unclosed".to_string()];
        let builder = EngineBuilder::new(cfg);
        assert!(matches!(builder.build_autonomy(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_memory_disabled_is_noop() {
        let mut cfg = AppConfig::default();
        cfg.memory.enabled = false;
        let memory = EngineBuilder::new(cfg).build_memory();
        assert!(!memory.enabled());
    }
}
