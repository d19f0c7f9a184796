//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKPILOT__*` 覆盖（双下划线表示嵌套，如 `TASKPILOT__LLM__PRIMARY__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::autonomy::ExecutorLimits;
use crate::core::continuation::{ContinuationConfig, MarkerRule, MAX_ITERATIONS};
use crate::core::TaskCategory;
use crate::llm::{RetryPolicy, MAX_PRIMARY_RETRIES};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub classifier: ClassifierSection,
    pub continuation: ContinuationSection,
    pub memory: MemorySection,
    pub safety: SafetySection,
    pub autonomy: AutonomySection,
}

/// [app] 段：safe-root 与数据目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 自主动作的沙箱根目录
    pub safe_root: PathBuf,
    /// 任务记录等持久化数据
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "taskpilot".to_string(),
            safe_root: PathBuf::from("workspace"),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// 单个后端：provider = openai / local / mock
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl BackendSection {
    pub fn local_default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "llama3".to_string(),
            base_url: None,
            api_key_env: String::new(),
        }
    }

    pub fn api_key(&self) -> Option<String> {
        if self.api_key_env.is_empty() {
            return None;
        }
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// [llm] 段：主/备后端、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub primary: BackendSection,
    /// 为空表示不配置回退
    pub secondary: Option<BackendSection>,
    pub timeouts: LlmTimeoutsSection,
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            primary: BackendSection::default(),
            secondary: Some(BackendSection::local_default()),
            timeouts: LlmTimeoutsSection::default(),
            retry: LlmRetrySection::default(),
        }
    }
}

impl LlmSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            primary_retries: self.retry.primary_retries.min(MAX_PRIMARY_RETRIES),
            backoff: Duration::from_millis(self.retry.backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            request_timeout: Duration::from_secs(self.timeouts.request.max(1)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次后端调用超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmRetrySection {
    /// 主后端可重试错误的额外重试次数；0 表示直接回退
    pub primary_retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            primary_retries: 0,
            backoff_ms: 500,
            max_backoff_ms: 4000,
        }
    }
}

/// [classifier] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    pub confidence_threshold: f32,
    /// 规则置信度不足时是否询问模型
    pub model_assisted: bool,
    /// 无法判定时套用的类别
    pub default_category: TaskCategory,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            confidence_threshold: crate::core::classifier::DEFAULT_CONFIDENCE_THRESHOLD,
            model_assisted: true,
            default_category: TaskCategory::Code,
        }
    }
}

/// [continuation] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContinuationSection {
    /// 上限为 10，超出按 10 处理
    pub max_iterations: u32,
    pub inter_iteration_delay_ms: u64,
    pub stop_grace_secs: u64,
    pub completion_marker: String,
    pub continuation_marker: String,
}

impl Default for ContinuationSection {
    fn default() -> Self {
        let markers = MarkerRule::default();
        Self {
            max_iterations: MAX_ITERATIONS,
            inter_iteration_delay_ms: 0,
            stop_grace_secs: 30,
            completion_marker: markers.completion,
            continuation_marker: markers.continuation,
        }
    }
}

impl ContinuationSection {
    pub fn to_config(&self) -> ContinuationConfig {
        ContinuationConfig {
            max_iterations: self.max_iterations.clamp(1, MAX_ITERATIONS),
            inter_iteration_delay: Duration::from_millis(self.inter_iteration_delay_ms),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            markers: MarkerRule::new(&self.completion_marker, &self.continuation_marker),
        }
    }
}

/// [memory] 段：向量记忆与任务记录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub enabled: bool,
    /// hashing / openai
    pub embedder: String,
    pub embedding_model: String,
    pub embedding_base_url: Option<String>,
    pub dims: usize,
    pub top_k: usize,
    pub max_entries: usize,
    pub min_score: f32,
    pub chunk_chars: usize,
    /// sqlite / memory
    pub records: String,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            embedder: "hashing".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_base_url: None,
            dims: 256,
            top_k: 5,
            max_entries: 10_000,
            min_score: 0.05,
            chunk_chars: 800,
            records: "sqlite".to_string(),
        }
    }
}

/// [safety] 段：额外受限模式与预先批准
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SafetySection {
    pub restricted_patterns: Vec<String>,
    /// 动作 id 或 safe-root 内的路径前缀
    pub pre_approved: Vec<String>,
}

/// [autonomy] 段：超时、步骤预算与确认
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutonomySection {
    pub action_timeout_secs: u64,
    pub step_budget_secs: u64,
    pub max_attempts_per_step: u32,
    pub confirmation_timeout_secs: u64,
    /// 无人值守时的确认方式：deny / approve
    pub confirm: String,
}

impl Default for AutonomySection {
    fn default() -> Self {
        let limits = ExecutorLimits::default();
        Self {
            action_timeout_secs: limits.action_timeout.as_secs(),
            step_budget_secs: limits.step_budget.as_secs(),
            max_attempts_per_step: limits.max_attempts_per_step,
            confirmation_timeout_secs: limits.confirmation_timeout.as_secs(),
            confirm: "deny".to_string(),
        }
    }
}

impl AutonomySection {
    pub fn limits(&self) -> ExecutorLimits {
        ExecutorLimits {
            action_timeout: Duration::from_secs(self.action_timeout_secs.max(1)),
            step_budget: Duration::from_secs(self.step_budget_secs.max(1)),
            max_attempts_per_step: self.max_attempts_per_step.max(1),
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
        }
    }
}

/// 从 config 目录加载配置，环境变量 TASKPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.retry.primary_retries, 0);
        assert_eq!(cfg.continuation.max_iterations, 10);
        assert_eq!(cfg.classifier.default_category, TaskCategory::Code);
        assert_eq!(cfg.autonomy.confirm, "deny");
        assert!(cfg.llm.secondary.is_some());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[app]
safe_root = "/tmp/sandbox"

[llm.primary]
provider = "mock"

[continuation]
max_iterations = 25
completion_marker = "<<END>>"

[safety]
restricted_patterns = ["git\\s+push"]
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.app.safe_root, PathBuf::from("/tmp/sandbox"));
        assert_eq!(cfg.llm.primary.provider, "mock");
        assert_eq!(cfg.llm.primary.model, "gpt-4o-mini");
        let cont = cfg.continuation.to_config();
        assert_eq!(cont.max_iterations, 10);
        assert_eq!(cont.markers.completion, "<<END>>");
        assert_eq!(cont.markers.continuation, "[[CONTINUE]]");
        assert_eq!(cfg.safety.restricted_patterns, vec!["git\\s+push"]);
    }

    #[test]
    fn test_retry_policy_mapping() {
        let mut cfg = AppConfig::default();
        cfg.llm.retry.primary_retries = 1;
        cfg.llm.timeouts.request = 5;
        let policy = cfg.llm.retry_policy();
        assert_eq!(policy.primary_retries, 1);
        assert_eq!(policy.request_timeout, Duration::from_secs(5));

        cfg.llm.retry.primary_retries = 4;
        assert_eq!(cfg.llm.retry_policy().primary_retries, 1);
    }
}
