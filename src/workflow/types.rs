//! 工作流类型定义
//!
//! 工作流是有序的步骤列表；每一步引用一个动作或一个任务，可依赖上一步的结果。
//! 位置从 1 开始；模板 `{{prev}}` 取上一步输出，`{{step:N}}` 取第 N 步输出。

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::autonomy::{ActionSpec, StateDelta};
use crate::core::recovery::FailurePolicy;
use crate::core::{TaskCategory, TaskSubmission};

pub type WorkflowId = String;

/// 工作流中的任务步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub category: Option<TaskCategory>,
    #[serde(default = "default_true")]
    pub memory_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            files: Vec::new(),
            category: None,
            memory_enabled: true,
        }
    }

    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn into_submission(self) -> TaskSubmission {
        let mut submission = TaskSubmission::new(self.description)
            .with_files(self.files)
            .with_memory(self.memory_enabled);
        if let Some(c) = self.category {
            submission = submission.with_category(c);
        }
        submission
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepTarget {
    Action(ActionSpec),
    Task(TaskSpec),
}

impl StepTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            StepTarget::Action(_) => "action",
            StepTarget::Task(_) => "task",
        }
    }

    /// 模板中引用的步骤位置
    pub(crate) fn referenced_steps(&self) -> Vec<usize> {
        let texts: Vec<&str> = match self {
            StepTarget::Action(spec) => [
                Some(spec.target.as_str()),
                spec.command.as_deref(),
                spec.content.as_deref(),
                spec.selector.as_deref(),
            ]
            .into_iter()
            .flatten()
            .collect(),
            StepTarget::Task(spec) => vec![spec.description.as_str()],
        };
        let Some(re) = step_ref_regex() else {
            return Vec::new();
        };
        texts
            .into_iter()
            .flat_map(|t| re.captures_iter(t))
            .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse().ok()))
            .collect()
    }

    pub(crate) fn uses_prev(&self) -> bool {
        let check = |s: &str| s.contains(PREV_TEMPLATE);
        match self {
            StepTarget::Action(spec) => {
                check(&spec.target)
                    || spec.command.as_deref().is_some_and(check)
                    || spec.content.as_deref().is_some_and(check)
                    || spec.selector.as_deref().is_some_and(check)
            }
            StepTarget::Task(spec) => check(&spec.description),
        }
    }
}

/// 工作流步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// 从 1 开始
    pub position: usize,
    pub name: String,
    pub target: StepTarget,
    /// 上一步未成功时跳过本步
    #[serde(default)]
    pub depends_on_prev: bool,
    /// 相邻的 parallel_safe 步骤组成一批并发执行
    #[serde(default)]
    pub parallel_safe: bool,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// 安全校验拒绝或确认被拒/超时
    Denied,
    Skipped,
    /// 任务步骤被停止
    Stopped,
    /// 工作流中止或停止，未执行
    NotRun,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Denied => "denied",
            StepStatus::Skipped => "skipped",
            StepStatus::Stopped => "stopped",
            StepStatus::NotRun => "not_run",
        }
    }
}

/// 单步执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub position: usize,
    pub name: String,
    pub kind: String,
    pub status: StepStatus,
    pub output: String,
    pub error: Option<String>,
    /// 安全拒绝原因
    pub denial_reason: Option<String>,
    pub attempts: u32,
    pub action_id: Option<String>,
    pub state_delta: Option<StateDelta>,
    /// 任务步骤对应的 Task id
    pub task_id: Option<String>,
    pub duration_ms: u64,
}

impl StepRecord {
    pub fn new(step: &WorkflowStep, status: StepStatus) -> Self {
        Self {
            position: step.position,
            name: step.name.clone(),
            kind: step.target.kind().to_string(),
            status,
            output: String::new(),
            error: None,
            denial_reason: None,
            attempts: 0,
            action_id: None,
            state_delta: None,
            task_id: None,
            duration_ms: 0,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    /// 因不可恢复失败而中止
    Failed,
    Stopped,
}

/// 工作流定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// 由模型提出的动作列表生成工作流（每个动作一步，按提案顺序）
    pub fn from_proposals(
        name: impl Into<String>,
        specs: Vec<ActionSpec>,
    ) -> Result<Self, WorkflowError> {
        let steps = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| WorkflowStep {
                position: i + 1,
                name: format!("action-{}", i + 1),
                depends_on_prev: spec.depends_on_prev && i > 0,
                parallel_safe: spec.parallel_safe,
                failure_policy: FailurePolicy::default(),
                target: StepTarget::Action(spec),
            })
            .collect();
        let workflow = Self {
            id: format!("wf_{}", uuid::Uuid::new_v4()),
            name: name.into(),
            steps,
            created_at: Utc::now(),
        };
        workflow.validate()?;
        Ok(workflow)
    }

    /// 结构校验：非空、步骤名唯一、并发步骤不依赖前一步、
    /// `{{step:N}}` 只能引用更早批次中的步骤
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(WorkflowError::DuplicateStep(step.name.clone()));
            }
            if step.parallel_safe && (step.depends_on_prev || step.target.uses_prev()) {
                return Err(WorkflowError::InvalidConfiguration(format!(
                    "step '{}' is parallel-safe but depends on the previous step",
                    step.name
                )));
            }
            if let Some(n) = step
                .target
                .referenced_steps()
                .into_iter()
                .find(|n| *n == 0 || *n >= step.position)
            {
                return Err(WorkflowError::InvalidConfiguration(format!(
                    "step '{}' references step {} which does not run before it",
                    step.name, n
                )));
            }
        }

        for batch in self.batches().iter().filter(|b| b.len() > 1) {
            let members: HashSet<usize> = batch.iter().map(|s| s.position).collect();
            for step in batch {
                if let Some(n) = step
                    .target
                    .referenced_steps()
                    .into_iter()
                    .find(|n| members.contains(n))
                {
                    return Err(WorkflowError::InvalidConfiguration(format!(
                        "step '{}' references step {} in the same parallel batch",
                        step.name, n
                    )));
                }
            }
        }
        Ok(())
    }

    /// 按并发批次切分：相邻 parallel_safe 步骤合为一批，其余各自成批
    pub fn batches(&self) -> Vec<Vec<&WorkflowStep>> {
        let mut batches: Vec<Vec<&WorkflowStep>> = Vec::new();
        for step in &self.steps {
            let extend = step.parallel_safe
                && batches
                    .last()
                    .and_then(|b| b.last())
                    .is_some_and(|prev| prev.parallel_safe);
            match batches.last_mut() {
                Some(batch) if extend => batch.push(step),
                _ => batches.push(vec![step]),
            }
        }
        batches
    }
}

/// 工作流执行报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub steps: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowReport {
    pub fn step(&self, position: usize) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.position == position)
    }

    pub fn step_by_name(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow has no steps")]
    Empty,
    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),
    #[error("Step not found: {0}")]
    StepNotFound(String),
    #[error("Invalid workflow configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<WorkflowError> for crate::core::EngineError {
    fn from(e: WorkflowError) -> Self {
        crate::core::EngineError::Config(e.to_string())
    }
}

pub const PREV_TEMPLATE: &str = "{{prev}}";

fn step_ref_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{step:(\d+)\}\}").ok()).as_ref()
}

/// 渲染模板；未产出的步骤替换为空串
pub fn render_template(template: &str, position: usize, outputs: &BTreeMap<usize, String>) -> String {
    let prev = position
        .checked_sub(1)
        .and_then(|p| outputs.get(&p))
        .map(String::as_str)
        .unwrap_or("");
    let replaced = template.replace(PREV_TEMPLATE, prev);
    let Some(re) = step_ref_regex() else {
        return replaced;
    };
    re.replace_all(&replaced, |caps: &regex::Captures<'_>| {
        caps.get(1)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .and_then(|n| outputs.get(&n))
            .cloned()
            .unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autonomy::RiskLevel;

    #[test]
    fn test_render_template() {
        let mut outputs = BTreeMap::new();
        outputs.insert(1, "alpha".to_string());
        outputs.insert(2, "beta".to_string());
        assert_eq!(render_template("x {{prev}} y", 3, &outputs), "x beta y");
        assert_eq!(render_template("{{step:1}}-{{step:2}}", 3, &outputs), "alpha-beta");
        assert_eq!(render_template("{{step:9}}!", 3, &outputs), "!");
        assert_eq!(render_template("{{prev}}", 1, &outputs), "");
    }

    #[test]
    fn test_batches_group_adjacent_parallel_steps() {
        let specs = vec![
            ActionSpec::shell("a", RiskLevel::Low),
            ActionSpec::shell("b", RiskLevel::Low).parallel_safe(),
            ActionSpec::shell("c", RiskLevel::Low).parallel_safe(),
            ActionSpec::shell("d", RiskLevel::Low),
            ActionSpec::shell("e", RiskLevel::Low).parallel_safe(),
        ];
        let wf = Workflow::from_proposals("p", specs).unwrap();
        let sizes: Vec<usize> = wf.batches().iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![1, 2, 1, 1]);
    }

    #[test]
    fn test_proposals_are_validated() {
        let prev_in_batch = vec![
            ActionSpec::shell("ls", RiskLevel::Low),
            ActionSpec::shell("echo {{prev}}", RiskLevel::Low).parallel_safe(),
        ];
        assert!(matches!(
            Workflow::from_proposals("p", prev_in_batch),
            Err(WorkflowError::InvalidConfiguration(_))
        ));

        let same_batch = vec![
            ActionSpec::shell("ls", RiskLevel::Low).parallel_safe(),
            ActionSpec::shell("cat {{step:1}}", RiskLevel::Low).parallel_safe(),
        ];
        assert!(matches!(
            Workflow::from_proposals("p", same_batch),
            Err(WorkflowError::InvalidConfiguration(_))
        ));

        assert_eq!(Workflow::from_proposals("p", Vec::new()).unwrap_err(), WorkflowError::Empty);
    }

    #[test]
    fn test_referenced_steps() {
        let target = StepTarget::Action(ActionSpec::shell("cat {{step:2}} {{step:10}}", RiskLevel::Low));
        assert_eq!(target.referenced_steps(), vec![2, 10]);
        assert!(!target.uses_prev());
        let task = StepTarget::Task(TaskSpec::new("summarize {{prev}}"));
        assert!(task.uses_prev());
    }
}
