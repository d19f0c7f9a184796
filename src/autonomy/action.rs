//! 自主动作数据模型：Action / SafetyDecision / ActionResult / 环境快照
//!
//! Action 与 SafetyDecision 按工作流步骤创建，执行记录写入审计日志后即丢弃。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ShellCommand,
    FileOp,
    UiInteraction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    Read,
    Write,
    Append,
    Mkdir,
    List,
    Delete,
}

impl FileOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOp::Read => "read",
            FileOp::Write => "write",
            FileOp::Append => "append",
            FileOp::Mkdir => "mkdir",
            FileOp::List => "list",
            FileOp::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    None,
    Command {
        command: String,
    },
    File {
        op: FileOp,
        content: Option<String>,
    },
    Ui {
        selector: String,
        input: Option<String>,
    },
}

/// 待执行的环境动作；target 为 safe-root 内的路径（shell 命令为工作目录）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    pub target: String,
    pub risk_level: RiskLevel,
    /// 已获得 allow 或已确认的 require_confirmation
    pub validated: bool,
    pub payload: ActionPayload,
}

impl Action {
    fn new(kind: ActionKind, target: impl Into<String>, risk: RiskLevel, payload: ActionPayload) -> Self {
        Self {
            id: format!("act_{}", uuid::Uuid::new_v4().simple()),
            kind,
            target: target.into(),
            risk_level: risk,
            validated: false,
            payload,
        }
    }

    /// 在 workdir（相对 safe-root）中执行 shell 命令
    pub fn shell(workdir: impl Into<String>, command: impl Into<String>, risk: RiskLevel) -> Self {
        Self::new(
            ActionKind::ShellCommand,
            workdir,
            risk,
            ActionPayload::Command {
                command: command.into(),
            },
        )
    }

    pub fn file(op: FileOp, path: impl Into<String>, content: Option<String>, risk: RiskLevel) -> Self {
        Self::new(ActionKind::FileOp, path, risk, ActionPayload::File { op, content })
    }

    pub fn ui(selector: impl Into<String>, input: Option<String>, risk: RiskLevel) -> Self {
        let selector = selector.into();
        Self::new(
            ActionKind::UiInteraction,
            selector.clone(),
            risk,
            ActionPayload::Ui { selector, input },
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn command(&self) -> Option<&str> {
        match &self.payload {
            ActionPayload::Command { command } => Some(command),
            _ => None,
        }
    }

    /// 用于模式匹配与审计的文本：目标 + 负载
    pub fn describe(&self) -> String {
        match &self.payload {
            ActionPayload::None => self.target.clone(),
            ActionPayload::Command { command } => format!("{} (in {})", command, self.target),
            ActionPayload::File { op, .. } => format!("{} {}", op.as_str(), self.target),
            ActionPayload::Ui { selector, .. } => format!("ui {}", selector),
        }
    }
}

/// 可序列化的动作描述（工作流模板与模型提案共用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub kind: ActionKind,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default, alias = "risk_level")]
    pub risk: RiskLevel,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub op: Option<FileOp>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub parallel_safe: bool,
    #[serde(default)]
    pub depends_on_prev: bool,
}

fn default_target() -> String {
    ".".to_string()
}

impl ActionSpec {
    pub fn shell(command: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            kind: ActionKind::ShellCommand,
            target: default_target(),
            risk,
            command: Some(command.into()),
            op: None,
            content: None,
            selector: None,
            parallel_safe: false,
            depends_on_prev: false,
        }
    }

    pub fn file(op: FileOp, path: impl Into<String>, content: Option<String>, risk: RiskLevel) -> Self {
        Self {
            kind: ActionKind::FileOp,
            target: path.into(),
            risk,
            command: None,
            op: Some(op),
            content,
            selector: None,
            parallel_safe: false,
            depends_on_prev: false,
        }
    }

    pub fn parallel_safe(mut self) -> Self {
        self.parallel_safe = true;
        self
    }

    pub fn depends_on_prev(mut self) -> Self {
        self.depends_on_prev = true;
        self
    }

    /// 对 target / command / content / selector 中的模板做替换
    pub fn resolve(&self, render: impl Fn(&str) -> String) -> ActionSpec {
        ActionSpec {
            target: render(&self.target),
            command: self.command.as_deref().map(&render),
            content: self.content.as_deref().map(&render),
            selector: self.selector.as_deref().map(&render),
            ..self.clone()
        }
    }

    pub fn into_action(self) -> Result<Action, String> {
        match self.kind {
            ActionKind::ShellCommand => {
                let command = self
                    .command
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| "shell_command requires a command".to_string())?;
                Ok(Action::shell(self.target, command, self.risk))
            }
            ActionKind::FileOp => {
                let op = self.op.ok_or_else(|| "file_op requires an op".to_string())?;
                Ok(Action::file(op, self.target, self.content, self.risk))
            }
            ActionKind::UiInteraction => {
                let selector = self.selector.unwrap_or(self.target);
                Ok(Action::ui(selector, self.content, self.risk))
            }
        }
    }
}

/// 从模型输出中解析 ```json 代码块里的动作提案（数组或单个对象）
pub fn parse_action_proposals(text: &str) -> Vec<ActionSpec> {
    let mut specs = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```json") {
        let body_start = start + "```json".len();
        let Some(len) = rest[body_start..].find("```") else {
            break;
        };
        let body = rest[body_start..body_start + len].trim();
        if let Ok(list) = serde_json::from_str::<Vec<ActionSpec>>(body) {
            specs.extend(list);
        } else if let Ok(one) = serde_json::from_str::<ActionSpec>(body) {
            specs.push(one);
        } else {
            tracing::debug!("ignoring unparsable action proposal block");
        }
        rest = &rest[body_start + len + 3..];
    }
    specs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    RequireConfirmation,
}

/// 安全判定；非 allow 时 reason 必填
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyDecision {
    pub action_id: String,
    pub verdict: Verdict,
    pub reason: Option<String>,
    /// require_confirmation 已被确认
    #[serde(default)]
    pub confirmed: bool,
}

impl SafetyDecision {
    pub fn allow(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            verdict: Verdict::Allow,
            reason: None,
            confirmed: false,
        }
    }

    pub fn deny(action_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            verdict: Verdict::Deny,
            reason: Some(reason.into()),
            confirmed: false,
        }
    }

    pub fn require_confirmation(action_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            verdict: Verdict::RequireConfirmation,
            reason: Some(reason.into()),
            confirmed: false,
        }
    }

    /// allow，或已确认的 require_confirmation
    pub fn is_executable(&self) -> bool {
        match self.verdict {
            Verdict::Allow => true,
            Verdict::RequireConfirmation => self.confirmed,
            Verdict::Deny => false,
        }
    }

    pub fn reason_text(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// safe-root 下的文件清单（相对路径 → 元数据）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub entries: BTreeMap<String, FileMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl StateDelta {
    pub fn between(before: &EnvironmentSnapshot, after: &EnvironmentSnapshot) -> Self {
        let mut delta = StateDelta::default();
        for (path, meta) in &after.entries {
            match before.entries.get(path) {
                None => delta.created.push(path.clone()),
                Some(old) if old != meta && !meta.is_dir => delta.modified.push(path.clone()),
                _ => {}
            }
        }
        for path in before.entries.keys() {
            if !after.entries.contains_key(path) {
                delta.removed.push(path.clone());
            }
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    pub success: bool,
    /// 命令 stdout 或读取到的内容
    pub output: String,
    pub state_delta: StateDelta,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ActionResult {
    pub fn ok(action_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failed(action_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proposals_from_markdown() {
        let text = r##"Plan:
```json
[
  {"kind": "file_op", "target": "notes.txt", "op": "write", "content": "hi", "risk": "low"},
  {"kind": "shell_command", "command": "ls", "parallel_safe": true}
]
```
and one more
```json
{"kind": "ui_interaction", "selector": "button#ok"}
```
```json
not json
```"##;
        let specs = parse_action_proposals(text);
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].op, Some(FileOp::Write));
        assert_eq!(specs[1].target, ".");
        assert_eq!(specs[1].risk, RiskLevel::Medium);
        assert!(specs[1].parallel_safe);
        assert_eq!(specs[2].kind, ActionKind::UiInteraction);
    }

    #[test]
    fn test_spec_into_action_validation() {
        let missing = ActionSpec {
            command: None,
            ..ActionSpec::shell("", RiskLevel::Low)
        };
        assert!(missing.into_action().is_err());

        let action = ActionSpec::file(FileOp::Mkdir, "out", None, RiskLevel::Low)
            .into_action()
            .unwrap();
        assert_eq!(action.kind, ActionKind::FileOp);
        assert!(!action.validated);
    }

    #[test]
    fn test_resolve_templates() {
        let spec = ActionSpec::shell("echo {{x}}", RiskLevel::Low);
        let resolved = spec.resolve(|s| s.replace("{{x}}", "42"));
        assert_eq!(resolved.command.as_deref(), Some("echo 42"));
    }

    #[test]
    fn test_decision_executable() {
        assert!(SafetyDecision::allow("a").is_executable());
        assert!(!SafetyDecision::deny("a", "no").is_executable());
        let mut d = SafetyDecision::require_confirmation("a", "high risk");
        assert!(!d.is_executable());
        d.confirmed = true;
        assert!(d.is_executable());
    }

    #[test]
    fn test_state_delta() {
        let meta = |size| FileMeta {
            size,
            is_dir: false,
            modified: None,
        };
        let mut before = EnvironmentSnapshot::default();
        before.entries.insert("a.txt".into(), meta(1));
        before.entries.insert("b.txt".into(), meta(1));
        let mut after = EnvironmentSnapshot::default();
        after.entries.insert("a.txt".into(), meta(2));
        after.entries.insert("c.txt".into(), meta(1));

        let delta = StateDelta::between(&before, &after);
        assert_eq!(delta.created, vec!["c.txt"]);
        assert_eq!(delta.modified, vec!["a.txt"]);
        assert_eq!(delta.removed, vec!["b.txt"]);
    }
}
