//! 按类别分派的任务处理器
//!
//! 类别集合封闭：Code / Multimedia / Rag / Automation / Analytics，共享同一 TaskHandler 接口。
//! 各类别输出模板的细节属于外部协作方，这里只提供 system prompt、token 上限与 prompt 组装。

use crate::core::{Task, TaskCategory};

pub trait TaskHandler: Send + Sync {
    fn category(&self) -> TaskCategory;

    fn system_prompt(&self) -> &'static str;

    /// 单次调用的输出 token 上限
    fn max_tokens(&self) -> u32 {
        2048
    }

    /// 组装首轮 prompt：任务描述 + 附件清单 (+ 自主模式下的动作提案格式)
    fn build_prompt(&self, task: &Task) -> String {
        let mut prompt = task.description.trim().to_string();
        if !task.files.is_empty() {
            prompt.push_str("\n\nAttached files:\n");
            for f in &task.files {
                prompt.push_str(&format!("- {}\n", f.display()));
            }
        }
        if task.autonomous_mode {
            prompt.push_str(ACTION_PROPOSAL_INSTRUCTION);
        }
        prompt
    }
}

const ACTION_PROPOSAL_INSTRUCTION: &str = "\n\nIf the task needs changes to the environment, \
propose them as a ```json fenced array of actions. Each action is an object with \
\"kind\" (shell_command | file_op | ui_interaction), \"target\", \"risk\" (low | medium | high) \
and optionally \"command\", \"op\" (read | write | append | mkdir | list | delete), \"content\", \
\"parallel_safe\" and \"depends_on_prev\". Actions run in order inside the working directory.";

pub struct CodeHandler;
pub struct MultimediaHandler;
pub struct RagHandler;
pub struct AutomationHandler;
pub struct AnalyticsHandler;

impl TaskHandler for CodeHandler {
    fn category(&self) -> TaskCategory {
        TaskCategory::Code
    }

    fn system_prompt(&self) -> &'static str {
        "You are a senior software engineer. Produce complete, compilable code with brief explanations."
    }

    fn max_tokens(&self) -> u32 {
        4096
    }
}

impl TaskHandler for MultimediaHandler {
    fn category(&self) -> TaskCategory {
        TaskCategory::Multimedia
    }

    fn system_prompt(&self) -> &'static str {
        "You assist with image, audio and video tasks. Describe processing steps and the tools to use."
    }
}

impl TaskHandler for RagHandler {
    fn category(&self) -> TaskCategory {
        TaskCategory::Rag
    }

    fn system_prompt(&self) -> &'static str {
        "Answer using the provided context. Cite which context item supports each claim and say so when the context is insufficient."
    }

    fn max_tokens(&self) -> u32 {
        1536
    }
}

impl TaskHandler for AutomationHandler {
    fn category(&self) -> TaskCategory {
        TaskCategory::Automation
    }

    fn system_prompt(&self) -> &'static str {
        "You automate workflows. Break the job into small, verifiable steps and prefer idempotent commands."
    }
}

impl TaskHandler for AnalyticsHandler {
    fn category(&self) -> TaskCategory {
        TaskCategory::Analytics
    }

    fn system_prompt(&self) -> &'static str {
        "You are a data analyst. State assumptions, show the computation and summarize findings."
    }

    fn max_tokens(&self) -> u32 {
        3072
    }
}

/// 按类别选择处理器；Unknown 交由 Code 处理
pub fn handler_for(category: TaskCategory) -> &'static dyn TaskHandler {
    match category {
        TaskCategory::Code | TaskCategory::Unknown => &CodeHandler,
        TaskCategory::Multimedia => &MultimediaHandler,
        TaskCategory::Rag => &RagHandler,
        TaskCategory::Automation => &AutomationHandler,
        TaskCategory::Analytics => &AnalyticsHandler,
    }
}
