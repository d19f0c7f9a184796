//! Taskpilot - 命令行入口
//!
//! 用法：taskpilot [--autonomous] [--no-memory] [--category C] [--config PATH] <description> [files...]
//! 初始化日志与配置，装配引擎，执行一个任务并打印结果；Ctrl+C 会让任务在下一个检查点停止。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use taskpilot::config::{load_config, AppConfig};
use taskpilot::core::{EngineBuilder, TaskCategory, TaskSubmission};
use taskpilot::observability;
use taskpilot::workflow::StepStatus;
use tokio::sync::mpsc;

fn parse_category(value: &str) -> Result<TaskCategory, String> {
    value.parse()
}

#[derive(Debug, Parser)]
#[command(name = "taskpilot")]
#[command(about = "Classify, run and continue a task with primary/local model fallback", version)]
struct CliArgs {
    /// 完成后执行输出中的动作提案
    #[arg(long)]
    autonomous: bool,

    /// 不检索、不写回上下文
    #[arg(long)]
    no_memory: bool,

    /// 跳过分类，直接指定类别 (code, multimedia, rag, automation, analytics)
    #[arg(long, value_parser = parse_category)]
    category: Option<TaskCategory>,

    /// 额外的配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 任务描述
    description: String,

    /// 附带的文件
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = CliArgs::parse();

    let cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let engine = EngineBuilder::new(cfg)
        .with_events(events_tx)
        .build()
        .context("Failed to build engine")?;
    engine.shutdown_manager().install_signal_handlers();

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::debug!(event = %line, "progress");
            }
        }
    });

    let mut submission = TaskSubmission::new(cli.description)
        .with_files(cli.files)
        .with_memory(!cli.no_memory)
        .autonomous(cli.autonomous);
    if let Some(category) = cli.category {
        submission = submission.with_category(category);
    }

    let handle = engine.submit(submission);
    let outcome = handle.wait().await.context("Task worker failed")?;
    let task = &outcome.task;

    println!("task:       {}", task.id);
    println!("category:   {}", task.category);
    println!("status:     {}", task.status);
    println!("iterations: {}", task.iteration_count);
    if task.degraded {
        println!("degraded:   true");
    }
    for note in &task.annotations {
        println!("note:       {}", note);
    }
    if let Some(err) = &task.error {
        println!("error:      {}", err);
    }
    println!("\n{}", task.combined_output());

    if let Some(report) = &outcome.workflow {
        println!("\nworkflow {} ({:?})", report.workflow_id, report.status);
        for step in &report.steps {
            let detail = step
                .denial_reason
                .as_deref()
                .or(step.error.as_deref())
                .unwrap_or("");
            println!("  [{}] {} {} {}", step.position, step.name, step.status.as_str(), detail);
            if step.status == StepStatus::Succeeded && !step.output.trim().is_empty() {
                println!("      {}", step.output.trim());
            }
        }
    }
    Ok(())
}
