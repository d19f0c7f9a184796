//! 自主执行环境：observe() / act(action)
//!
//! LocalEnvironment 绑定 safe-root：shell 命令以 sh -c 在 root 内运行，文件操作经
//! resolve 校验（含符号链接）必须落在 root 下。UI 交互属于外部协作方，这里报告不支持。

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use walkdir::WalkDir;

use crate::autonomy::action::{
    Action, ActionPayload, ActionResult, EnvironmentSnapshot, FileMeta, FileOp,
};
use crate::autonomy::safety::normalize;
use crate::core::EngineError;

#[async_trait]
pub trait Environment: Send + Sync {
    async fn observe(&self) -> Result<EnvironmentSnapshot, EngineError>;

    /// 执行失败体现在 ActionResult.success / error 中
    async fn act(&self, action: &Action) -> ActionResult;
}

/// 本地文件系统 + shell 环境
#[derive(Debug, Clone)]
pub struct LocalEnvironment {
    root: PathBuf,
    max_snapshot_entries: usize,
}

impl LocalEnvironment {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, EngineError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .map_err(|e| EngineError::Config(format!("cannot create safe-root: {}", e)))?;
        let root = root
            .canonicalize()
            .map_err(|e| EngineError::Config(format!("cannot resolve safe-root: {}", e)))?;
        Ok(Self {
            root,
            max_snapshot_entries: 10_000,
        })
    }

    pub fn with_max_snapshot_entries(mut self, n: usize) -> Self {
        self.max_snapshot_entries = n;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析 safe-root 内路径；已存在的最近祖先会 canonicalize，防止符号链接逃逸
    pub fn resolve(&self, target: &str) -> Result<PathBuf, String> {
        let target = target.trim();
        let path = Path::new(if target.is_empty() { "." } else { target });
        let joined = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.root.join(path))
        };
        if !joined.starts_with(&self.root) {
            return Err(format!("path escapes safe-root: {}", target));
        }
        let mut existing = joined.as_path();
        while !existing.exists() {
            match existing.parent() {
                Some(p) => existing = p,
                None => break,
            }
        }
        if let Ok(canon) = existing.canonicalize() {
            if !canon.starts_with(&self.root) {
                return Err(format!("path escapes safe-root via symlink: {}", target));
            }
        }
        Ok(joined)
    }

    async fn run_shell(&self, action: &Action, command: &str) -> ActionResult {
        let workdir = match self.resolve(&action.target) {
            Ok(p) => p,
            Err(e) => return ActionResult::failed(&action.id, e),
        };
        tracing::info!(action_id = %action.id, command = %command, "shell action");

        // 子进程只继承 PATH；HOME 指向 safe-root
        let path = std::env::var_os("PATH").unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".into());
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env_clear()
            .env("PATH", path)
            .env("HOME", &self.root)
            .current_dir(&workdir)
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(out) => {
                let stdout = String::from_utf8_lossy(&out.stdout).to_string();
                let stderr = String::from_utf8_lossy(&out.stderr).to_string();
                if out.status.success() {
                    ActionResult::ok(&action.id, stdout)
                } else {
                    ActionResult {
                        output: stdout,
                        ..ActionResult::failed(
                            &action.id,
                            format!("exit {:?}: {}", out.status.code(), stderr.trim()),
                        )
                    }
                }
            }
            Err(e) => ActionResult::failed(&action.id, format!("spawn failed: {}", e)),
        }
    }

    async fn run_file_op(&self, action: &Action, op: FileOp, content: Option<&str>) -> ActionResult {
        let path = match self.resolve(&action.target) {
            Ok(p) => p,
            Err(e) => return ActionResult::failed(&action.id, e),
        };
        let result: std::io::Result<String> = match op {
            FileOp::Read => tokio::fs::read_to_string(&path).await,
            FileOp::Write => {
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                tokio::fs::write(&path, content.unwrap_or(""))
                    .await
                    .map(|_| String::new())
            }
            FileOp::Append => append(&path, content.unwrap_or("")).await.map(|_| String::new()),
            FileOp::Mkdir => tokio::fs::create_dir_all(&path).await.map(|_| String::new()),
            FileOp::List => list_dir(&path).await,
            FileOp::Delete => {
                if path == self.root {
                    return ActionResult::failed(&action.id, "refusing to delete the safe-root");
                }
                let removed = match tokio::fs::metadata(&path).await {
                    Ok(m) if m.is_dir() => tokio::fs::remove_dir_all(&path).await,
                    Ok(_) => tokio::fs::remove_file(&path).await,
                    Err(e) => Err(e),
                };
                removed.map(|_| String::new())
            }
        };
        match result {
            Ok(out) => ActionResult::ok(&action.id, out),
            Err(e) => ActionResult::failed(&action.id, format!("{} {}: {}", op.as_str(), action.target, e)),
        }
    }
}

async fn append(path: &Path, content: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    f.write_all(content.as_bytes()).await?;
    f.flush().await
}

async fn list_dir(path: &Path) -> std::io::Result<String> {
    let mut rd = tokio::fs::read_dir(path).await?;
    let mut names = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();
    Ok(names.join("\n"))
}

fn snapshot(root: &Path, limit: usize) -> EnvironmentSnapshot {
    let mut snap = EnvironmentSnapshot::default();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .take(limit)
    {
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let meta = entry.metadata().ok();
        snap.entries.insert(
            rel.to_string_lossy().replace('\\', "/"),
            FileMeta {
                size: meta.as_ref().map(|m| m.len()).unwrap_or(0),
                is_dir: entry.file_type().is_dir(),
                modified: meta
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from),
            },
        );
    }
    snap
}

#[async_trait]
impl Environment for LocalEnvironment {
    async fn observe(&self) -> Result<EnvironmentSnapshot, EngineError> {
        let root = self.root.clone();
        let limit = self.max_snapshot_entries;
        tokio::task::spawn_blocking(move || snapshot(&root, limit))
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))
    }

    async fn act(&self, action: &Action) -> ActionResult {
        let started = Instant::now();
        let mut result = match &action.payload {
            ActionPayload::Command { command } => self.run_shell(action, command).await,
            ActionPayload::File { op, content } => {
                self.run_file_op(action, *op, content.as_deref()).await
            }
            ActionPayload::Ui { .. } => ActionResult::failed(
                &action.id,
                "ui interactions require an external ui driver",
            ),
            ActionPayload::None => ActionResult::failed(&action.id, "action has no payload"),
        };
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }
}
