//! 向量记忆库：retrieve(query, top_k) / store(task_id, text, metadata)
//!
//! 读可跨任务并发（RwLock），写按任务串行（每个 task_id 一把 tokio Mutex）。
//! ContextItem 只由记忆库创建与修改。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::core::EngineError;
use crate::llm::Embedder;

/// 记忆条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub source_task_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// 检索时的相似度；存储中的条目为 0
    #[serde(default)]
    pub score: f32,
}

#[derive(Error, Debug, Clone)]
pub enum MemoryError {
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("memory backend unavailable: {0}")]
    Unavailable(String),
}

impl From<MemoryError> for EngineError {
    fn from(err: MemoryError) -> Self {
        EngineError::MemoryUnavailable(err.to_string())
    }
}

#[async_trait::async_trait]
pub trait MemoryStore: Send + Sync {
    /// 按相似度返回最多 top_k 条
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ContextItem>, MemoryError>;

    /// 写入一段文本（长文本会被分块）
    async fn store(
        &self,
        task_id: &str,
        text: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), MemoryError>;

    fn enabled(&self) -> bool {
        true
    }
}

/// 空实现：未启用记忆时使用
#[derive(Debug, Clone, Default)]
pub struct NoopMemory;

#[async_trait::async_trait]
impl MemoryStore for NoopMemory {
    async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<ContextItem>, MemoryError> {
        Ok(Vec::new())
    }

    async fn store(
        &self,
        _task_id: &str,
        _text: &str,
        _metadata: HashMap<String, String>,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// 内存向量库
pub struct VectorMemory {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<Vec<ContextItem>>,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    max_entries: usize,
    min_score: f32,
    chunk_chars: usize,
}

impl VectorMemory {
    pub fn new(embedder: Arc<dyn Embedder>, max_entries: usize) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
            writers: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            min_score: 0.05,
            chunk_chars: 800,
        }
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(16);
        self
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 某任务写入的全部条目（按写入顺序）
    pub async fn items_for_task(&self, task_id: &str) -> Vec<ContextItem> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|i| i.source_task_id == task_id)
            .cloned()
            .collect()
    }

    async fn writer_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().await;
        writers
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// 按段落/行切分，单块不超过 max_chars 个字符（UTF-8 安全）
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        let line_len = line.chars().count();
        if !current.is_empty() && current.chars().count() + line_len + 1 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if line_len > max_chars {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks.retain(|c| !c.trim().is_empty());
    chunks
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait::async_trait]
impl MemoryStore for VectorMemory {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ContextItem>, MemoryError> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(MemoryError::Embedding)?;

        let entries = self.entries.read().await;
        let mut scored: Vec<(f32, &ContextItem)> = entries
            .iter()
            .map(|item| (cosine_similarity(&query_embedding, &item.embedding), item))
            .filter(|(score, _)| *score >= self.min_score)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, item)| ContextItem {
                score,
                ..item.clone()
            })
            .collect())
    }

    async fn store(
        &self,
        task_id: &str,
        text: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), MemoryError> {
        let lock = self.writer_lock(task_id).await;
        let _guard = lock.lock().await;

        let mut items = Vec::new();
        for chunk in chunk_text(text, self.chunk_chars) {
            let embedding = self
                .embedder
                .embed(&chunk)
                .await
                .map_err(MemoryError::Embedding)?;
            if embedding.is_empty() {
                continue;
            }
            items.push(ContextItem {
                id: uuid::Uuid::new_v4().to_string(),
                embedding,
                source_task_id: task_id.to_string(),
                text: chunk,
                timestamp: Utc::now(),
                metadata: metadata.clone(),
                score: 0.0,
            });
        }
        if items.is_empty() {
            return Ok(());
        }

        let mut entries = self.entries.write().await;
        entries.extend(items);
        let n = entries.len();
        if n > self.max_entries {
            entries.drain(0..n - self.max_entries);
        }
        tracing::debug!(task_id, total = entries.len(), "memory stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;

    fn memory() -> VectorMemory {
        VectorMemory::new(Arc::new(HashingEmbedder::new(128)), 100)
    }

    #[tokio::test]
    async fn test_retrieve_ranks_relevant_first() {
        let mem = memory();
        mem.store("t1", "rust tokio async runtime scheduling", HashMap::new())
            .await
            .unwrap();
        mem.store("t2", "chocolate cake baking recipe", HashMap::new())
            .await
            .unwrap();

        let hits = mem.retrieve("tokio async runtime", 2).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].source_task_id, "t1");
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_max_entries_evicts_oldest() {
        let mem = VectorMemory::new(Arc::new(HashingEmbedder::new(64)), 2);
        for i in 0..3 {
            mem.store(&format!("t{i}"), &format!("entry number {i}"), HashMap::new())
                .await
                .unwrap();
        }
        assert_eq!(mem.len().await, 2);
        assert!(mem.items_for_task("t0").await.is_empty());
    }

    #[tokio::test]
    async fn test_long_text_is_chunked() {
        let mem = memory().with_chunk_chars(20);
        mem.store("t1", "first line of text\nsecond line of text\nthird", HashMap::new())
            .await
            .unwrap();
        assert!(mem.items_for_task("t1").await.len() >= 2);
    }

    #[tokio::test]
    async fn test_concurrent_writes_same_task_are_all_kept() {
        let mem = Arc::new(memory());
        let mut handles = Vec::new();
        for i in 0..8 {
            let mem = mem.clone();
            handles.push(tokio::spawn(async move {
                mem.store("shared", &format!("write {i}"), HashMap::new()).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(mem.items_for_task("shared").await.len(), 8);
    }

    #[test]
    fn test_chunk_text_splits_long_lines() {
        let chunks = chunk_text(&"x".repeat(50), 20);
        assert_eq!(chunks.len(), 3);
        assert!(chunk_text("   ", 20).is_empty());
    }

    #[tokio::test]
    async fn test_noop_memory() {
        let mem = NoopMemory;
        assert!(!mem.enabled());
        mem.store("t", "x", HashMap::new()).await.unwrap();
        assert!(mem.retrieve("x", 3).await.unwrap().is_empty());
    }
}
