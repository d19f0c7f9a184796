//! 任务分类：规则优先（扩展名 + 关键词），置信度不足时才调用模型辅助
//!
//! 不会失败：无法判断时返回 Unknown，由调用方套用默认类别。

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::core::TaskCategory;
use crate::llm::{BackendRequest, ProviderGateway};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;

const EXTENSION_WEIGHT: f32 = 2.0;
const KEYWORD_WEIGHT: f32 = 1.0;
/// 证据总分低于该值时按比例压低置信度
const MIN_EVIDENCE: f32 = 2.0;

const CLASSIFY_INSTRUCTION: &str = "Classify the request into exactly one category: \
code, multimedia, rag, automation, analytics. Reply with the single category word only.";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub category: TaskCategory,
    pub confidence: f32,
    pub model_assisted: bool,
}

impl Classification {
    pub fn hinted(category: TaskCategory) -> Self {
        Self {
            category,
            confidence: 1.0,
            model_assisted: false,
        }
    }
}

fn extensions(category: TaskCategory) -> &'static [&'static str] {
    match category {
        TaskCategory::Code => &[
            "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "kt", "c", "h", "cpp", "hpp", "cs",
            "rb", "php", "swift", "scala",
        ],
        TaskCategory::Multimedia => &[
            "png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "mp3", "wav", "flac", "ogg", "mp4",
            "mov", "mkv", "avi", "webm",
        ],
        TaskCategory::Rag => &["pdf", "md", "txt", "docx", "doc", "html", "htm", "epub", "rst"],
        TaskCategory::Automation => &["sh", "bash", "ps1", "bat", "yml", "yaml", "cron", "service"],
        TaskCategory::Analytics => &["csv", "tsv", "xlsx", "xls", "parquet", "ipynb", "sqlite", "db"],
        TaskCategory::Unknown => &[],
    }
}

fn keywords(category: TaskCategory) -> &'static [&'static str] {
    match category {
        TaskCategory::Code => &[
            "code", "function", "bug", "compile", "refactor", "implement", "debug", "class",
            "struct", "api", "unit test", "rust", "python", "javascript", "typescript",
            "代码", "函数", "编程",
        ],
        TaskCategory::Multimedia => &[
            "image", "photo", "picture", "video", "audio", "sound", "music", "thumbnail",
            "resize", "transcode", "subtitle", "图片", "视频", "音频",
        ],
        TaskCategory::Rag => &[
            "document", "documents", "knowledge", "search", "retrieve", "cite", "summarize",
            "according to", "paper", "manual", "文档", "检索", "知识库",
        ],
        TaskCategory::Automation => &[
            "automate", "automation", "schedule", "cron", "deploy", "backup", "script", "pipeline",
            "workflow", "batch", "rename", "自动化", "部署", "定时",
        ],
        TaskCategory::Analytics => &[
            "analyze", "analyse", "analysis", "statistics", "chart", "plot", "metrics", "trend",
            "dataset", "average", "correlation", "report", "分析", "统计", "图表",
        ],
        TaskCategory::Unknown => &[],
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

/// 关键词命中：ASCII 单词按词边界匹配，短语与 CJK 按子串匹配
fn keyword_hit(lower: &str, word_set: &HashSet<String>, keyword: &str) -> bool {
    if keyword.contains(' ') || !keyword.is_ascii() {
        lower.contains(keyword)
    } else {
        word_set.contains(keyword)
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// 分类器
#[derive(Clone)]
pub struct TaskClassifier {
    threshold: f32,
    model: Option<Arc<ProviderGateway>>,
}

impl Default for TaskClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl TaskClassifier {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            model: None,
        }
    }

    pub fn with_model(mut self, gateway: Arc<ProviderGateway>) -> Self {
        self.model = Some(gateway);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// 纯规则分类
    pub fn classify_rules<P: AsRef<Path>>(&self, text: &str, files: &[P]) -> Classification {
        let lower = text.to_lowercase();
        let word_set = words(&lower);
        let file_exts: Vec<String> = files
            .iter()
            .filter_map(|p| extension_of(p.as_ref()))
            .collect();

        let mut scores = [0.0f32; 5];
        for (i, category) in TaskCategory::ALL.iter().enumerate() {
            let exts = extensions(*category);
            scores[i] += file_exts
                .iter()
                .filter(|e| exts.contains(&e.as_str()))
                .count() as f32
                * EXTENSION_WEIGHT;
            scores[i] += keywords(*category)
                .iter()
                .filter(|k| keyword_hit(&lower, &word_set, k))
                .count() as f32
                * KEYWORD_WEIGHT;
        }

        let total: f32 = scores.iter().sum();
        if total <= 0.0 {
            return Classification {
                category: TaskCategory::Unknown,
                confidence: 0.0,
                model_assisted: false,
            };
        }

        // 平分时取 ALL 中靠前者，保证确定性
        let mut best = 0;
        for i in 1..scores.len() {
            if scores[i] > scores[best] {
                best = i;
            }
        }
        let mut confidence = scores[best] / total;
        if total < MIN_EVIDENCE {
            confidence *= total / MIN_EVIDENCE;
        }
        Classification {
            category: TaskCategory::ALL[best],
            confidence,
            model_assisted: false,
        }
    }

    /// 规则置信度不足时调用模型；模型失败或答复无法解析时返回 Unknown
    pub async fn classify<P: AsRef<Path>>(&self, text: &str, files: &[P]) -> Classification {
        let rules = self.classify_rules(text, files);
        if rules.confidence >= self.threshold {
            return rules;
        }

        let Some(gateway) = &self.model else {
            tracing::debug!(confidence = rules.confidence, "classification below threshold");
            return Classification {
                category: TaskCategory::Unknown,
                ..rules
            };
        };

        let file_list = files
            .iter()
            .map(|p| p.as_ref().display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = if file_list.is_empty() {
            text.to_string()
        } else {
            format!("{text}\nFiles: {file_list}")
        };
        let request = BackendRequest::new(prompt)
            .with_system(CLASSIFY_INSTRUCTION)
            .with_max_tokens(8);

        let category = match gateway.invoke_request(&request, TaskCategory::Unknown).await {
            Ok(result) => parse_category_answer(&result.text),
            Err(e) => {
                tracing::warn!(error = %e, "model-assisted classification failed");
                TaskCategory::Unknown
            }
        };
        Classification {
            category,
            confidence: rules.confidence,
            model_assisted: true,
        }
    }
}

/// 取答复中的第一个单词作为类别
fn parse_category_answer(answer: &str) -> TaskCategory {
    answer
        .split(|c: char| !c.is_alphabetic())
        .find(|w| !w.is_empty())
        .and_then(|w| w.parse().ok())
        .unwrap_or(TaskCategory::Unknown)
}
