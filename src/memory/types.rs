use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether an item applies to one project tree or to the whole host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Project,
    Host,
}

/// Semantic role of a memory item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Preference,
    Constraint,
    Fact,
    Workflow,
}

/// How an item got into the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    AutoRule,
    AutoLlm,
    Manual,
}

impl MemoryScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryScope::Project => "project",
            MemoryScope::Host => "host",
        }
    }
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Preference => "preference",
            MemoryKind::Constraint => "constraint",
            MemoryKind::Fact => "fact",
            MemoryKind::Workflow => "workflow",
        }
    }
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::AutoRule => "auto_rule",
            MemorySource::AutoLlm => "auto_llm",
            MemorySource::Manual => "manual",
        }
    }
}

/// A typed, tagged, confidence-scored piece of durable guidance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryItem {
    pub id: String,
    pub host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub scope: MemoryScope,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: f64,
    pub pinned: bool,
    pub enabled: bool,
    pub source: MemorySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub hit_count: u64,
}

/// Fields accepted when creating an item.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub host_id: String,
    pub project_id: Option<String>,
    pub scope: MemoryScope,
    pub kind: MemoryKind,
    pub content: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub pinned: bool,
    pub enabled: bool,
    pub source: MemorySource,
    pub source_task_id: Option<String>,
}

/// Fields that `update` may change. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub confidence: Option<f64>,
    pub pinned: Option<bool>,
    pub enabled: Option<bool>,
    pub kind: Option<MemoryKind>,
}

/// Store query. `host_id` is mandatory; a set `project_id` widens the
/// result to host-scope items plus that project's items.
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub host_id: String,
    pub project_id: Option<String>,
    pub scope: Option<MemoryScope>,
    pub kind: Option<MemoryKind>,
    pub enabled_only: bool,
    pub search: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// A proposed item produced by an extractor; persistence stamps the rest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCandidate {
    pub scope: MemoryScope,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: f64,
    #[serde(default = "default_candidate_source")]
    pub source: MemorySource,
}

fn default_candidate_source() -> MemorySource {
    MemorySource::AutoLlm
}

/// Lowercases and collapses whitespace; the store's duplicate key for
/// auto-written items.
pub fn normalize_content(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
