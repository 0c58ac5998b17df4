//! Memory subsystem: durable guidance that augments prompts before a task
//! runs and grows from what the task produced.
//!
//! The manager owns the store and composes the extractors and retriever.
//! Everything else in the gateway talks to memory through it, either
//! directly (executor) or via the `memory:request` action protocol (entry
//! loop).

pub mod extract;
pub mod json_store;
pub mod markdown;
pub mod retrieve;
pub mod settings;
pub mod store;
pub mod types;

pub use json_store::JsonMemoryStore;
pub use settings::{MemorySettings, MemorySettingsPatch};
pub use store::{open_store, MemoryBackend, SqliteMemoryStore};
pub use types::{
    MemoryCandidate, MemoryItem, MemoryKind, MemoryPatch, MemoryQuery, MemoryScope, MemorySource,
    NewMemory,
};

use crate::models::TaskRequest;
use crate::runner::SessionApi;
use crate::{GatewayError, Result};
use extract::{extract_llm_candidates, llm_pass_wanted, ExtractionInput, RuleExtractor};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Invoked with the affected items after a persist, for mirroring to the
/// external store. Registered late to avoid a back-reference to the link.
pub type SyncCallback = Box<dyn Fn(Vec<MemoryItem>) + Send + Sync>;

/// Result of prompt augmentation.
#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    pub prompt: String,
    pub injected_count: usize,
    pub estimated_tokens: usize,
}

/// Everything the post-run persist pass needs from a finished task.
pub struct PostRunContext<'a> {
    pub task_id: &'a str,
    pub project_id: Option<&'a str>,
    pub project_cwd: Option<&'a Path>,
    pub title: &'a str,
    pub description: &'a str,
    pub prompt: &'a str,
    pub output: &'a str,
    pub settings_snapshot: Option<&'a MemorySettingsPatch>,
    pub session_api: Option<&'a dyn SessionApi>,
}

/// Facade over store, extractors and retriever.
pub struct MemoryManager {
    store: Arc<dyn MemoryBackend>,
    settings: RwLock<MemorySettings>,
    host_id: String,
    data_dir: PathBuf,
    rules: RuleExtractor,
    on_sync: std::sync::Mutex<Option<SyncCallback>>,
}

impl MemoryManager {
    pub fn new(
        store: Arc<dyn MemoryBackend>,
        host_id: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        settings: MemorySettings,
    ) -> Result<Self> {
        Ok(Self {
            store,
            settings: RwLock::new(settings.clamped()),
            host_id: host_id.into(),
            data_dir: data_dir.into(),
            rules: RuleExtractor::new()?,
            on_sync: std::sync::Mutex::new(None),
        })
    }

    /// Registers the `memory:sync` emitter.
    pub fn set_on_sync(&self, callback: SyncCallback) {
        *self.on_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    pub async fn get_settings(&self) -> MemorySettings {
        self.settings.read().await.clone()
    }

    pub async fn update_settings(&self, patch: &MemorySettingsPatch) -> MemorySettings {
        let mut settings = self.settings.write().await;
        *settings = settings.merged(patch);
        settings.clone()
    }

    /// Current settings with a per-task snapshot merged over them.
    async fn effective_settings(&self, snapshot: Option<&MemorySettingsPatch>) -> MemorySettings {
        let current = self.settings.read().await.clone();
        match snapshot {
            Some(patch) => current.merged(patch),
            None => current,
        }
    }

    /// Prepends the retrieved context block to `base_prompt` when injection
    /// is enabled; otherwise returns the prompt unchanged.
    pub async fn prepare_prompt(&self, task: &TaskRequest, base_prompt: &str) -> PreparedPrompt {
        let settings = self
            .effective_settings(task.metadata.memory_settings_snapshot.as_ref())
            .await;
        let passthrough = PreparedPrompt {
            prompt: base_prompt.to_string(),
            injected_count: 0,
            estimated_tokens: 0,
        };
        if !(settings.enabled && settings.prompt_injection && settings.gateway_store_enabled) {
            return passthrough;
        }

        let search = [
            task.metadata.task_title.as_deref().unwrap_or_default(),
            task.metadata.task_description.as_deref().unwrap_or_default(),
            task.prompt.as_str(),
        ]
        .join(" ");

        let retrieval = match retrieve::retrieve(
            self.store.as_ref(),
            &self.host_id,
            task.metadata.project_id.as_deref(),
            &search,
            settings.retrieval_top_k,
            settings.token_budget,
        )
        .await
        {
            Ok(retrieval) => retrieval,
            Err(e) => {
                warn!(task_id = %task.task_id, "memory retrieval failed: {e}");
                return passthrough;
            }
        };

        if retrieval.items.is_empty() {
            return passthrough;
        }
        debug!(
            task_id = %task.task_id,
            injected = retrieval.items.len(),
            tokens = retrieval.estimated_tokens,
            "injected memory context"
        );
        PreparedPrompt {
            prompt: format!("{}\n\nTask instruction:\n{base_prompt}", retrieval.context),
            injected_count: retrieval.items.len(),
            estimated_tokens: retrieval.estimated_tokens,
        }
    }

    /// Runs the extractors over a finished task, persists candidates through
    /// `upsert_auto`, mirrors them to markdown, and fires the sync callback.
    pub async fn post_run_persist(&self, ctx: PostRunContext<'_>) -> Result<Vec<MemoryItem>> {
        let settings = self.effective_settings(ctx.settings_snapshot).await;
        if !(settings.enabled && settings.auto_write && settings.gateway_store_enabled) {
            return Ok(Vec::new());
        }

        let input = ExtractionInput {
            title: ctx.title,
            description: ctx.description,
            prompt: ctx.prompt,
            output: ctx.output,
        };
        let mut candidates = self.rules.extract(&input);
        if llm_pass_wanted(settings.llm_extract_enabled, &candidates) {
            if let Some(api) = ctx.session_api {
                candidates.extend(extract_llm_candidates(api, &input).await);
            }
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let items = self
            .store
            .upsert_auto(&self.host_id, ctx.project_id, candidates, Some(ctx.task_id))
            .await?;
        if items.is_empty() {
            return Ok(items);
        }

        if let Err(e) = markdown::mirror_items(&self.data_dir, ctx.project_cwd, &items).await {
            warn!("memory markdown mirror failed: {e}");
        }

        if settings.rust_store_enabled {
            let callback = self.on_sync.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cb) = callback.as_ref() {
                cb(items.clone());
            }
        }
        info!(task_id = %ctx.task_id, count = items.len(), "persisted memory items");
        Ok(items)
    }

    /// `memory:request` action protocol. Unknown actions fail with a
    /// descriptive error; missing ids on update/delete do not.
    pub async fn handle_request(&self, action: &str, payload: &Value) -> Result<Value> {
        match action {
            "settings.get" => Ok(serde_json::to_value(self.get_settings().await)?),
            "settings.update" => {
                let patch = settings_patch(payload);
                Ok(serde_json::to_value(self.update_settings(&patch).await)?)
            }
            "items.list" => {
                let query = MemoryQuery {
                    host_id: coerce_string(payload, "hostId")
                        .unwrap_or_else(|| self.host_id.clone()),
                    project_id: coerce_string(payload, "projectId"),
                    scope: coerce_string(payload, "scope").and_then(|s| parse_scope(&s)),
                    kind: coerce_string(payload, "kind").and_then(|k| parse_kind(&k)),
                    enabled_only: coerce_bool(payload, "enabledOnly").unwrap_or(false),
                    search: coerce_string(payload, "search"),
                    offset: coerce_usize(payload, "offset").unwrap_or(0),
                    limit: coerce_usize(payload, "limit"),
                };
                let items = self.store.list(query).await?;
                Ok(json!({ "items": items }))
            }
            "items.create" => {
                let content = coerce_string(payload, "content").ok_or_else(|| {
                    GatewayError::Validation("items.create requires non-empty content".to_string())
                })?;
                let scope = coerce_string(payload, "scope")
                    .and_then(|s| parse_scope(&s))
                    .unwrap_or(MemoryScope::Host);
                let item = self
                    .store
                    .create(NewMemory {
                        host_id: self.host_id.clone(),
                        project_id: coerce_string(payload, "projectId"),
                        scope,
                        kind: coerce_string(payload, "kind")
                            .and_then(|k| parse_kind(&k))
                            .unwrap_or(MemoryKind::Fact),
                        content,
                        tags: coerce_string_list(payload, "tags"),
                        confidence: coerce_f64(payload, "confidence").unwrap_or(1.0),
                        pinned: coerce_bool(payload, "pinned").unwrap_or(false),
                        enabled: coerce_bool(payload, "enabled").unwrap_or(true),
                        source: MemorySource::Manual,
                        source_task_id: None,
                    })
                    .await?;
                Ok(serde_json::to_value(item)?)
            }
            "items.update" => {
                let Some(id) = coerce_string(payload, "id") else {
                    return Ok(Value::Null);
                };
                let patch = MemoryPatch {
                    content: coerce_string(payload, "content"),
                    tags: payload
                        .get("tags")
                        .and_then(|t| t.as_array())
                        .map(|_| coerce_string_list(payload, "tags")),
                    confidence: coerce_f64(payload, "confidence"),
                    pinned: coerce_bool(payload, "pinned"),
                    enabled: coerce_bool(payload, "enabled"),
                    kind: coerce_string(payload, "kind").and_then(|k| parse_kind(&k)),
                };
                match self.store.update(&id, patch).await? {
                    Some(item) => Ok(serde_json::to_value(item)?),
                    None => Ok(Value::Null),
                }
            }
            "items.delete" => {
                let Some(id) = coerce_string(payload, "id") else {
                    return Ok(json!({ "deleted": false }));
                };
                let deleted = self.store.delete(&id).await?;
                Ok(json!({ "deleted": deleted }))
            }
            other => Err(GatewayError::Memory {
                message: format!("unknown memory action: {other}"),
            }),
        }
    }
}

fn settings_patch(payload: &Value) -> MemorySettingsPatch {
    MemorySettingsPatch {
        enabled: coerce_bool(payload, "enabled"),
        gateway_store_enabled: coerce_bool(payload, "gatewayStoreEnabled"),
        rust_store_enabled: coerce_bool(payload, "rustStoreEnabled"),
        auto_write: coerce_bool(payload, "autoWrite"),
        prompt_injection: coerce_bool(payload, "promptInjection"),
        token_budget: coerce_f64(payload, "tokenBudget").map(|v| v.max(0.0) as u32),
        retrieval_top_k: coerce_usize(payload, "retrievalTopK"),
        llm_extract_enabled: coerce_bool(payload, "llmExtractEnabled"),
    }
}

fn parse_scope(raw: &str) -> Option<MemoryScope> {
    match raw {
        "project" => Some(MemoryScope::Project),
        "host" => Some(MemoryScope::Host),
        _ => None,
    }
}

fn parse_kind(raw: &str) -> Option<MemoryKind> {
    match raw {
        "preference" => Some(MemoryKind::Preference),
        "constraint" => Some(MemoryKind::Constraint),
        "fact" => Some(MemoryKind::Fact),
        "workflow" => Some(MemoryKind::Workflow),
        _ => None,
    }
}

// Defensive payload coercion: trimmed non-empty strings, finite numbers,
// booleans passed through.

fn coerce_string(payload: &Value, key: &str) -> Option<String> {
    let value = payload.get(key)?;
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn coerce_bool(payload: &Value, key: &str) -> Option<bool> {
    payload.get(key)?.as_bool()
}

fn coerce_f64(payload: &Value, key: &str) -> Option<f64> {
    payload.get(key)?.as_f64().filter(|v| v.is_finite())
}

fn coerce_usize(payload: &Value, key: &str) -> Option<usize> {
    coerce_f64(payload, key).filter(|v| *v >= 0.0).map(|v| v as usize)
}

fn coerce_string_list(payload: &Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
