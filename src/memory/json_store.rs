//! JSON-file fallback for the memory store.
//!
//! Used when the SQLite engine cannot be initialized. The whole item set is
//! held in memory behind the writer lock and rewritten atomically (temp file
//! + rename) on every mutation, so a failed write never leaves a torn file.

use super::store::{
    apply_patch, build_item, effective_limit, merge_tags, MemoryBackend,
};
use super::types::{
    normalize_content, MemoryCandidate, MemoryItem, MemoryPatch, MemoryQuery, MemoryScope,
    NewMemory,
};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

pub struct JsonMemoryStore {
    path: PathBuf,
    items: Mutex<Vec<MemoryItem>>,
}

impl JsonMemoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let items = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Discarding unreadable memory file {:?}: {e}", path);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    fn persist(&self, items: &[MemoryItem]) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(items)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn matches(item: &MemoryItem, query: &MemoryQuery) -> bool {
    if item.host_id != query.host_id {
        return false;
    }
    if let Some(project_id) = &query.project_id {
        let in_project = item.scope == MemoryScope::Project
            && item.project_id.as_deref() == Some(project_id.as_str());
        if !(item.scope == MemoryScope::Host || in_project) {
            return false;
        }
    }
    if let Some(scope) = query.scope {
        if item.scope != scope {
            return false;
        }
    }
    if let Some(kind) = query.kind {
        if item.kind != kind {
            return false;
        }
    }
    if query.enabled_only && !item.enabled {
        return false;
    }
    true
}

/// Naive relevance: number of query tokens found in content or tags.
fn score(item: &MemoryItem, tokens: &[String]) -> usize {
    let haystack = format!("{} {}", item.content, item.tags.join(" ")).to_lowercase();
    tokens.iter().filter(|t| haystack.contains(t.as_str())).count()
}

#[async_trait]
impl MemoryBackend for JsonMemoryStore {
    async fn create(&self, new: NewMemory) -> Result<MemoryItem> {
        let item = build_item(new)?;
        let mut items = self.items.lock().await;
        items.push(item.clone());
        self.persist(&items)?;
        Ok(item)
    }

    async fn update(&self, id: &str, patch: MemoryPatch) -> Result<Option<MemoryItem>> {
        let mut items = self.items.lock().await;
        let Some(item) = items.iter_mut().find(|i| i.id == id) else {
            return Ok(None);
        };
        apply_patch(item, patch)?;
        let updated = item.clone();
        self.persist(&items)?;
        Ok(Some(updated))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut items = self.items.lock().await;
        let before = items.len();
        items.retain(|i| i.id != id);
        let removed = items.len() != before;
        if removed {
            self.persist(&items)?;
        }
        Ok(removed)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        let items = self.items.lock().await;
        Ok(items.iter().find(|i| i.id == id).cloned())
    }

    async fn list(&self, query: MemoryQuery) -> Result<Vec<MemoryItem>> {
        let items = self.items.lock().await;
        let mut hits: Vec<MemoryItem> =
            items.iter().filter(|i| matches(i, &query)).cloned().collect();

        let tokens: Vec<String> = query
            .search
            .as_deref()
            .unwrap_or_default()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        if tokens.is_empty() {
            hits.sort_by(|a, b| {
                b.pinned
                    .cmp(&a.pinned)
                    .then_with(|| b.updated_at.cmp(&a.updated_at))
            });
        } else {
            hits.retain(|i| score(i, &tokens) > 0);
            hits.sort_by(|a, b| {
                score(b, &tokens)
                    .cmp(&score(a, &tokens))
                    .then_with(|| b.pinned.cmp(&a.pinned))
                    .then_with(|| b.updated_at.cmp(&a.updated_at))
            });
        }

        let limit = effective_limit(query.limit);
        Ok(hits.into_iter().skip(query.offset).take(limit).collect())
    }

    async fn upsert_auto(
        &self,
        host_id: &str,
        project_id: Option<&str>,
        candidates: Vec<MemoryCandidate>,
        source_task_id: Option<&str>,
    ) -> Result<Vec<MemoryItem>> {
        let mut items = self.items.lock().await;
        let mut affected = Vec::new();
        for candidate in candidates {
            let scoped_project = match candidate.scope {
                MemoryScope::Project => match project_id {
                    Some(p) if !p.trim().is_empty() => Some(p.to_string()),
                    _ => continue,
                },
                MemoryScope::Host => None,
            };
            let normalized = normalize_content(&candidate.content);
            let existing = items.iter_mut().find(|i| {
                i.host_id == host_id
                    && i.scope == candidate.scope
                    && i.kind == candidate.kind
                    && i.project_id == scoped_project
                    && normalize_content(&i.content) == normalized
            });
            match existing {
                Some(item) => {
                    item.tags = merge_tags(&item.tags, &candidate.tags);
                    item.confidence = item.confidence.max(candidate.confidence.clamp(0.0, 1.0));
                    item.enabled = true;
                    item.updated_at = Utc::now();
                    affected.push(item.clone());
                }
                None => {
                    let item = build_item(NewMemory {
                        host_id: host_id.to_string(),
                        project_id: scoped_project,
                        scope: candidate.scope,
                        kind: candidate.kind,
                        content: candidate.content,
                        tags: candidate.tags,
                        confidence: candidate.confidence,
                        pinned: false,
                        enabled: true,
                        source: candidate.source,
                        source_task_id: source_task_id.map(String::from),
                    })?;
                    items.push(item.clone());
                    affected.push(item);
                }
            }
        }
        self.persist(&items)?;
        Ok(affected)
    }

    async fn touch_hits(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut items = self.items.lock().await;
        let now = Utc::now();
        for item in items.iter_mut().filter(|i| ids.contains(&i.id)) {
            item.hit_count += 1;
            item.last_used_at = Some(now);
            item.updated_at = now;
        }
        self.persist(&items)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{MemoryKind, MemorySource};
    use super::*;

    fn store() -> (JsonMemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonMemoryStore::open(dir.path().join("memory-items.json")).unwrap();
        (store, dir)
    }

    fn new_item(content: &str) -> NewMemory {
        NewMemory {
            host_id: "h1".to_string(),
            project_id: Some("p1".to_string()),
            scope: MemoryScope::Project,
            kind: MemoryKind::Fact,
            content: content.to_string(),
            tags: vec![],
            confidence: 0.6,
            pinned: false,
            enabled: true,
            source: MemorySource::Manual,
            source_task_id: None,
        }
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory-items.json");
        let id = {
            let store = JsonMemoryStore::open(&path).unwrap();
            store.create(new_item("The API uses GraphQL")).await.unwrap().id
        };
        let store = JsonMemoryStore::open(&path).unwrap();
        let got = store.get(&id).await.unwrap().unwrap();
        assert_eq!(got.content, "The API uses GraphQL");
    }

    #[tokio::test]
    async fn search_filters_and_ranks_by_token_overlap() {
        let (store, _dir) = store();
        store.create(new_item("The build uses cargo workspaces")).await.unwrap();
        store.create(new_item("Deployment runs through CI")).await.unwrap();

        let hits = store
            .list(MemoryQuery {
                host_id: "h1".to_string(),
                search: Some("cargo build".to_string()),
                ..MemoryQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("cargo"));
    }

    #[tokio::test]
    async fn upsert_auto_merges_duplicates() {
        let (store, _dir) = store();
        let candidate = MemoryCandidate {
            scope: MemoryScope::Project,
            kind: MemoryKind::Fact,
            content: "The service listens on port 8080".to_string(),
            tags: vec!["net".to_string()],
            confidence: 0.5,
            source: MemorySource::AutoRule,
        };
        store
            .upsert_auto("h1", Some("p1"), vec![candidate.clone()], None)
            .await
            .unwrap();
        store
            .upsert_auto("h1", Some("p1"), vec![candidate], None)
            .await
            .unwrap();
        let all = store
            .list(MemoryQuery {
                host_id: "h1".to_string(),
                ..MemoryQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }
}
