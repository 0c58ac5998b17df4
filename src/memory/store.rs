//! Durable keyed store of memory items.
//!
//! The preferred backend is an embedded SQLite database with an FTS5 index
//! over content and tags; when the engine cannot be initialized the store
//! transparently downgrades to a JSON file (`json_store`). All mutations
//! serialize behind a single-writer lock; a mutation either fully lands or
//! not at all.

use super::json_store::JsonMemoryStore;
use super::types::{
    normalize_content, MemoryCandidate, MemoryItem, MemoryPatch, MemoryQuery, MemoryScope,
    MemorySource, NewMemory,
};
use crate::constants::MEMORY_LIST_LIMIT_CAP;
use crate::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Storage operations every backend provides. Mutations are atomic.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn create(&self, new: NewMemory) -> Result<MemoryItem>;
    async fn update(&self, id: &str, patch: MemoryPatch) -> Result<Option<MemoryItem>>;
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn get(&self, id: &str) -> Result<Option<MemoryItem>>;
    async fn list(&self, query: MemoryQuery) -> Result<Vec<MemoryItem>>;

    /// Insert-or-merge for extractor output. An existing item with the same
    /// `(host, project, scope, kind, normalized content)` absorbs the
    /// candidate: tag set union, `max` confidence, re-enabled, touched.
    async fn upsert_auto(
        &self,
        host_id: &str,
        project_id: Option<&str>,
        candidates: Vec<MemoryCandidate>,
        source_task_id: Option<&str>,
    ) -> Result<Vec<MemoryItem>>;

    /// Marks items as used: bumps `hit_count`, stamps `last_used_at`.
    async fn touch_hits(&self, ids: &[String]) -> Result<()>;
}

/// Opens the SQLite backend, falling back to the JSON file store when the
/// engine cannot be initialized.
pub fn open_store(data_dir: &Path) -> Result<Arc<dyn MemoryBackend>> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("memory.sqlite3");
    match SqliteMemoryStore::open(&db_path) {
        Ok(store) => {
            info!("Memory store backed by SQLite at {:?}", db_path);
            Ok(Arc::new(store))
        }
        Err(e) => {
            let json_path = data_dir.join("memory-items.json");
            warn!(
                "SQLite memory store unavailable ({e}); falling back to {:?}",
                json_path
            );
            Ok(Arc::new(JsonMemoryStore::open(&json_path)?))
        }
    }
}

/// Builds a full item from creation fields. Shared by both backends.
pub(super) fn build_item(new: NewMemory) -> Result<MemoryItem> {
    let content = new.content.trim().to_string();
    if content.is_empty() {
        return Err(GatewayError::Validation(
            "memory content cannot be empty".to_string(),
        ));
    }
    if new.scope == MemoryScope::Project
        && new.project_id.as_deref().map_or(true, |p| p.trim().is_empty())
    {
        return Err(GatewayError::Validation(
            "project-scoped memory requires a projectId".to_string(),
        ));
    }
    let now = Utc::now();
    Ok(MemoryItem {
        id: uuid::Uuid::new_v4().to_string(),
        host_id: new.host_id,
        project_id: if new.scope == MemoryScope::Host {
            None
        } else {
            new.project_id
        },
        scope: new.scope,
        kind: new.kind,
        content,
        tags: normalize_tags(new.tags),
        confidence: new.confidence.clamp(0.0, 1.0),
        pinned: new.pinned,
        enabled: new.enabled,
        source: new.source,
        source_task_id: new.source_task_id,
        created_at: now,
        updated_at: now,
        last_used_at: None,
        hit_count: 0,
    })
}

/// Applies an update patch in place; `created_at` and `hit_count` never move.
pub(super) fn apply_patch(item: &mut MemoryItem, patch: MemoryPatch) -> Result<()> {
    if let Some(content) = patch.content {
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(GatewayError::Validation(
                "memory content cannot be empty".to_string(),
            ));
        }
        item.content = content;
    }
    if let Some(tags) = patch.tags {
        item.tags = normalize_tags(tags);
    }
    if let Some(confidence) = patch.confidence {
        item.confidence = confidence.clamp(0.0, 1.0);
    }
    if let Some(pinned) = patch.pinned {
        item.pinned = pinned;
    }
    if let Some(enabled) = patch.enabled {
        item.enabled = enabled;
    }
    if let Some(kind) = patch.kind {
        item.kind = kind;
    }
    item.updated_at = Utc::now();
    Ok(())
}

pub(super) fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

pub(super) fn merge_tags(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = existing.to_vec();
    merged.extend(incoming.iter().cloned());
    normalize_tags(merged)
}

pub(super) fn effective_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(MEMORY_LIST_LIMIT_CAP)
        .min(MEMORY_LIST_LIMIT_CAP)
}

/// SQLite-backed store. One connection, guarded by a single-writer lock.
pub struct SqliteMemoryStore {
    conn: Mutex<Connection>,
    #[allow(dead_code)]
    path: PathBuf,
}

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
CREATE TABLE IF NOT EXISTS memory_items (
    id TEXT PRIMARY KEY,
    host_id TEXT NOT NULL,
    project_id TEXT,
    scope TEXT NOT NULL,
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    normalized TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL DEFAULT 0.5,
    pinned INTEGER NOT NULL DEFAULT 0,
    enabled INTEGER NOT NULL DEFAULT 1,
    source TEXT NOT NULL,
    source_task_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_used_at TEXT,
    hit_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_memory_items_lookup
    ON memory_items(host_id, scope, kind, normalized);
CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts
    USING fts5(content, tags, content='memory_items', content_rowid='rowid');
CREATE TRIGGER IF NOT EXISTS memory_items_ai AFTER INSERT ON memory_items BEGIN
    INSERT INTO memory_fts(rowid, content, tags)
    VALUES (new.rowid, new.content, new.tags);
END;
CREATE TRIGGER IF NOT EXISTS memory_items_ad AFTER DELETE ON memory_items BEGIN
    INSERT INTO memory_fts(memory_fts, rowid, content, tags)
    VALUES ('delete', old.rowid, old.content, old.tags);
END;
CREATE TRIGGER IF NOT EXISTS memory_items_au AFTER UPDATE ON memory_items BEGIN
    INSERT INTO memory_fts(memory_fts, rowid, content, tags)
    VALUES ('delete', old.rowid, old.content, old.tags);
    INSERT INTO memory_fts(rowid, content, tags)
    VALUES (new.rowid, new.content, new.tags);
END;
"#;

// Qualified so the FTS join cannot make `content`/`tags` ambiguous.
const ITEM_COLUMNS: &str = "memory_items.id, memory_items.host_id, memory_items.project_id, \
     memory_items.scope, memory_items.kind, memory_items.content, memory_items.tags, \
     memory_items.confidence, memory_items.pinned, memory_items.enabled, memory_items.source, \
     memory_items.source_task_id, memory_items.created_at, memory_items.updated_at, \
     memory_items.last_used_at, memory_items.hit_count";

impl SqliteMemoryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    fn insert_item(conn: &Connection, item: &MemoryItem) -> Result<()> {
        conn.execute(
            "INSERT INTO memory_items (id, host_id, project_id, scope, kind, content, normalized, \
             tags, confidence, pinned, enabled, source, source_task_id, created_at, updated_at, \
             last_used_at, hit_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                item.id,
                item.host_id,
                item.project_id,
                item.scope.as_str(),
                item.kind.as_str(),
                item.content,
                normalize_content(&item.content),
                serde_json::to_string(&item.tags)?,
                item.confidence,
                item.pinned as i64,
                item.enabled as i64,
                item.source.as_str(),
                item.source_task_id,
                item.created_at.to_rfc3339(),
                item.updated_at.to_rfc3339(),
                item.last_used_at.map(|t| t.to_rfc3339()),
                item.hit_count as i64,
            ],
        )?;
        Ok(())
    }

    fn store_item(conn: &Connection, item: &MemoryItem) -> Result<()> {
        conn.execute(
            "UPDATE memory_items SET content = ?2, normalized = ?3, tags = ?4, confidence = ?5, \
             pinned = ?6, enabled = ?7, kind = ?8, updated_at = ?9, last_used_at = ?10, \
             hit_count = ?11 WHERE id = ?1",
            params![
                item.id,
                item.content,
                normalize_content(&item.content),
                serde_json::to_string(&item.tags)?,
                item.confidence,
                item.pinned as i64,
                item.enabled as i64,
                item.kind.as_str(),
                item.updated_at.to_rfc3339(),
                item.last_used_at.map(|t| t.to_rfc3339()),
                item.hit_count as i64,
            ],
        )?;
        Ok(())
    }

    fn get_by_id(conn: &Connection, id: &str) -> Result<Option<MemoryItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM memory_items WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_item(row)?)),
            None => Ok(None),
        }
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> Result<MemoryItem> {
    let scope: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let source: String = row.get(10)?;
    let tags: String = row.get(6)?;
    Ok(MemoryItem {
        id: row.get(0)?,
        host_id: row.get(1)?,
        project_id: row.get(2)?,
        scope: parse_scope(&scope)?,
        kind: parse_kind(&kind)?,
        content: row.get(5)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        confidence: row.get(7)?,
        pinned: row.get::<_, i64>(8)? != 0,
        enabled: row.get::<_, i64>(9)? != 0,
        source: parse_source(&source)?,
        source_task_id: row.get(11)?,
        created_at: parse_ts(&row.get::<_, String>(12)?)?,
        updated_at: parse_ts(&row.get::<_, String>(13)?)?,
        last_used_at: row
            .get::<_, Option<String>>(14)?
            .map(|s| parse_ts(&s))
            .transpose()?,
        hit_count: row.get::<_, i64>(15)?.max(0) as u64,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GatewayError::Storage {
            message: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn parse_scope(raw: &str) -> Result<MemoryScope> {
    match raw {
        "project" => Ok(MemoryScope::Project),
        "host" => Ok(MemoryScope::Host),
        other => Err(GatewayError::Storage {
            message: format!("bad scope {other:?}"),
        }),
    }
}

fn parse_kind(raw: &str) -> Result<super::types::MemoryKind> {
    use super::types::MemoryKind;
    match raw {
        "preference" => Ok(MemoryKind::Preference),
        "constraint" => Ok(MemoryKind::Constraint),
        "fact" => Ok(MemoryKind::Fact),
        "workflow" => Ok(MemoryKind::Workflow),
        other => Err(GatewayError::Storage {
            message: format!("bad kind {other:?}"),
        }),
    }
}

fn parse_source(raw: &str) -> Result<MemorySource> {
    match raw {
        "auto_rule" => Ok(MemorySource::AutoRule),
        "auto_llm" => Ok(MemorySource::AutoLlm),
        "manual" => Ok(MemorySource::Manual),
        other => Err(GatewayError::Storage {
            message: format!("bad source {other:?}"),
        }),
    }
}

/// Turns free text into an FTS5 OR-query of quoted tokens. Returns `None`
/// when nothing searchable remains.
fn fts_query(search: &str) -> Option<String> {
    let tokens: Vec<String> = search
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

#[async_trait]
impl MemoryBackend for SqliteMemoryStore {
    async fn create(&self, new: NewMemory) -> Result<MemoryItem> {
        let item = build_item(new)?;
        let conn = self.conn.lock().await;
        Self::insert_item(&conn, &item)?;
        Ok(item)
    }

    async fn update(&self, id: &str, patch: MemoryPatch) -> Result<Option<MemoryItem>> {
        let conn = self.conn.lock().await;
        let Some(mut item) = Self::get_by_id(&conn, id)? else {
            return Ok(None);
        };
        apply_patch(&mut item, patch)?;
        Self::store_item(&conn, &item)?;
        Ok(Some(item))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute("DELETE FROM memory_items WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        let conn = self.conn.lock().await;
        Self::get_by_id(&conn, id)
    }

    async fn list(&self, query: MemoryQuery) -> Result<Vec<MemoryItem>> {
        let conn = self.conn.lock().await;
        let mut clauses = vec!["memory_items.host_id = ?".to_string()];
        let mut values: Vec<String> = vec![query.host_id.clone()];

        if let Some(project_id) = &query.project_id {
            clauses.push(
                "(memory_items.scope = 'host' OR (memory_items.scope = 'project' \
                 AND memory_items.project_id = ?))"
                    .to_string(),
            );
            values.push(project_id.clone());
        }
        if let Some(scope) = query.scope {
            clauses.push("memory_items.scope = ?".to_string());
            values.push(scope.as_str().to_string());
        }
        if let Some(kind) = query.kind {
            clauses.push("memory_items.kind = ?".to_string());
            values.push(kind.as_str().to_string());
        }
        if query.enabled_only {
            clauses.push("memory_items.enabled = 1".to_string());
        }

        let fts = query.search.as_deref().and_then(fts_query);
        let limit = effective_limit(query.limit);
        let sql = if let Some(match_expr) = &fts {
            clauses.push("memory_fts MATCH ?".to_string());
            values.push(match_expr.clone());
            format!(
                "SELECT {ITEM_COLUMNS} FROM memory_items \
                 JOIN memory_fts ON memory_fts.rowid = memory_items.rowid \
                 WHERE {} \
                 ORDER BY bm25(memory_fts), memory_items.pinned DESC, \
                 memory_items.updated_at DESC LIMIT {} OFFSET {}",
                clauses.join(" AND "),
                limit,
                query.offset
            )
        } else {
            format!(
                "SELECT {ITEM_COLUMNS} FROM memory_items WHERE {} \
                 ORDER BY memory_items.pinned DESC, memory_items.updated_at DESC \
                 LIMIT {} OFFSET {}",
                clauses.join(" AND "),
                limit,
                query.offset
            )
        };

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(row_to_item(row)?);
        }
        Ok(items)
    }

    async fn upsert_auto(
        &self,
        host_id: &str,
        project_id: Option<&str>,
        candidates: Vec<MemoryCandidate>,
        source_task_id: Option<&str>,
    ) -> Result<Vec<MemoryItem>> {
        let conn = self.conn.lock().await;
        let mut affected = Vec::new();
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM memory_items WHERE host_id = ?1 AND scope = ?2 \
             AND kind = ?3 AND normalized = ?4 AND ifnull(project_id, '') = ?5"
        );
        for candidate in candidates {
            let scoped_project = match candidate.scope {
                MemoryScope::Project => match project_id {
                    Some(p) if !p.trim().is_empty() => Some(p.to_string()),
                    // Project-scoped candidates without a project are dropped
                    _ => continue,
                },
                MemoryScope::Host => None,
            };
            let normalized = normalize_content(&candidate.content);
            let mut stmt = conn.prepare(&sql)?;
            let existing = stmt
                .query(params![
                    host_id,
                    candidate.scope.as_str(),
                    candidate.kind.as_str(),
                    normalized,
                    scoped_project.clone().unwrap_or_default(),
                ])?
                .next()?
                .map(row_to_item)
                .transpose()?;
            drop(stmt);

            match existing {
                Some(mut item) => {
                    item.tags = merge_tags(&item.tags, &candidate.tags);
                    item.confidence = item.confidence.max(candidate.confidence.clamp(0.0, 1.0));
                    item.enabled = true;
                    item.updated_at = Utc::now();
                    Self::store_item(&conn, &item)?;
                    affected.push(item);
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
                    Self::insert_item(&conn, &item)?;
                    affected.push(item);
                }
            }
        }
        Ok(affected)
    }

    async fn touch_hits(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        for id in ids {
            conn.execute(
                "UPDATE memory_items SET hit_count = hit_count + 1, last_used_at = ?2, \
                 updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )?;
        }
        Ok(())
    }
}
