//! Markdown mirror of persisted memory items.
//!
//! Auto-written items are appended to a per-day log and folded into a
//! deduplicated summary file, under `.opencode/memory/` of either the
//! gateway data dir (host scope) or the project tree (project scope).

use super::types::{MemoryItem, MemoryScope};
use crate::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const SUMMARY_FILE: &str = "MEMORY.md";
const SUMMARY_HEADER: &str = "# Memory\n";

/// `- [<kind>] <content> (confidence=<0.00>, source=<source>[, tags=…])`
pub fn bullet_line(item: &MemoryItem) -> String {
    let mut line = format!(
        "- [{}] {} (confidence={:.2}, source={}",
        item.kind.as_str(),
        item.content,
        item.confidence,
        item.source.as_str()
    );
    if !item.tags.is_empty() {
        line.push_str(&format!(", tags={}", item.tags.join(",")));
    }
    line.push(')');
    line
}

fn memory_root(data_dir: &Path, project_cwd: Option<&Path>, scope: MemoryScope) -> PathBuf {
    match (scope, project_cwd) {
        (MemoryScope::Project, Some(cwd)) => cwd.join(".opencode").join("memory"),
        _ => data_dir.join(".opencode").join("memory").join("global"),
    }
}

/// Appends each item to today's log and to the summary (summary lines are
/// deduplicated by exact text).
pub async fn mirror_items(
    data_dir: &Path,
    project_cwd: Option<&Path>,
    items: &[MemoryItem],
) -> Result<()> {
    for scope in [MemoryScope::Host, MemoryScope::Project] {
        let scoped: Vec<&MemoryItem> = items.iter().filter(|i| i.scope == scope).collect();
        if scoped.is_empty() {
            continue;
        }
        let root = memory_root(data_dir, project_cwd, scope);
        append_daily(&root, &scoped).await?;
        update_summary(&root, &scoped).await?;
    }
    Ok(())
}

async fn append_daily(root: &Path, items: &[&MemoryItem]) -> Result<()> {
    let daily_dir = root.join("daily");
    tokio::fs::create_dir_all(&daily_dir).await?;
    let path = daily_dir.join(format!("{}.md", Utc::now().format("%Y-%m-%d")));
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    let mut block = String::new();
    for item in items {
        block.push_str(&bullet_line(item));
        block.push('\n');
    }
    file.write_all(block.as_bytes()).await?;
    Ok(())
}

async fn update_summary(root: &Path, items: &[&MemoryItem]) -> Result<()> {
    tokio::fs::create_dir_all(root).await?;
    let path = root.join(SUMMARY_FILE);
    let existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    let mut content = if existing.is_empty() {
        SUMMARY_HEADER.to_string()
    } else {
        existing
    };
    let mut changed = content.is_empty();
    for item in items {
        let line = bullet_line(item);
        if !content.lines().any(|l| l == line) {
            if !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&line);
            content.push('\n');
            changed = true;
        }
    }
    if changed {
        tokio::fs::write(&path, content).await?;
    }
    Ok(())
}
