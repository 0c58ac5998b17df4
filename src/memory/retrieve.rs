//! Memory retrieval and prompt-context assembly.
//!
//! Ranks enabled items into injection-priority buckets, admits them
//! greedily within a token budget, and renders the block that gets
//! prepended to a task prompt.

use super::store::MemoryBackend;
use super::types::{MemoryItem, MemoryKind, MemoryQuery, MemoryScope};
use crate::constants::{TOKEN_ESTIMATE_CHARS_PER_TOKEN, TOKEN_ESTIMATE_ITEM_OVERHEAD};
use crate::Result;

pub const CONTEXT_HEADER: &str = "Relevant memory context:";
const CONTEXT_FOOTER: &str = "Project-scoped entries take precedence over host-scoped ones.";

/// Outcome of a retrieval: the admitted items plus the rendered block.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub items: Vec<MemoryItem>,
    pub context: String,
    pub estimated_tokens: usize,
}

/// `ceil(chars / 4)` plus a fixed per-item overhead.
pub fn estimate_tokens(item: &MemoryItem) -> usize {
    item.content.chars().count().div_ceil(TOKEN_ESTIMATE_CHARS_PER_TOKEN)
        + TOKEN_ESTIMATE_ITEM_OVERHEAD
}

/// Injection priority: project+pinned, project, host preferences, the rest.
fn bucket(item: &MemoryItem) -> u8 {
    match (item.scope, item.pinned, item.kind) {
        (MemoryScope::Project, true, _) => 0,
        (MemoryScope::Project, false, _) => 1,
        (MemoryScope::Host, _, MemoryKind::Preference) => 2,
        _ => 3,
    }
}

/// Pulls candidates from the store, reorders by injection priority, and
/// admits greedily within `token_budget`. The first item is always admitted.
/// Admitted items are marked as used via `touch_hits`.
pub async fn retrieve(
    store: &dyn MemoryBackend,
    host_id: &str,
    project_id: Option<&str>,
    search: &str,
    top_k: usize,
    token_budget: u32,
) -> Result<Retrieval> {
    let pool_size = top_k.saturating_mul(3).max(top_k);
    let mut pool = store
        .list(MemoryQuery {
            host_id: host_id.to_string(),
            project_id: project_id.map(String::from),
            enabled_only: true,
            search: trimmed_search(search),
            limit: Some(pool_size),
            ..MemoryQuery::default()
        })
        .await?;

    // The search ranks but must not starve the pool: items that share no
    // token with the query still compete on scope and recency.
    if pool.len() < pool_size {
        let fallback = store
            .list(MemoryQuery {
                host_id: host_id.to_string(),
                project_id: project_id.map(String::from),
                enabled_only: true,
                search: None,
                limit: Some(pool_size),
                ..MemoryQuery::default()
            })
            .await?;
        for item in fallback {
            if pool.len() >= pool_size {
                break;
            }
            if !pool.iter().any(|seen| seen.id == item.id) {
                pool.push(item);
            }
        }
    }

    pool.sort_by(|a, b| {
        bucket(a)
            .cmp(&bucket(b))
            .then_with(|| b.pinned.cmp(&a.pinned))
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });

    let budget = token_budget as usize;
    let mut selected = Vec::new();
    let mut used_tokens = 0usize;
    for item in pool.into_iter().take(top_k) {
        let cost = estimate_tokens(&item);
        if selected.is_empty() || used_tokens + cost <= budget {
            used_tokens += cost;
            selected.push(item);
        }
    }

    if selected.is_empty() {
        return Ok(Retrieval::default());
    }

    let ids: Vec<String> = selected.iter().map(|i| i.id.clone()).collect();
    store.touch_hits(&ids).await?;

    let context = render_context(&selected);
    Ok(Retrieval {
        items: selected,
        context,
        estimated_tokens: used_tokens,
    })
}

fn trimmed_search(search: &str) -> Option<String> {
    let trimmed = search.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// One header line, a bullet per item, and a precedence hint.
pub fn render_context(items: &[MemoryItem]) -> String {
    let mut out = String::from(CONTEXT_HEADER);
    out.push('\n');
    for item in items {
        out.push_str(&format!(
            "- [{}/{}] {}\n",
            item.scope.as_str(),
            item.kind.as_str(),
            item.content
        ));
    }
    out.push_str(CONTEXT_FOOTER);
    out
}
