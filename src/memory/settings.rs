use crate::constants::{
    MEMORY_TOKEN_BUDGET_MAX, MEMORY_TOKEN_BUDGET_MIN, MEMORY_TOP_K_MAX, MEMORY_TOP_K_MIN,
};
use serde::{Deserialize, Serialize};

/// Tunables governing the memory subsystem.
///
/// Every consumer sees a clamped view; token budget and top-k are forced
/// into their documented ranges no matter where the values came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemorySettings {
    pub enabled: bool,
    pub gateway_store_enabled: bool,
    /// Mirror writes to the external store via `memory:sync`.
    pub rust_store_enabled: bool,
    pub auto_write: bool,
    pub prompt_injection: bool,
    pub token_budget: u32,
    pub retrieval_top_k: usize,
    pub llm_extract_enabled: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            gateway_store_enabled: true,
            rust_store_enabled: false,
            auto_write: true,
            prompt_injection: true,
            token_budget: 2_000,
            retrieval_top_k: 8,
            llm_extract_enabled: false,
        }
    }
}

impl MemorySettings {
    pub fn clamped(mut self) -> Self {
        self.token_budget = self
            .token_budget
            .clamp(MEMORY_TOKEN_BUDGET_MIN, MEMORY_TOKEN_BUDGET_MAX);
        self.retrieval_top_k = self.retrieval_top_k.clamp(MEMORY_TOP_K_MIN, MEMORY_TOP_K_MAX);
        self
    }

    /// Applies a partial override, then re-clamps.
    pub fn merged(&self, patch: &MemorySettingsPatch) -> Self {
        let mut merged = self.clone();
        if let Some(v) = patch.enabled {
            merged.enabled = v;
        }
        if let Some(v) = patch.gateway_store_enabled {
            merged.gateway_store_enabled = v;
        }
        if let Some(v) = patch.rust_store_enabled {
            merged.rust_store_enabled = v;
        }
        if let Some(v) = patch.auto_write {
            merged.auto_write = v;
        }
        if let Some(v) = patch.prompt_injection {
            merged.prompt_injection = v;
        }
        if let Some(v) = patch.token_budget {
            merged.token_budget = v;
        }
        if let Some(v) = patch.retrieval_top_k {
            merged.retrieval_top_k = v;
        }
        if let Some(v) = patch.llm_extract_enabled {
            merged.llm_extract_enabled = v;
        }
        merged.clamped()
    }
}

/// Partial settings, used for `settings.update` payloads and per-task
/// snapshots carried in task metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemorySettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_store_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rust_store_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_write: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_injection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_extract_enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_forces_documented_ranges() {
        let settings = MemorySettings {
            token_budget: 50,
            retrieval_top_k: 900,
            ..MemorySettings::default()
        }
        .clamped();
        assert_eq!(settings.token_budget, 200);
        assert_eq!(settings.retrieval_top_k, 50);

        let settings = MemorySettings {
            token_budget: 999_999,
            retrieval_top_k: 0,
            ..MemorySettings::default()
        }
        .clamped();
        assert_eq!(settings.token_budget, 6_000);
        assert_eq!(settings.retrieval_top_k, 1);
    }

    #[test]
    fn merge_applies_only_present_fields() {
        let base = MemorySettings::default();
        let patch = MemorySettingsPatch {
            prompt_injection: Some(false),
            token_budget: Some(10_000),
            ..MemorySettingsPatch::default()
        };
        let merged = base.merged(&patch);
        assert!(!merged.prompt_injection);
        assert_eq!(merged.token_budget, 6_000);
        assert_eq!(merged.retrieval_top_k, base.retrieval_top_k);
        assert!(merged.enabled);
    }
}
