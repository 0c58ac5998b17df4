//! Memory candidate extraction.
//!
//! Two passes over a finished task: a deterministic rule pass that matches
//! sentences against fixed vocabularies, and an optional LLM pass that asks
//! a runner session for a JSON array of candidates when the rule pass came
//! up short. Both are pure with respect to the store; persistence happens
//! in the manager.

use super::types::{MemoryCandidate, MemoryKind, MemoryScope, MemorySource};
use crate::constants::{
    EXTRACT_MAX_CANDIDATES, FACT_SENTENCE_WINDOW, LLM_EXTRACT_POLL_MS, LLM_EXTRACT_TIMEOUT_SECS,
};
use crate::runner::SessionApi;
use crate::{GatewayError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Task text the extractors look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionInput<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub prompt: &'a str,
    pub output: &'a str,
}

const PREFERENCE_CONFIDENCE: f64 = 0.78;
const CONSTRAINT_CONFIDENCE: f64 = 0.84;
const WORKFLOW_CONFIDENCE: f64 = 0.70;
const FACT_CONFIDENCE: f64 = 0.64;

const MIN_SENTENCE_CHARS: usize = 12;
const MAX_SENTENCE_CHARS: usize = 400;

/// Sentence classifier with one compiled vocabulary per memory kind.
pub struct RuleExtractor {
    preference: Regex,
    constraint: Regex,
    workflow: Regex,
    fact: Regex,
}

impl RuleExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            preference: Regex::new(
                r"(?i)\b(i prefer|we prefer|preferred|i like|we like|always use|favorite|i want you to|please always)\b",
            )
            .map_err(bad_pattern)?,
            constraint: Regex::new(
                r"(?i)\b(must not|must\b|never\b|required|do not|don't|forbidden|not allowed|only use|avoid)\b",
            )
            .map_err(bad_pattern)?,
            workflow: Regex::new(
                r"(?i)\b(first .+ then|step \d|workflow|before (committing|merging|deploying|pushing)|run .+ (before|after)|after (building|testing))\b",
            )
            .map_err(bad_pattern)?,
            fact: Regex::new(
                r"(?i)\b(uses|depends on|is built with|written in|lives in|located at|is configured|runs on)\b",
            )
            .map_err(bad_pattern)?,
        })
    }

    /// Classifies task text into at most eight deduplicated candidates.
    pub fn extract(&self, input: &ExtractionInput<'_>) -> Vec<MemoryCandidate> {
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();

        let request_text = [input.title, input.description, input.prompt].join("\n");
        for sentence in sentences(&request_text) {
            if let Some(candidate) = self.classify(&sentence, false) {
                push_unique(&mut candidates, &mut seen, candidate);
            }
        }
        for sentence in sentences(input.output).take(FACT_SENTENCE_WINDOW) {
            if let Some(candidate) = self.classify(&sentence, true) {
                push_unique(&mut candidates, &mut seen, candidate);
            }
        }

        candidates.truncate(EXTRACT_MAX_CANDIDATES);
        candidates
    }

    /// At most one kind per sentence. Facts are only mined from output.
    fn classify(&self, sentence: &str, from_output: bool) -> Option<MemoryCandidate> {
        let len = sentence.chars().count();
        if !(MIN_SENTENCE_CHARS..=MAX_SENTENCE_CHARS).contains(&len) {
            return None;
        }
        let (scope, kind, confidence) = if self.constraint.is_match(sentence) {
            (MemoryScope::Project, MemoryKind::Constraint, CONSTRAINT_CONFIDENCE)
        } else if self.preference.is_match(sentence) {
            (MemoryScope::Host, MemoryKind::Preference, PREFERENCE_CONFIDENCE)
        } else if self.workflow.is_match(sentence) {
            (MemoryScope::Project, MemoryKind::Workflow, WORKFLOW_CONFIDENCE)
        } else if from_output && self.fact.is_match(sentence) {
            (MemoryScope::Project, MemoryKind::Fact, FACT_CONFIDENCE)
        } else {
            return None;
        };
        Some(MemoryCandidate {
            scope,
            kind,
            content: sentence.to_string(),
            tags: Vec::new(),
            confidence,
            source: MemorySource::AutoRule,
        })
    }
}

fn bad_pattern(e: regex::Error) -> GatewayError {
    GatewayError::ConfigurationError(format!("invalid extractor pattern: {e}"))
}

fn sentences(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(['.', '!', '?', '\n'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn push_unique(
    candidates: &mut Vec<MemoryCandidate>,
    seen: &mut HashSet<(MemoryScope, MemoryKind, String)>,
    candidate: MemoryCandidate,
) {
    let key = (
        candidate.scope,
        candidate.kind,
        candidate.content.to_lowercase(),
    );
    if seen.insert(key) {
        candidates.push(candidate);
    }
}

/// The LLM pass only runs when the rule pass produced too few or too weak
/// candidates.
pub fn llm_pass_wanted(llm_extract_enabled: bool, rule_candidates: &[MemoryCandidate]) -> bool {
    if !llm_extract_enabled {
        return false;
    }
    if rule_candidates.len() < 3 {
        return true;
    }
    let mean = rule_candidates.iter().map(|c| c.confidence).sum::<f64>()
        / rule_candidates.len() as f64;
    mean < 0.65
}

const LLM_INSTRUCTION: &str = "Review the task exchange below and extract durable guidance \
worth remembering for future tasks. Respond with only a JSON array; each element must be an \
object with fields: scope (\"project\" or \"host\"), kind (\"preference\", \"constraint\", \
\"fact\" or \"workflow\"), content (one concise sentence), tags (array of short strings), \
confidence (number between 0 and 1). Return [] when nothing qualifies.";

/// Asks a runner session for candidates, polling the assistant reply for up
/// to 25 seconds. Every failure path collapses to an empty list.
pub async fn extract_llm_candidates(
    api: &dyn SessionApi,
    input: &ExtractionInput<'_>,
) -> Vec<MemoryCandidate> {
    match try_extract_llm(api, input).await {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!("LLM memory extraction failed: {e}");
            Vec::new()
        }
    }
}

async fn try_extract_llm(
    api: &dyn SessionApi,
    input: &ExtractionInput<'_>,
) -> Result<Vec<MemoryCandidate>> {
    let session_id = api.create_session("memory-extraction").await?.ok_or_else(|| {
        GatewayError::Memory {
            message: "runner returned no session for extraction".to_string(),
        }
    })?;

    let prompt = format!(
        "{LLM_INSTRUCTION}\n\nTask title: {}\nTask description: {}\n\nPrompt:\n{}\n\nOutput:\n{}",
        input.title, input.description, input.prompt, input.output
    );
    api.prompt_async(&session_id, None, &prompt).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(LLM_EXTRACT_TIMEOUT_SECS);
    let mut candidates = Vec::new();
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(LLM_EXTRACT_POLL_MS)).await;
        let messages = api.list_messages(&session_id).await.unwrap_or_default();
        if let Some(reply) = messages
            .iter()
            .rev()
            .find(|m| m.role == "assistant" && !m.text.trim().is_empty())
        {
            candidates = parse_candidates(&reply.text);
            if !candidates.is_empty() {
                break;
            }
        }
    }
    // Timed out without a parseable reply: emit nothing rather than guesses.
    if let Err(e) = api.abort_session(&session_id).await {
        debug!("extraction session abort failed: {e}");
    }
    Ok(candidates)
}

/// Recovers a JSON array from an assistant reply: a fenced ```json block if
/// present, otherwise the substring from the first `[` to the last `]`.
pub fn parse_candidates(reply: &str) -> Vec<MemoryCandidate> {
    let body = fenced_json(reply)
        .or_else(|| bracketed(reply))
        .unwrap_or_default();
    let Ok(values) = serde_json::from_str::<Vec<serde_json::Value>>(&body) else {
        return Vec::new();
    };
    let mut candidates: Vec<MemoryCandidate> = values
        .into_iter()
        .filter_map(|v| validate_candidate(&v))
        .collect();
    candidates.truncate(EXTRACT_MAX_CANDIDATES);
    candidates
}

fn fenced_json(text: &str) -> Option<String> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

fn bracketed(text: &str) -> Option<String> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| text[start..=end].to_string())
}

fn validate_candidate(value: &serde_json::Value) -> Option<MemoryCandidate> {
    let scope = match value.get("scope")?.as_str()? {
        "project" => MemoryScope::Project,
        "host" => MemoryScope::Host,
        _ => return None,
    };
    let kind = match value.get("kind")?.as_str()? {
        "preference" => MemoryKind::Preference,
        "constraint" => MemoryKind::Constraint,
        "fact" => MemoryKind::Fact,
        "workflow" => MemoryKind::Workflow,
        _ => return None,
    };
    let content = value.get("content")?.as_str()?.trim().to_string();
    if content.is_empty() {
        return None;
    }
    let confidence = value
        .get("confidence")
        .and_then(|c| c.as_f64())
        .filter(|c| c.is_finite())
        .unwrap_or(0.6)
        .clamp(0.0, 1.0);
    let tags = value
        .get("tags")
        .and_then(|t| t.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str())
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Some(MemoryCandidate {
        scope,
        kind,
        content,
        tags,
        confidence,
        source: MemorySource::AutoLlm,
    })
}
